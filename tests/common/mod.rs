//! Shared harness for the integration tests: a P-256 ACME client account
//! that signs real JWS envelopes, and a full server instance (router, store,
//! nonce service, mock upstream issuer) bound to an ephemeral port.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use der::Encode as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x509_cert::builder::{Builder, RequestBuilder};
use x509_cert::name::Name;

use acmespider::dto::DirectoryMeta;
use acmespider::engine::AcmeEngine;
use acmespider::handlers::{router, AppState};
use acmespider::http01::Http01Verifier;
use acmespider::issuer::UpstreamIssuer;
use acmespider::jws::JwsGate;
use acmespider::links::LinkBuilder;
use acmespider::nonce::NonceService;
use acmespider::store::Store;

pub fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// An ES256 ACME client keypair.
pub struct ClientKey {
    key: SigningKey,
}

impl ClientKey {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn jwk(&self) -> serde_json::Value {
        let point = self.key.verifying_key().to_encoded_point(false);
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": b64(point.x().unwrap()),
            "y": b64(point.y().unwrap()),
        })
    }

    pub fn thumbprint(&self) -> String {
        let point = self.key.verifying_key().to_encoded_point(false);
        let canonical = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            b64(point.x().unwrap()),
            b64(point.y().unwrap()),
        );
        b64(&Sha256::digest(canonical.as_bytes()))
    }

    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint())
    }

    fn sign(&self, message: &str) -> String {
        let signature: Signature = self.key.sign(message.as_bytes());
        b64(&signature.to_bytes())
    }

    fn envelope(&self, protected: serde_json::Value, payload: &[u8]) -> String {
        let protected_b64 = b64(protected.to_string().as_bytes());
        let payload_b64 = if payload.is_empty() {
            String::new()
        } else {
            b64(payload)
        };
        let signature = self.sign(&format!("{protected_b64}.{payload_b64}"));
        serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": signature,
        })
        .to_string()
    }

    pub fn jwk_request(&self, url: &str, nonce: &str, payload: &[u8]) -> String {
        self.envelope(
            serde_json::json!({
                "alg": "ES256",
                "jwk": self.jwk(),
                "nonce": nonce,
                "url": url,
            }),
            payload,
        )
    }

    pub fn kid_request(&self, kid: &str, url: &str, nonce: &str, payload: &[u8]) -> String {
        self.envelope(
            serde_json::json!({
                "alg": "ES256",
                "kid": kid,
                "nonce": nonce,
                "url": url,
            }),
            payload,
        )
    }
}

/// DER CSR for `domain`, signed with a throwaway key.
pub fn csr_der(domain: &str) -> Vec<u8> {
    let signer = SigningKey::random(&mut OsRng);
    let subject = format!("CN={domain}").parse::<Name>().unwrap();
    let builder = RequestBuilder::new(subject, &signer).unwrap();
    builder
        .build::<p256::ecdsa::DerSignature>()
        .unwrap()
        .to_der()
        .unwrap()
}

/// Upstream issuer double: returns a locally generated chain without any
/// network traffic.
pub struct MockIssuer {
    chain: String,
}

impl MockIssuer {
    pub fn new() -> Self {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let params = rcgen::CertificateParams::new(vec!["mock.issued".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { chain: cert.pem() }
    }
}

#[async_trait]
impl UpstreamIssuer for MockIssuer {
    async fn obtain_for_csr(
        &self,
        _csr_der: &[u8],
        _not_before: Option<DateTime<Utc>>,
        _not_after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<String> {
        Ok(self.chain.clone())
    }
}

/// A running acmespider instance for tests.
pub struct TestServer {
    pub base_url: String,
    pub store: Arc<Store>,
    pub client: reqwest::Client,
    _storage: tempfile::TempDir,
}

impl TestServer {
    /// Boot the full router on an ephemeral port with a mock issuer.
    pub async fn start() -> Self {
        let storage = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(storage.path().join("acmespider.db")).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        let links = LinkBuilder::new(
            &base_url,
            DirectoryMeta {
                terms_of_service: "https://s.test/tos".into(),
                website: "https://s.test".into(),
                caa_identities: vec!["s.test".into()],
                external_account_required: false,
            },
        );
        let nonces = Arc::new(NonceService::new());
        let verifier = Http01Verifier::new(store.clone()).unwrap();
        let engine = AcmeEngine::new(
            store.clone(),
            links.clone(),
            Arc::new(MockIssuer::new()),
            verifier,
        );
        let gate = JwsGate::new(store.clone(), nonces.clone(), links.clone());

        let state = Arc::new(AppState {
            engine,
            gate,
            nonces,
            links,
        });
        let app = router(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            client: reqwest::Client::new(),
            _storage: storage,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Fetch a fresh nonce from the new-nonce endpoint.
    pub async fn nonce(&self) -> String {
        let response = self
            .client
            .head(self.url("/acme/new-nonce"))
            .send()
            .await
            .unwrap();
        response
            .headers()
            .get("Replay-Nonce")
            .expect("Replay-Nonce header")
            .to_str()
            .unwrap()
            .to_string()
    }

    /// POST a signed body to an ACME URL.
    pub async fn post(&self, url: &str, body: String) -> reqwest::Response {
        self.client
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// Register an account; returns its kid (account URL).
    pub async fn register_account(&self, key: &ClientKey) -> String {
        let nonce = self.nonce().await;
        let url = self.url("/acme/new-account");
        let body = key.jwk_request(
            &url,
            &nonce,
            br#"{"contact":["mailto:a@x"],"termsOfServiceAgreed":true}"#,
        );
        let response = self.post(&url, body).await;
        assert_eq!(response.status(), 201, "account creation failed");
        response
            .headers()
            .get("Location")
            .expect("Location header")
            .to_str()
            .unwrap()
            .to_string()
    }

    /// POST-as-GET helper returning the response.
    pub async fn post_as_get(&self, key: &ClientKey, kid: &str, url: &str) -> reqwest::Response {
        let nonce = self.nonce().await;
        let body = key.kid_request(kid, url, &nonce, b"");
        self.post(url, body).await
    }
}

/// A plain HTTP responder that answers HTTP-01 challenges for one account
/// key. Returns the host:port to use as the order's identifier value.
pub async fn spawn_challenge_responder(key_authorization_suffix: String) -> String {
    use axum::extract::Path as AxumPath;
    use axum::routing::get as axum_get;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = axum::Router::new().route(
        "/.well-known/acme-challenge/:token",
        axum_get(move |AxumPath(token): AxumPath<String>| {
            let suffix = key_authorization_suffix.clone();
            async move { format!("{token}.{suffix}") }
        }),
    );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("{addr}")
}
