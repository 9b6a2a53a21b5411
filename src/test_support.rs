//! Helpers for exercising the JWS gate and engine from tests: a P-256
//! account key that can produce signed flattened-JWS envelopes the way a
//! real ACME client would.

use der::Encode as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x509_cert::builder::{Builder, RequestBuilder};
use x509_cert::name::Name;

use crate::util::b64_encode;

/// An ES256 account keypair for tests.
pub struct SigningAccount {
    key: SigningKey,
}

impl SigningAccount {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Public key as a JWK object.
    pub fn jwk(&self) -> serde_json::Value {
        let point = self.key.verifying_key().to_encoded_point(false);
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": b64_encode(point.x().unwrap()),
            "y": b64_encode(point.y().unwrap()),
        })
    }

    /// RFC 7638 thumbprint of the public key.
    pub fn thumbprint(&self) -> String {
        let point = self.key.verifying_key().to_encoded_point(false);
        let canonical = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            b64_encode(point.x().unwrap()),
            b64_encode(point.y().unwrap()),
        );
        b64_encode(&Sha256::digest(canonical.as_bytes()))
    }

    /// The HTTP-01 key authorization for a token.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint())
    }

    fn sign(&self, message: &str) -> String {
        let signature: Signature = self.key.sign(message.as_bytes());
        b64_encode(&signature.to_bytes())
    }

    fn envelope(&self, protected: serde_json::Value, payload: &[u8]) -> String {
        let protected_b64 = b64_encode(protected.to_string().as_bytes());
        let payload_b64 = if payload.is_empty() {
            String::new()
        } else {
            b64_encode(payload)
        };
        let signature = self.sign(&format!("{protected_b64}.{payload_b64}"));
        serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": signature,
        })
        .to_string()
    }

    /// Flattened JWS authenticated with the inline JWK (new-account style).
    pub fn signed_jwk_request(&self, url: &str, nonce: &str, payload: &[u8]) -> String {
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

    /// Flattened JWS authenticated by account URL (kid style).
    pub fn signed_kid_request(
        &self,
        kid: &str,
        url: &str,
        nonce: &str,
        payload: &[u8],
    ) -> String {
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

/// The JWK as it would be stored for the account.
pub fn jwk_value(account: &SigningAccount) -> serde_json::Value {
    account.jwk()
}

/// DER CSR for `domain`, signed with a throwaway P-256 key.
pub fn sample_csr_der(domain: &str) -> Vec<u8> {
    let signer = SigningKey::random(&mut OsRng);
    let subject = format!("CN={domain}").parse::<Name>().unwrap();
    let builder = RequestBuilder::new(subject, &signer).unwrap();
    builder
        .build::<p256::ecdsa::DerSignature>()
        .unwrap()
        .to_der()
        .unwrap()
}
