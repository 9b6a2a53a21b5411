//! Signed-request gate
//!
//! Every mutating ACME endpoint receives a flattened JWS (RFC 8555 §6). The
//! gate parses and verifies the envelope, consumes the replay nonce, checks
//! the claimed `url` header against the request path, and resolves the
//! caller's account. Handlers only ever see the verified payload.

use std::sync::Arc;

use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use jsonwebtoken::{crypto, Algorithm, DecodingKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::links::LinkBuilder;
use crate::nonce::NonceService;
use crate::problem::Problem;
use crate::store::{Store, StoreError};
use crate::util::{b64_decode, b64_encode};

/// Which key reference an endpoint accepts in the protected header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Only an inline `jwk` (new-account).
    JwkOnly,
    /// Only a `kid` naming an existing account.
    KidOnly,
    /// Either form.
    Either,
}

/// Signature algorithms an account may register and sign with.
const ALLOWED_ALGORITHMS: &[&str] = &[
    "EdDSA", "ES256", "ES384", "ES512", "RS256", "RS384", "RS512",
];

const MIN_RSA_MODULUS_BYTES: usize = 2048 / 8;

/// Flattened JWS body. The optional fields exist only so their presence can
/// be rejected: an unprotected `header` and the general multi-signature form
/// are both forbidden.
#[derive(Debug, Deserialize)]
struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
    #[serde(default)]
    header: Option<serde_json::Value>,
    #[serde(default)]
    signatures: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default)]
    pub jwk: Option<Jwk>,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub url: String,
}

/// Outcome of a successful gate pass.
#[derive(Debug)]
pub struct VerifiedRequest {
    /// Decoded payload bytes. Empty for POST-as-GET.
    pub payload: Vec<u8>,
    pub header: ProtectedHeader,
    /// Resolved account id; `None` when the request authenticated with an
    /// inline JWK (account creation).
    pub account_id: Option<String>,
}

impl VerifiedRequest {
    /// Deserialize the payload, mapping JSON errors to `malformed`.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, Problem> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| Problem::malformed(format!("Invalid request payload: {err}")))
    }

    /// Enforce the POST-as-GET marker: an empty payload string.
    pub fn require_post_as_get(&self) -> Result<(), Problem> {
        if self.payload.is_empty() {
            Ok(())
        } else {
            Err(Problem::malformed(
                "Invalid POST-as-GET request: expected signed request with empty payload",
            ))
        }
    }
}

/// Validates incoming JWS envelopes for the router.
pub struct JwsGate {
    store: Arc<Store>,
    nonces: Arc<NonceService>,
    links: LinkBuilder,
}

impl JwsGate {
    pub fn new(store: Arc<Store>, nonces: Arc<NonceService>, links: LinkBuilder) -> Self {
        Self {
            store,
            nonces,
            links,
        }
    }

    /// Run the full RFC 8555 §6 request check. `request_path` is the path
    /// component the router actually matched.
    pub fn verify(
        &self,
        content_type: Option<&str>,
        request_path: &str,
        body: &[u8],
        policy: KeyPolicy,
    ) -> Result<VerifiedRequest, Problem> {
        let essence = content_type
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        if essence != "application/jose+json" {
            return Err(Problem::unsupported_media_type(
                "Content-Type must be application/jose+json",
            ));
        }

        let jws = parse_flattened(body)?;

        let header_bytes = b64_decode(&jws.protected)
            .map_err(|_| Problem::malformed("Invalid protected header base64"))?;
        let header: ProtectedHeader = serde_json::from_slice(&header_bytes)
            .map_err(|_| Problem::malformed("Invalid protected header"))?;

        check_algorithm(&header.alg, header.jwk.as_ref())?;

        let kid_provided = header.kid.as_deref().is_some_and(|k| !k.is_empty());
        let jwk_provided = header.jwk.is_some();

        if kid_provided && jwk_provided {
            return Err(Problem::malformed(
                "JWS contained both a KID and a JWK - these are mutually exclusive",
            ));
        }
        if !kid_provided && !jwk_provided {
            return Err(Problem::malformed("JWS did not provide a KID or a JWK"));
        }
        if kid_provided && policy == KeyPolicy::JwkOnly {
            return Err(Problem::malformed(
                "JWS provided a KID, but this endpoint requires a JWK",
            ));
        }
        if jwk_provided && policy == KeyPolicy::KidOnly {
            return Err(Problem::malformed(
                "JWS provided a JWK, but this endpoint requires a KID",
            ));
        }

        let (jwk, account_id) = if let Some(jwk) = header.jwk.clone() {
            (jwk, None)
        } else {
            let kid = header.kid.as_deref().unwrap_or_default();
            let (jwk, id) = self.lookup_kid(kid)?;
            (jwk, Some(id))
        };

        let algorithm = signing_algorithm(&header.alg)?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|err| Problem::bad_public_key(format!("Unusable account key: {err}")))?;

        let message = format!("{}.{}", jws.protected, jws.payload);
        match crypto::verify(&jws.signature, message.as_bytes(), &key, algorithm) {
            Ok(true) => {}
            Ok(false) => return Err(Problem::unauthorized("Invalid JWS signature")),
            Err(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    return Err(Problem::unauthorized("Invalid JWS signature"))
                }
                _ => return Err(Problem::server_internal(err)),
            },
        }

        self.nonces
            .validate_and_consume(&header.nonce)
            .map_err(|err| {
                debug!(error = %err, "nonce rejected");
                Problem::bad_nonce("nonce is invalid")
            })?;

        if header.url.is_empty() {
            return Err(Problem::malformed("JWS header did not contain a URL"));
        }
        if !self.links.url_matches_request(request_path, &header.url) {
            return Err(Problem::malformed(
                "URL in JWS header did not match the URL requested",
            ));
        }

        let payload = if jws.payload.is_empty() {
            Vec::new()
        } else {
            b64_decode(&jws.payload)
                .map_err(|_| Problem::malformed("Invalid payload base64"))?
        };

        Ok(VerifiedRequest {
            payload,
            header,
            account_id,
        })
    }

    /// Resolve a `kid` to the registered key. The kid must be the absolute
    /// account URL; its suffix is the account id.
    fn lookup_kid(&self, kid: &str) -> Result<(Jwk, String), Problem> {
        let prefix = self.links.account("");
        let id = kid
            .strip_prefix(&prefix)
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .ok_or_else(|| Problem::unauthorized("KID is not tied to a valid account"))?;

        let jwk_json = match self.store.get_account_key(id) {
            Ok(v) => v,
            Err(StoreError::NotFound) => {
                return Err(Problem::unauthorized("KID is not tied to a valid account"))
            }
            Err(err) => return Err(Problem::server_internal(err)),
        };

        let jwk: Jwk = serde_json::from_value(jwk_json)
            .map_err(|err| Problem::server_internal(err))?;
        Ok((jwk, id.to_string()))
    }
}

fn parse_flattened(body: &[u8]) -> Result<FlattenedJws, Problem> {
    if body.first() != Some(&b'{') {
        return Err(Problem::malformed("Invalid JSON"));
    }

    let jws: FlattenedJws =
        serde_json::from_slice(body).map_err(|_| Problem::malformed("Invalid JSON"))?;

    if jws.header.is_some() {
        return Err(Problem::malformed(
            "JWS contained disallowed 'header' field",
        ));
    }
    if jws.signatures.as_ref().is_some_and(|s| !s.is_empty()) {
        return Err(Problem::malformed(
            "JWS contained multiple signatures which is not allowed",
        ));
    }

    Ok(jws)
}

fn check_algorithm(alg: &str, jwk: Option<&Jwk>) -> Result<(), Problem> {
    if !ALLOWED_ALGORITHMS.contains(&alg) {
        return Err(Problem::malformed(format!(
            "Supplied JWS algorithm of {alg} is not valid"
        )));
    }

    // For RSA, a key that is present must carry a big-enough modulus.
    if matches!(alg, "RS256" | "RS384" | "RS512") {
        if let Some(jwk) = jwk {
            let AlgorithmParameters::RSA(params) = &jwk.algorithm else {
                return Err(Problem::malformed(
                    "JWK key type does not match the RSA signing algorithm",
                ));
            };
            let modulus = b64_decode(&params.n)
                .map_err(|_| Problem::malformed("JWK carried an undecodable RSA modulus"))?;
            if modulus.len() < MIN_RSA_MODULUS_BYTES {
                return Err(Problem::malformed(format!(
                    "RSA key was too small: {} bits, minimum is {} bits",
                    modulus.len() * 8,
                    MIN_RSA_MODULUS_BYTES * 8
                )));
            }
        }
    }

    Ok(())
}

fn signing_algorithm(alg: &str) -> Result<Algorithm, Problem> {
    match alg {
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "EdDSA" => Ok(Algorithm::EdDSA),
        // Accepted by the protocol but no P-521 backend is available.
        "ES512" => Err(Problem::bad_public_key(
            "the ES512 algorithm is not supported by this server",
        )),
        other => Err(Problem::malformed(format!(
            "Supplied JWS algorithm of {other} is not valid"
        ))),
    }
}

/// RFC 7638 JWK thumbprint: SHA-256 over the canonical JSON of the key's
/// required members. Member order within each key type is lexical and the
/// JSON carries no whitespace; both are what make the digest canonical.
pub fn jwk_thumbprint(jwk: &Jwk) -> Result<String, Problem> {
    let canonical = match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(p) => {
            let crv = curve_name(&p.curve)?;
            format!(
                r#"{{"crv":"{crv}","kty":"EC","x":"{}","y":"{}"}}"#,
                p.x, p.y
            )
        }
        AlgorithmParameters::RSA(p) => {
            format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, p.e, p.n)
        }
        AlgorithmParameters::OctetKeyPair(p) => {
            let crv = curve_name(&p.curve)?;
            format!(r#"{{"crv":"{crv}","kty":"OKP","x":"{}"}}"#, p.x)
        }
        _ => {
            return Err(Problem::bad_public_key(
                "key type does not support thumbprinting",
            ))
        }
    };

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(b64_encode(&digest))
}

fn curve_name(curve: &EllipticCurve) -> Result<&'static str, Problem> {
    match curve {
        EllipticCurve::P256 => Ok("P-256"),
        EllipticCurve::P384 => Ok("P-384"),
        EllipticCurve::P521 => Ok("P-521"),
        EllipticCurve::Ed25519 => Ok("Ed25519"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::DirectoryMeta;
    use crate::test_support::{jwk_value, SigningAccount};

    fn gate() -> (tempfile::TempDir, JwsGate, Arc<Store>, Arc<NonceService>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("acmespider.db")).unwrap());
        let nonces = Arc::new(NonceService::new());
        let links = LinkBuilder::new("https://s.test", DirectoryMeta::default());
        let gate = JwsGate::new(store.clone(), nonces.clone(), links);
        (dir, gate, store, nonces)
    }

    #[test]
    fn accepts_a_well_formed_jwk_request() {
        let (_dir, gate, _store, nonces) = gate();
        let signer = SigningAccount::generate();
        let nonce = nonces.generate().unwrap();

        let body = signer.signed_jwk_request(
            "https://s.test/acme/new-account",
            &nonce,
            br#"{"termsOfServiceAgreed":true}"#,
        );

        let verified = gate
            .verify(
                Some("application/jose+json"),
                "/acme/new-account",
                body.as_bytes(),
                KeyPolicy::JwkOnly,
            )
            .expect("request should verify");

        assert!(verified.account_id.is_none());
        assert_eq!(verified.payload, br#"{"termsOfServiceAgreed":true}"#);
        assert!(verified.header.jwk.is_some());
    }

    #[test]
    fn rejects_wrong_content_type() {
        let (_dir, gate, _store, _nonces) = gate();
        let err = gate
            .verify(Some("application/json"), "/acme/new-account", b"{}", KeyPolicy::JwkOnly)
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn rejects_unprotected_header_and_multisignature_forms() {
        let (_dir, gate, _store, _nonces) = gate();

        let with_header =
            br#"{"protected":"e30","payload":"","signature":"sig","header":{"alg":"none"}}"#;
        let err = gate
            .verify(
                Some("application/jose+json"),
                "/acme/new-account",
                with_header,
                KeyPolicy::JwkOnly,
            )
            .unwrap_err();
        assert!(err.detail.contains("disallowed 'header'"));

        let multi = br#"{"protected":"e30","payload":"","signature":"s","signatures":[{}]}"#;
        let err = gate
            .verify(
                Some("application/jose+json"),
                "/acme/new-account",
                multi,
                KeyPolicy::JwkOnly,
            )
            .unwrap_err();
        assert!(err.detail.contains("multiple signatures"));
    }

    #[test]
    fn rejects_nonce_reuse() {
        let (_dir, gate, _store, nonces) = gate();
        let signer = SigningAccount::generate();
        let nonce = nonces.generate().unwrap();

        let body = signer.signed_jwk_request("https://s.test/acme/new-account", &nonce, b"{}");
        gate.verify(
            Some("application/jose+json"),
            "/acme/new-account",
            body.as_bytes(),
            KeyPolicy::JwkOnly,
        )
        .expect("first use verifies");

        // Same nonce again, new signature: must be rejected.
        let body = signer.signed_jwk_request("https://s.test/acme/new-account", &nonce, b"{}");
        let err = gate
            .verify(
                Some("application/jose+json"),
                "/acme/new-account",
                body.as_bytes(),
                KeyPolicy::JwkOnly,
            )
            .unwrap_err();
        assert_eq!(err.kind, crate::problem::ProblemKind::BadNonce);
    }

    #[test]
    fn rejects_url_mismatch() {
        let (_dir, gate, _store, nonces) = gate();
        let signer = SigningAccount::generate();
        let nonce = nonces.generate().unwrap();

        let body = signer.signed_jwk_request("https://s.test/acme/new-order", &nonce, b"{}");
        let err = gate
            .verify(
                Some("application/jose+json"),
                "/acme/new-account",
                body.as_bytes(),
                KeyPolicy::JwkOnly,
            )
            .unwrap_err();
        assert!(err.detail.contains("did not match"));
    }

    #[test]
    fn rejects_tampered_payload() {
        let (_dir, gate, _store, nonces) = gate();
        let signer = SigningAccount::generate();
        let nonce = nonces.generate().unwrap();

        let body = signer.signed_jwk_request("https://s.test/acme/new-account", &nonce, b"{}");
        let tampered = body.replace(
            "\"payload\":\"e30\"",
            &format!("\"payload\":\"{}\"", b64_encode(br#"{"evil":true}"#)),
        );
        assert_ne!(body, tampered, "replacement must have applied");

        let err = gate
            .verify(
                Some("application/jose+json"),
                "/acme/new-account",
                tampered.as_bytes(),
                KeyPolicy::JwkOnly,
            )
            .unwrap_err();
        assert_eq!(err.detail, "Invalid JWS signature");
    }

    #[test]
    fn policy_rejects_wrong_key_reference() {
        let (_dir, gate, _store, nonces) = gate();
        let signer = SigningAccount::generate();

        let nonce = nonces.generate().unwrap();
        let body = signer.signed_jwk_request("https://s.test/acme/order/o1", &nonce, b"");
        let err = gate
            .verify(
                Some("application/jose+json"),
                "/acme/order/o1",
                body.as_bytes(),
                KeyPolicy::KidOnly,
            )
            .unwrap_err();
        assert!(err.detail.contains("requires a KID"));
    }

    #[test]
    fn kid_request_resolves_the_registered_account() {
        let (_dir, gate, store, nonces) = gate();
        let signer = SigningAccount::generate();

        store
            .create_account(
                crate::store::Account {
                    id: "acct-1".into(),
                    status: crate::store::AccountStatus::Valid,
                    contact: vec![],
                    terms_of_service_agreed: true,
                    orders: vec![],
                },
                jwk_value(&signer),
                "tp".into(),
            )
            .unwrap();

        let nonce = nonces.generate().unwrap();
        let body = signer.signed_kid_request(
            "https://s.test/acme/account/acct-1",
            "https://s.test/acme/order/o1",
            &nonce,
            b"",
        );

        let verified = gate
            .verify(
                Some("application/jose+json"),
                "/acme/order/o1",
                body.as_bytes(),
                KeyPolicy::KidOnly,
            )
            .expect("kid request should verify");
        assert_eq!(verified.account_id.as_deref(), Some("acct-1"));
        verified.require_post_as_get().unwrap();
    }

    #[test]
    fn unknown_kid_is_unauthorized() {
        let (_dir, gate, _store, nonces) = gate();
        let signer = SigningAccount::generate();

        let nonce = nonces.generate().unwrap();
        let body = signer.signed_kid_request(
            "https://s.test/acme/account/ghost",
            "https://s.test/acme/order/o1",
            &nonce,
            b"",
        );

        let err = gate
            .verify(
                Some("application/jose+json"),
                "/acme/order/o1",
                body.as_bytes(),
                KeyPolicy::KidOnly,
            )
            .unwrap_err();
        assert_eq!(err.kind, crate::problem::ProblemKind::Unauthorized);
    }

    #[test]
    fn small_rsa_keys_are_rejected() {
        // 1024-bit modulus: below the 2048-bit floor.
        let n = b64_encode(&[0xabu8; 128]);
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "RSA", "n": n, "e": "AQAB"
        }))
        .unwrap();

        let err = check_algorithm("RS256", Some(&jwk)).unwrap_err();
        assert!(err.detail.contains("too small"));

        let n = b64_encode(&[0xabu8; 256]);
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "RSA", "n": n, "e": "AQAB"
        }))
        .unwrap();
        assert!(check_algorithm("RS256", Some(&jwk)).is_ok());
    }

    #[test]
    fn es512_is_refused_with_bad_public_key() {
        assert!(check_algorithm("ES512", None).is_ok());
        let err = signing_algorithm("ES512").unwrap_err();
        assert_eq!(err.kind, crate::problem::ProblemKind::BadPublicKey);
    }

    #[test]
    fn thumbprint_matches_rfc7638_vector() {
        // The RSA example key from RFC 7638 §3.1.
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "RSA",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB",
            "alg": "RS256"
        }))
        .unwrap();

        assert_eq!(
            jwk_thumbprint(&jwk).unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }
}
