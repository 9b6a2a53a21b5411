//! RFC 8555 problem documents
//!
//! Every engine operation that can fail returns a [`Problem`]. The router
//! serializes problems as RFC 7807 bodies with the ACME error URN namespace.
//! `serverInternal` problems additionally carry a correlation id: the client
//! only ever sees `Error ID <uuid>` while the full cause is logged server-side
//! under the same id.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

const ERR_NS: &str = "urn:ietf:params:acme:error:";

/// ACME error kinds recognized by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    ServerInternal,
    Malformed,
    BadNonce,
    BadCsr,
    AgreementRequired,
    ExternalAccountRequired,
    Connection,
    Unauthorized,
    InvalidContact,
    UnsupportedContact,
    AccountDoesNotExist,
    BadRevocationReason,
    AlreadyRevoked,
    OrderNotReady,
    BadPublicKey,
    RejectedIdentifier,
}

impl ProblemKind {
    /// URN suffix as registered for ACME.
    pub fn urn_suffix(self) -> &'static str {
        match self {
            Self::ServerInternal => "serverInternal",
            Self::Malformed => "malformed",
            Self::BadNonce => "badNonce",
            Self::BadCsr => "badCSR",
            Self::AgreementRequired => "agreementRequired",
            Self::ExternalAccountRequired => "externalAccountRequired",
            Self::Connection => "connection",
            Self::Unauthorized => "unauthorized",
            Self::InvalidContact => "invalidContact",
            Self::UnsupportedContact => "unsupportedContact",
            Self::AccountDoesNotExist => "accountDoesNotExist",
            Self::BadRevocationReason => "badRevocationReason",
            Self::AlreadyRevoked => "alreadyRevoked",
            Self::OrderNotReady => "orderNotReady",
            Self::BadPublicKey => "badPublicKey",
            Self::RejectedIdentifier => "rejectedIdentifier",
        }
    }

    pub fn urn(self) -> String {
        format!("{ERR_NS}{}", self.urn_suffix())
    }
}

/// Identifier attached to a problem or subproblem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Wire form of a problem document. Stored verbatim on failed orders and
/// produced for every error response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProblemDocument {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty", default)]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identifier: Option<ProblemIdentifier>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub subproblems: Vec<ProblemDocument>,
}

/// A typed ACME protocol error.
#[derive(Debug, Error)]
#[error("{}: {detail}", .kind.urn())]
pub struct Problem {
    pub kind: ProblemKind,
    pub detail: String,
    pub status: StatusCode,
    pub identifier: Option<ProblemIdentifier>,
    pub subproblems: Vec<Problem>,
    /// Present only on `serverInternal`; matches the `Error ID` in `detail`.
    pub correlation_id: Option<String>,
    /// Wrapped cause, logged under the correlation id, never serialized.
    source: Option<anyhow::Error>,
}

impl Problem {
    fn new(kind: ProblemKind, status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status,
            identifier: None,
            subproblems: Vec::new(),
            correlation_id: None,
            source: None,
        }
    }

    /// Wrap an internal failure. The cause is never surfaced to the client.
    pub fn server_internal(source: impl Into<anyhow::Error>) -> Self {
        let id = Uuid::new_v4().to_string();
        let mut p = Self::new(
            ProblemKind::ServerInternal,
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error ID {id}"),
        );
        p.correlation_id = Some(id);
        p.source = Some(source.into());
        p
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Malformed, StatusCode::BAD_REQUEST, detail)
    }

    /// `malformed` with a 404 status, for public lookups of unknown ids.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Malformed, StatusCode::NOT_FOUND, detail)
    }

    pub fn unsupported_media_type(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemKind::Malformed,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            detail,
        )
    }

    /// For wired-but-unimplemented endpoints (revocation, key change).
    pub fn not_implemented(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Malformed, StatusCode::NOT_IMPLEMENTED, detail)
    }

    pub fn bad_nonce(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::BadNonce, StatusCode::BAD_REQUEST, detail)
    }

    pub fn bad_csr(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::BadCsr, StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Unauthorized, StatusCode::FORBIDDEN, detail)
    }

    pub fn account_does_not_exist(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemKind::AccountDoesNotExist,
            StatusCode::BAD_REQUEST,
            detail,
        )
    }

    pub fn order_not_ready(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::OrderNotReady, StatusCode::FORBIDDEN, detail)
    }

    pub fn bad_public_key(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::BadPublicKey, StatusCode::BAD_REQUEST, detail)
    }

    pub fn agreement_required(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::AgreementRequired, StatusCode::FORBIDDEN, detail)
    }

    pub fn rejected_identifier(identifier: ProblemIdentifier, detail: impl Into<String>) -> Self {
        let sub = Self {
            identifier: Some(identifier.clone()),
            ..Self::new(
                ProblemKind::RejectedIdentifier,
                StatusCode::BAD_REQUEST,
                format!("{} is a forbidden domain", identifier.value),
            )
        };
        let mut p = Self::new(ProblemKind::RejectedIdentifier, StatusCode::BAD_REQUEST, detail);
        p.subproblems.push(sub);
        p
    }

    pub fn is_internal(&self) -> bool {
        self.kind == ProblemKind::ServerInternal
    }

    /// Wire representation.
    pub fn document(&self) -> ProblemDocument {
        ProblemDocument {
            kind: self.kind.urn(),
            detail: self.detail.clone(),
            status: Some(self.status.as_u16()),
            identifier: self.identifier.clone(),
            subproblems: self.subproblems.iter().map(Problem::document).collect(),
        }
    }
}

impl From<crate::store::StoreError> for Problem {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::NotFound => {
                Problem::unauthorized("")
            }
            other => Problem::server_internal(other),
        }
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        if let Some(id) = &self.correlation_id {
            error!(
                error_id = %id,
                cause = ?self.source,
                "internal error while handling ACME request"
            );
        } else {
            warn!(
                kind = self.kind.urn_suffix(),
                detail = %self.detail,
                status = self.status.as_u16(),
                "ACME request rejected"
            );
        }

        let body = serde_json::to_vec(&self.document()).unwrap_or_default();
        (
            self.status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_problems_carry_a_correlation_id() {
        let p = Problem::server_internal(anyhow::anyhow!("db on fire"));
        let id = p.correlation_id.as_deref().expect("correlation id");
        assert!(p.detail.contains(id));
        assert_eq!(p.status, StatusCode::INTERNAL_SERVER_ERROR);
        // The cause must never leak into the wire document.
        let doc = p.document();
        assert!(!doc.detail.contains("db on fire"));
        assert_eq!(doc.kind, "urn:ietf:params:acme:error:serverInternal");
    }

    #[test]
    fn document_omits_empty_fields() {
        let p = Problem::unauthorized("");
        let json = serde_json::to_value(p.document()).unwrap();
        assert_eq!(json["type"], "urn:ietf:params:acme:error:unauthorized");
        assert!(json.get("detail").is_none());
        assert!(json.get("subproblems").is_none());
    }

    #[test]
    fn rejected_identifier_nests_a_subproblem() {
        let p = Problem::rejected_identifier(
            ProblemIdentifier {
                kind: "dns".into(),
                value: "evil.example".into(),
            },
            "identifier not allowed",
        );
        let doc = p.document();
        assert_eq!(doc.subproblems.len(), 1);
        assert_eq!(
            doc.subproblems[0].identifier.as_ref().unwrap().value,
            "evil.example"
        );
    }
}
