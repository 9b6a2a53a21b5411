//! Wire DTOs
//!
//! Request and response bodies as they appear on the wire, separate from the
//! stored records so the storage encoding can evolve independently. All
//! field names follow RFC 8555's camelCase.

use serde::{Deserialize, Serialize};

use crate::links::LinkBuilder;
use crate::problem::ProblemDocument;
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifierDto {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl From<&store::Identifier> for IdentifierDto {
    fn from(id: &store::Identifier) -> Self {
        Self {
            kind: id.kind.clone(),
            value: id.value.clone(),
        }
    }
}

// =============================================================================
// Accounts
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub contact: Option<Vec<String>>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    #[serde(default)]
    pub only_return_existing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub status: store::AccountStatus,
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    /// URL of the orders list for this account.
    pub orders: String,
}

pub fn account_response(links: &LinkBuilder, account: &store::Account) -> AccountResponse {
    AccountResponse {
        status: account.status,
        contact: account.contact.clone(),
        terms_of_service_agreed: account.terms_of_service_agreed,
        orders: links.account_orders(&account.id),
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreateRequest {
    pub identifiers: Vec<IdentifierDto>,
    #[serde(default)]
    pub not_before: Option<String>,
    #[serde(default)]
    pub not_after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderFinalizeRequest {
    /// base64url (unpadded) DER CSR.
    pub csr: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub status: store::OrderStatus,
    pub expires: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    pub identifiers: Vec<IdentifierDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDocument>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrdersListResponse {
    pub orders: Vec<String>,
}

pub fn order_response(links: &LinkBuilder, order: &store::Order) -> OrderResponse {
    OrderResponse {
        status: order.status,
        expires: order.expires.to_rfc3339(),
        not_before: order.not_before.map(|t| t.to_rfc3339()),
        not_after: order.not_after.map(|t| t.to_rfc3339()),
        identifiers: order.identifiers.iter().map(IdentifierDto::from).collect(),
        error: order.error.clone(),
        authorizations: order.authz_ids.iter().map(|id| links.authz(id)).collect(),
        finalize: links.finalize_order(&order.id),
        certificate: order
            .certificate_id
            .as_deref()
            .map(|id| links.certificate(id)),
    }
}

// =============================================================================
// Authorizations and challenges
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeDto {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: store::ChallengeStatus,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthzResponse {
    pub status: store::AuthzStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub identifier: IdentifierDto,
    pub challenges: Vec<ChallengeDto>,
    pub wildcard: bool,
}

/// Challenge ids are `authz id ‖ two hex digits of the index`.
pub fn challenge_id(authz_id: &str, index: usize) -> String {
    format!("{authz_id}{index:02x}")
}

pub fn challenge_dto(
    links: &LinkBuilder,
    authz_id: &str,
    index: usize,
    challenge: &store::Challenge,
) -> ChallengeDto {
    ChallengeDto {
        url: links.challenge(&challenge_id(authz_id, index)),
        kind: challenge.kind.clone(),
        status: challenge.status,
        token: challenge.token.clone(),
        validated: challenge.validated.map(|t| t.to_rfc3339()),
    }
}

pub fn authz_response(links: &LinkBuilder, authz: &store::Authorization) -> AuthzResponse {
    AuthzResponse {
        status: authz.status,
        expires: authz.expires.map(|t| t.to_rfc3339()),
        identifier: IdentifierDto::from(&authz.identifier),
        challenges: authz
            .challenges
            .iter()
            .enumerate()
            .map(|(i, c)| challenge_dto(links, &authz.id, i, c))
            .collect(),
        wildcard: false,
    }
}

// =============================================================================
// Directory
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    pub terms_of_service: String,
    pub website: String,
    pub caa_identities: Vec<String>,
    pub external_account_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub new_authz: String,
    pub revoke_cert: String,
    pub key_change: String,
    pub meta: DirectoryMeta,
}
