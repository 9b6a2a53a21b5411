//! Resource URL construction
//!
//! Single source of truth for the URL space under `<base>/acme`. Handlers
//! never format paths themselves; they ask the [`LinkBuilder`], which is also
//! what the JWS gate uses to compare a request's claimed `url` header against
//! the path actually requested.

use crate::dto::{Directory, DirectoryMeta};

/// Builds absolute URLs for every ACME resource.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    /// Absolute base including the `/acme` prefix, no trailing slash.
    base: String,
    meta: DirectoryMeta,
}

impl LinkBuilder {
    /// `base_url` is the externally visible origin (plus optional path);
    /// the `/acme` segment is appended here.
    pub fn new(base_url: &str, meta: DirectoryMeta) -> Self {
        let trimmed = base_url.trim_end_matches('/');
        Self {
            base: format!("{trimmed}/acme"),
            meta,
        }
    }

    fn abs(&self, relative: &str) -> String {
        format!("{}/{relative}", self.base)
    }

    pub fn directory(&self) -> String {
        self.abs("directory")
    }

    pub fn new_nonce(&self) -> String {
        self.abs("new-nonce")
    }

    pub fn new_account(&self) -> String {
        self.abs("new-account")
    }

    pub fn account(&self, account_id: &str) -> String {
        self.abs(&format!("account/{account_id}"))
    }

    pub fn account_orders(&self, account_id: &str) -> String {
        self.abs(&format!("account/{account_id}/orders"))
    }

    pub fn new_order(&self) -> String {
        self.abs("new-order")
    }

    pub fn order(&self, order_id: &str) -> String {
        self.abs(&format!("order/{order_id}"))
    }

    pub fn finalize_order(&self, order_id: &str) -> String {
        self.abs(&format!("order/{order_id}/finalize"))
    }

    pub fn new_authz(&self) -> String {
        self.abs("new-authz")
    }

    pub fn authz(&self, authz_id: &str) -> String {
        self.abs(&format!("authz/{authz_id}"))
    }

    pub fn challenge(&self, challenge_id: &str) -> String {
        self.abs(&format!("chall/{challenge_id}"))
    }

    pub fn certificate(&self, cert_id: &str) -> String {
        self.abs(&format!("certificate/{cert_id}"))
    }

    pub fn revoke_cert(&self) -> String {
        self.abs("revoke-cert")
    }

    pub fn key_change(&self) -> String {
        self.abs("key-change")
    }

    /// Compare the path of an incoming request against the `url` a JWS
    /// claims to be for. A reverse proxy in front of the server may present
    /// a different origin than the listener sees, so the comparison is done
    /// by joining the request path onto the configured base (with its
    /// `/acme` suffix stripped, since the request path carries it).
    pub fn url_matches_request(&self, request_path: &str, claimed: &str) -> bool {
        let base_without_acme = self.base.trim_end_matches("/acme");
        format!("{base_without_acme}{request_path}") == claimed
    }

    /// Directory document with configured metadata.
    pub fn directory_document(&self) -> Directory {
        Directory {
            new_nonce: self.new_nonce(),
            new_account: self.new_account(),
            new_order: self.new_order(),
            new_authz: self.new_authz(),
            revoke_cert: self.revoke_cert(),
            key_change: self.key_change(),
            meta: self.meta.clone(),
        }
    }
}
