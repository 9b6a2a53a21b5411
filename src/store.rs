//! Persistent object store
//!
//! All protocol state lives here: accounts, their JWKs, orders,
//! authorizations and issued certificates, in five logical buckets keyed by
//! id. At rest the whole store is one JSON database file under the configured
//! storage path, rewritten atomically (write-to-temp, rename) on every
//! mutation. A single mutex serializes read-modify-write cycles, which is
//! what makes the authz advisory lock's test-and-set sound.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::problem::ProblemDocument;

/// Storage failure. `NotFound` is the only variant callers branch on; every
/// other failure is fatal to the request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub status: AccountStatus,
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    /// Order ids issued under this account, in creation order.
    pub orders: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub not_after: Option<DateTime<Utc>>,
    pub identifiers: Vec<Identifier>,
    /// Same length and order as `identifiers`.
    pub authz_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub certificate_id: Option<String>,
    /// Set when finalization fails.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ProblemDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthzStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub validated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub id: String,
    pub order_id: String,
    pub account_id: String,
    pub status: AuthzStatus,
    pub identifier: Identifier,
    /// Challenge ids are derived from the authz id and the index into this
    /// list, so the list itself is authoritative.
    pub challenges: Vec<Challenge>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires: Option<DateTime<Utc>>,
    /// Advisory flag: a verification loop is running for this authz.
    #[serde(rename = "_locked", default)]
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: String,
    pub order_id: String,
    pub account_id: String,
    /// PEM chain, leaf first. Write-once.
    pub chain_pem: String,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreInner {
    accounts: HashMap<String, Account>,
    /// Account id -> JWK (verbatim JSON as registered).
    account_keys: HashMap<String, serde_json::Value>,
    /// RFC 7638 SHA-256 thumbprint (base64url) -> account id.
    account_thumbprints: HashMap<String, String>,
    orders: HashMap<String, Order>,
    authzs: HashMap<String, Authorization>,
    certificates: HashMap<String, CertificateRecord>,
}

/// On-disk document store for all ACME state.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "creating new store database");
                StoreInner::default()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Serialize the full state and atomically replace the database file.
    fn persist(&self, inner: &StoreInner) -> StoreResult<()> {
        let bytes = serde_json::to_vec(inner)?;
        let tmp = self.path.with_extension("db.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Clear advisory locks left behind by a crash mid-verification. Run once
    /// at startup, before any request is served.
    pub fn clear_stale_authz_locks(&self) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let mut cleared = 0;
        for authz in inner.authzs.values_mut() {
            if authz.locked {
                authz.locked = false;
                cleared += 1;
            }
        }
        if cleared > 0 {
            warn!(cleared, "cleared stale authorization locks from previous run");
            self.persist(&inner)?;
        }
        Ok(cleared)
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub fn get_account(&self, id: &str) -> StoreResult<Account> {
        self.inner
            .lock()
            .accounts
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Create the account together with its key and thumbprint index entry.
    pub fn create_account(
        &self,
        account: Account,
        jwk: serde_json::Value,
        thumbprint: String,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.account_keys.insert(account.id.clone(), jwk);
        inner.account_thumbprints.insert(thumbprint, account.id.clone());
        inner.accounts.insert(account.id.clone(), account);
        self.persist(&inner)
    }

    pub fn update_account(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Account),
    ) -> StoreResult<Account> {
        let mut inner = self.inner.lock();
        let account = inner.accounts.get_mut(id).ok_or(StoreError::NotFound)?;
        mutate(account);
        let updated = account.clone();
        self.persist(&inner)?;
        Ok(updated)
    }

    /// Remove the account, its key, and its thumbprint index entry.
    pub fn delete_account(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.accounts.remove(id);
        inner.account_keys.remove(id);
        inner.account_thumbprints.retain(|_, acc| acc != id);
        self.persist(&inner)
    }

    pub fn get_account_key(&self, id: &str) -> StoreResult<serde_json::Value> {
        self.inner
            .lock()
            .account_keys
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn account_id_by_thumbprint(&self, thumbprint: &str) -> Option<String> {
        self.inner.lock().account_thumbprints.get(thumbprint).cloned()
    }

    // =========================================================================
    // Orders
    // =========================================================================

    pub fn get_order(&self, id: &str) -> StoreResult<Order> {
        self.inner
            .lock()
            .orders
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn create_order(&self, order: Order) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.orders.insert(order.id.clone(), order);
        self.persist(&inner)
    }

    pub fn update_order(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Order),
    ) -> StoreResult<Order> {
        let mut inner = self.inner.lock();
        let order = inner.orders.get_mut(id).ok_or(StoreError::NotFound)?;
        mutate(order);
        let updated = order.clone();
        self.persist(&inner)?;
        Ok(updated)
    }

    // =========================================================================
    // Authorizations
    // =========================================================================

    pub fn get_authz(&self, id: &str) -> StoreResult<Authorization> {
        self.inner
            .lock()
            .authzs
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn create_authz(&self, authz: Authorization) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.authzs.insert(authz.id.clone(), authz);
        self.persist(&inner)
    }

    pub fn update_authz(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Authorization),
    ) -> StoreResult<Authorization> {
        let mut inner = self.inner.lock();
        let authz = inner.authzs.get_mut(id).ok_or(StoreError::NotFound)?;
        mutate(authz);
        let updated = authz.clone();
        self.persist(&inner)?;
        Ok(updated)
    }

    /// Atomically set `locked` and report whether it was previously clear.
    pub fn try_take_authz_lock(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let authz = inner.authzs.get_mut(id).ok_or(StoreError::NotFound)?;
        if authz.locked {
            return Ok(false);
        }
        authz.locked = true;
        self.persist(&inner)?;
        debug!(authz_id = id, "took authorization verification lock");
        Ok(true)
    }

    pub fn unlock_authz(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let authz = inner.authzs.get_mut(id).ok_or(StoreError::NotFound)?;
        authz.locked = false;
        self.persist(&inner)
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    pub fn get_certificate(&self, id: &str) -> StoreResult<CertificateRecord> {
        self.inner
            .lock()
            .certificates
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn create_certificate(&self, cert: CertificateRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.certificates.insert(cert.id.clone(), cert);
        self.persist(&inner)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("acmespider.db")).unwrap();
        (dir, store)
    }

    fn sample_authz(id: &str, locked: bool) -> Authorization {
        Authorization {
            id: id.into(),
            order_id: "order-1".into(),
            account_id: "acct-1".into(),
            status: AuthzStatus::Pending,
            identifier: Identifier::dns("host.internal"),
            challenges: vec![Challenge {
                kind: "http-01".into(),
                token: "tok".into(),
                status: ChallengeStatus::Pending,
                validated: None,
            }],
            expires: Some(Utc::now() + Duration::minutes(2)),
            locked,
        }
    }

    #[test]
    fn missing_keys_report_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get_account("nope"),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(store.get_order("nope"), Err(StoreError::NotFound)));
        assert!(matches!(
            store.get_certificate("nope"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acmespider.db");

        {
            let store = Store::open(&path).unwrap();
            store
                .create_account(
                    Account {
                        id: "acct-1".into(),
                        status: AccountStatus::Valid,
                        contact: vec!["mailto:a@x".into()],
                        terms_of_service_agreed: true,
                        orders: vec![],
                    },
                    serde_json::json!({"kty": "EC"}),
                    "tp-1".into(),
                )
                .unwrap();
            store.create_authz(sample_authz("authz-1", false)).unwrap();
        }

        let store = Store::open(&path).unwrap();
        let acct = store.get_account("acct-1").unwrap();
        assert_eq!(acct.contact, vec!["mailto:a@x"]);
        assert_eq!(store.account_id_by_thumbprint("tp-1").as_deref(), Some("acct-1"));
        assert_eq!(store.get_account_key("acct-1").unwrap()["kty"], "EC");
        assert_eq!(store.get_authz("authz-1").unwrap().id, "authz-1");
    }

    #[test]
    fn authz_lock_is_a_test_and_set() {
        let (_dir, store) = store();
        store.create_authz(sample_authz("authz-1", false)).unwrap();

        assert!(store.try_take_authz_lock("authz-1").unwrap());
        assert!(!store.try_take_authz_lock("authz-1").unwrap());

        store.unlock_authz("authz-1").unwrap();
        assert!(store.try_take_authz_lock("authz-1").unwrap());
    }

    #[test]
    fn startup_sweep_clears_stale_locks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acmespider.db");

        {
            let store = Store::open(&path).unwrap();
            store.create_authz(sample_authz("authz-1", false)).unwrap();
            assert!(store.try_take_authz_lock("authz-1").unwrap());
            // Simulated crash: lock never released.
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.clear_stale_authz_locks().unwrap(), 1);
        assert!(store.try_take_authz_lock("authz-1").unwrap());
    }

    #[test]
    fn deactivation_removes_key_and_thumbprint() {
        let (_dir, store) = store();
        store
            .create_account(
                Account {
                    id: "acct-1".into(),
                    status: AccountStatus::Valid,
                    contact: vec![],
                    terms_of_service_agreed: true,
                    orders: vec![],
                },
                serde_json::json!({"kty": "EC"}),
                "tp-1".into(),
            )
            .unwrap();

        store.delete_account("acct-1").unwrap();
        assert!(matches!(
            store.get_account("acct-1"),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_account_key("acct-1"),
            Err(StoreError::NotFound)
        ));
        assert!(store.account_id_by_thumbprint("tp-1").is_none());
    }

    #[test]
    fn record_serialization_round_trips() {
        let order = Order {
            id: "o".into(),
            account_id: "a".into(),
            status: OrderStatus::Pending,
            expires: Utc::now(),
            not_before: None,
            not_after: Some(Utc::now() + Duration::days(30)),
            identifiers: vec![Identifier::dns("x.internal"), Identifier::dns("y.internal")],
            authz_ids: vec!["z1".into(), "z2".into()],
            certificate_id: None,
            error: None,
        };
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(back.identifiers, order.identifiers);
        assert_eq!(back.authz_ids, order.authz_ids);
        assert_eq!(back.status, OrderStatus::Pending);
    }
}
