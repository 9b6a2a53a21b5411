//! ACME protocol state machine
//!
//! Owns every state transition over the stored objects: account lifecycle,
//! order creation with its authorization fan-out, challenge orchestration,
//! finalization against the upstream issuer, and certificate retrieval.
//! Handlers translate HTTP in and out; nothing here touches axum.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use der::Decode as _;
use jsonwebtoken::jwk::Jwk;
use tracing::{info, warn};
use x509_cert::request::CertReq;

use crate::dto::{AccountRequest, OrderCreateRequest, OrderFinalizeRequest};
use crate::http01::{Http01Verifier, HTTP01_CHALLENGE_TYPE};
use crate::issuer::UpstreamIssuer;
use crate::jws::jwk_thumbprint;
use crate::links::LinkBuilder;
use crate::problem::{Problem, ProblemIdentifier};
use crate::store::{
    Account, AccountStatus, Authorization, AuthzStatus, CertificateRecord, Challenge,
    ChallengeStatus, Identifier, Order, OrderStatus, Store, StoreError,
};
use crate::util::{b64_decode, generate_challenge_token, generate_id};

/// Orders expire quickly: they are meant to be driven to completion
/// promptly by the client.
const ORDER_EXPIRY_SECS: i64 = 120;

/// Result of a new-account request: the RFC distinguishes a freshly created
/// account (201) from one found by key (200).
#[derive(Debug)]
pub struct NewAccountOutcome {
    pub account: Account,
    pub created: bool,
}

pub struct AcmeEngine {
    store: Arc<Store>,
    links: LinkBuilder,
    issuer: Arc<dyn UpstreamIssuer>,
    verifier: Http01Verifier,
}

impl AcmeEngine {
    pub fn new(
        store: Arc<Store>,
        links: LinkBuilder,
        issuer: Arc<dyn UpstreamIssuer>,
        verifier: Http01Verifier,
    ) -> Self {
        Self {
            store,
            links,
            issuer,
            verifier,
        }
    }

    pub fn links(&self) -> &LinkBuilder {
        &self.links
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Create an account for the presented JWK, or return the account that
    /// key already registered.
    pub fn new_account(
        &self,
        payload: &AccountRequest,
        jwk: &Jwk,
    ) -> Result<NewAccountOutcome, Problem> {
        let thumbprint = jwk_thumbprint(jwk)?;

        if let Some(existing_id) = self.store.account_id_by_thumbprint(&thumbprint) {
            let account = self
                .store
                .get_account(&existing_id)
                .map_err(Problem::server_internal)?;
            return Ok(NewAccountOutcome {
                account,
                created: false,
            });
        }

        if payload.only_return_existing {
            return Err(Problem::account_does_not_exist(
                "no account is registered for this key",
            ));
        }

        let account = Account {
            id: generate_id(),
            status: AccountStatus::Valid,
            contact: payload.contact.clone().unwrap_or_default(),
            terms_of_service_agreed: payload.terms_of_service_agreed,
            orders: Vec::new(),
        };

        let jwk_json = serde_json::to_value(jwk).map_err(Problem::server_internal)?;
        self.store
            .create_account(account.clone(), jwk_json, thumbprint)
            .map_err(Problem::server_internal)?;

        info!(account_id = %account.id, "registered new account");
        Ok(NewAccountOutcome {
            account,
            created: true,
        })
    }

    fn require_own_account(&self, queried: &str, requester: &str) -> Result<(), Problem> {
        if queried.is_empty() || queried != requester {
            return Err(Problem::unauthorized(""));
        }
        Ok(())
    }

    pub fn get_account(&self, queried: &str, requester: &str) -> Result<Account, Problem> {
        self.require_own_account(queried, requester)?;
        match self.store.get_account(queried) {
            Ok(account) => Ok(account),
            // The KID resolved, so the account existed moments ago; either
            // way the caller learns nothing.
            Err(StoreError::NotFound) => Err(Problem::unauthorized("")),
            Err(err) => Err(Problem::server_internal(err)),
        }
    }

    /// Apply an account update. Deactivation is a hard delete: clients
    /// cannot tell a deactivated account from an unknown one.
    pub fn update_account(
        &self,
        queried: &str,
        requester: &str,
        payload: &AccountRequest,
    ) -> Result<Account, Problem> {
        self.require_own_account(queried, requester)?;

        if payload.status.as_deref() == Some("deactivated") {
            let mut account = self.get_account(queried, requester)?;
            account.status = AccountStatus::Deactivated;
            self.store
                .delete_account(queried)
                .map_err(Problem::server_internal)?;
            info!(account_id = queried, "account deactivated");
            return Ok(account);
        }

        let updated = self
            .store
            .update_account(queried, |account| {
                if let Some(contact) = &payload.contact {
                    account.contact = contact.clone();
                }
            })
            .map_err(Problem::from)?;
        Ok(updated)
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Create an order plus one pending authorization (with a single HTTP-01
    /// challenge) per identifier, in identifier order.
    pub fn new_order(
        &self,
        account_id: &str,
        payload: &OrderCreateRequest,
    ) -> Result<Order, Problem> {
        let mut identifiers = Vec::with_capacity(payload.identifiers.len());
        for (index, identifier) in payload.identifiers.iter().enumerate() {
            if identifier.value.is_empty() {
                return Err(Problem::malformed(format!(
                    "identifier index {index} has an empty value"
                )));
            }
            if identifier.kind != "dns" {
                return Err(Problem::malformed(format!(
                    "identifier index {index} had a type of {:?}, but the only supported type is \"dns\"",
                    identifier.kind
                )));
            }
            if identifier.value.starts_with('*') {
                return Err(Problem::rejected_identifier(
                    ProblemIdentifier {
                        kind: identifier.kind.clone(),
                        value: identifier.value.clone(),
                    },
                    "wildcard identifiers are not supported",
                ));
            }
            identifiers.push(Identifier::dns(&identifier.value));
        }
        if identifiers.is_empty() {
            return Err(Problem::malformed("order must name at least one identifier"));
        }

        let not_before = parse_optional_rfc3339(payload.not_before.as_deref(), "notBefore")?;
        let not_after = parse_optional_rfc3339(payload.not_after.as_deref(), "notAfter")?;

        let order_id = generate_id();
        let expires = Utc::now() + Duration::seconds(ORDER_EXPIRY_SECS);

        let mut authz_ids = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            let authz = Authorization {
                id: generate_id(),
                order_id: order_id.clone(),
                account_id: account_id.to_string(),
                status: AuthzStatus::Pending,
                identifier: identifier.clone(),
                challenges: vec![Challenge {
                    kind: HTTP01_CHALLENGE_TYPE.to_string(),
                    token: generate_challenge_token(),
                    status: ChallengeStatus::Pending,
                    validated: None,
                }],
                expires: Some(expires),
                locked: false,
            };
            authz_ids.push(authz.id.clone());
            self.store
                .create_authz(authz)
                .map_err(Problem::server_internal)?;
        }

        let order = Order {
            id: order_id.clone(),
            account_id: account_id.to_string(),
            status: OrderStatus::Pending,
            expires,
            not_before,
            not_after,
            identifiers,
            authz_ids,
            certificate_id: None,
            error: None,
        };
        self.store
            .create_order(order.clone())
            .map_err(Problem::server_internal)?;

        self.store
            .update_account(account_id, |account| {
                account.orders.push(order_id.clone());
            })
            .map_err(Problem::from)?;

        info!(order_id = %order.id, account_id, identifiers = order.identifiers.len(), "created order");
        Ok(order)
    }

    pub fn get_order(&self, order_id: &str, account_id: &str) -> Result<Order, Problem> {
        recompute_order_status(&self.store, order_id)?;

        let order = self.store.get_order(order_id).map_err(Problem::from)?;
        if order.account_id != account_id {
            return Err(Problem::unauthorized(""));
        }
        Ok(order)
    }

    pub fn orders_for_account(
        &self,
        queried: &str,
        requester: &str,
    ) -> Result<Vec<String>, Problem> {
        self.require_own_account(queried, requester)?;
        let account = self
            .store
            .get_account(queried)
            .map_err(Problem::server_internal)?;
        Ok(account
            .orders
            .iter()
            .map(|id| self.links.order(id))
            .collect())
    }

    // =========================================================================
    // Authorizations and challenges
    // =========================================================================

    pub fn get_authorization(
        &self,
        authz_id: &str,
        account_id: &str,
    ) -> Result<Authorization, Problem> {
        let authz = self.store.get_authz(authz_id).map_err(Problem::from)?;
        if authz.account_id != account_id {
            return Err(Problem::unauthorized(""));
        }
        Ok(authz)
    }

    /// Start verification for a challenge and report its freshest state.
    pub async fn initiate_challenge(
        &self,
        challenge_id: &str,
        account_id: &str,
    ) -> Result<(Authorization, usize), Problem> {
        let (authz_id, challenge_index) = split_challenge_id(challenge_id)?;

        let authz = match self.store.get_authz(&authz_id) {
            Ok(authz) => authz,
            Err(StoreError::NotFound) => return Err(Problem::unauthorized("")),
            Err(err) => return Err(Problem::server_internal(err)),
        };
        if authz.account_id != account_id {
            return Err(Problem::unauthorized(""));
        }
        if challenge_index >= authz.challenges.len() {
            return Err(Problem::not_found("Unknown challenge ID"));
        }

        let order = self
            .store
            .get_order(&authz.order_id)
            .map_err(Problem::server_internal)?;

        self.verifier.start(&order, &authz, challenge_index).await?;

        let latest = self
            .store
            .get_authz(&authz_id)
            .map_err(Problem::server_internal)?;
        if challenge_index >= latest.challenges.len() {
            return Err(Problem::server_internal(anyhow::anyhow!(
                "challenge index out of bounds after verification start"
            )));
        }
        Ok((latest, challenge_index))
    }

    // =========================================================================
    // Finalization and certificates
    // =========================================================================

    /// Drive issuance through the upstream CA once every authorization
    /// holds. The stored chain is write-once.
    pub async fn finalize_order(
        &self,
        order_id: &str,
        account_id: &str,
        payload: &OrderFinalizeRequest,
    ) -> Result<Order, Problem> {
        recompute_order_status(&self.store, order_id)?;

        let order = match self.store.get_order(order_id) {
            Ok(order) => order,
            Err(StoreError::NotFound) => return Err(Problem::unauthorized("")),
            Err(err) => return Err(Problem::server_internal(err)),
        };
        if order.account_id != account_id {
            return Err(Problem::unauthorized(""));
        }

        let csr_der =
            b64_decode(&payload.csr).map_err(|_| Problem::bad_csr("Invalid CSR Base64"))?;
        CertReq::from_der(&csr_der).map_err(|_| Problem::bad_csr("Invalid CSR"))?;

        for authz_id in &order.authz_ids {
            let authz = self
                .store
                .get_authz(authz_id)
                .map_err(Problem::server_internal)?;
            if authz.status != AuthzStatus::Valid {
                return Err(Problem::order_not_ready(
                    "not all authorizations for this order are valid",
                ));
            }
        }

        let chain_pem = match self
            .issuer
            .obtain_for_csr(&csr_der, order.not_before, order.not_after)
            .await
        {
            Ok(chain) => chain,
            Err(err) => {
                let problem = Problem::server_internal(err);
                let document = problem.document();
                if let Err(store_err) = self.store.update_order(order_id, |o| {
                    o.status = OrderStatus::Invalid;
                    o.error = Some(document);
                }) {
                    warn!(order_id, error = %store_err, "failed to record finalization failure");
                }
                return Err(problem);
            }
        };

        let blocks = pem::parse_many(chain_pem.as_bytes())
            .map_err(|err| Problem::server_internal(anyhow::anyhow!("obtained chain is not PEM: {err}")))?;
        if !blocks.iter().any(|b| b.tag() == "CERTIFICATE") {
            return Err(Problem::server_internal(anyhow::anyhow!(
                "obtained certificate chain is empty"
            )));
        }

        let cert = CertificateRecord {
            id: generate_id(),
            order_id: order.id.clone(),
            account_id: order.account_id.clone(),
            chain_pem,
        };
        let cert_id = cert.id.clone();
        self.store
            .create_certificate(cert)
            .map_err(Problem::server_internal)?;

        let updated = self
            .store
            .update_order(order_id, |o| {
                o.certificate_id = Some(cert_id.clone());
                o.status = OrderStatus::Valid;
            })
            .map_err(Problem::server_internal)?;

        info!(order_id, certificate_id = %updated.certificate_id.as_deref().unwrap_or_default(), "order finalized");
        Ok(updated)
    }

    pub fn get_certificate(
        &self,
        cert_id: &str,
        account_id: &str,
    ) -> Result<CertificateRecord, Problem> {
        let cert = self.store.get_certificate(cert_id).map_err(Problem::from)?;
        if cert.account_id != account_id {
            return Err(Problem::unauthorized(""));
        }
        Ok(cert)
    }
}

/// Advance a pending order based on what its authorizations look like now.
/// Runs lazily on reads and at the end of each verification; all transitions
/// out of `pending` made here are monotonic and idempotent.
pub(crate) fn recompute_order_status(store: &Store, order_id: &str) -> Result<(), Problem> {
    let order = store.get_order(order_id).map_err(Problem::from)?;
    if order.status != OrderStatus::Pending {
        return Ok(());
    }

    if Utc::now() > order.expires {
        store
            .update_order(order_id, |o| o.status = OrderStatus::Expired)
            .map_err(Problem::server_internal)?;
        return Ok(());
    }

    let mut all_valid = !order.authz_ids.is_empty();
    for authz_id in &order.authz_ids {
        let authz = store.get_authz(authz_id).map_err(Problem::server_internal)?;
        if authz.status != AuthzStatus::Valid {
            all_valid = false;
            break;
        }
    }

    if all_valid {
        store
            .update_order(order_id, |o| o.status = OrderStatus::Ready)
            .map_err(Problem::server_internal)?;
    }
    Ok(())
}

/// Challenge ids are the authz id followed by a two-hex-digit index.
fn split_challenge_id(challenge_id: &str) -> Result<(String, usize), Problem> {
    if challenge_id.len() < 3 {
        return Err(Problem::malformed("Challenge ID too short"));
    }
    let (authz_id, index_hex) = challenge_id.split_at(challenge_id.len() - 2);
    let index = usize::from_str_radix(index_hex, 16)
        .map_err(|_| Problem::malformed("Invalid challenge ID"))?;
    Ok((authz_id.to_string(), index))
}

fn parse_optional_rfc3339(
    value: Option<&str>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, Problem> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| Problem::malformed(format!("invalid {field} date format"))),
    }
}
