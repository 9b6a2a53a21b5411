//! Upstream certificate issuance
//!
//! The engine never talks to the public CA itself; it hands a CSR to an
//! [`UpstreamIssuer`] and gets back a PEM chain. The production
//! implementation drives a real ACME order against the configured CA
//! directory (Let's Encrypt by default) and proves control with DNS-01
//! through the operator's [`DnsProvider`], so no internal client ever needs
//! DNS credentials or upstream access of its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use der::oid::AssociatedOid;
use der::Decode as _;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use tracing::{debug, info, warn};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::request::{CertReq, ExtensionReq};

use crate::dns::{self, DnsProvider};

/// Whole-issuance deadline per finalize call.
const OBTAIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Upstream order poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

/// Obtains a certificate chain for a client CSR.
#[async_trait]
pub trait UpstreamIssuer: Send + Sync {
    /// Returns the issued chain, leaf first, PEM-encoded.
    async fn obtain_for_csr(
        &self,
        csr_der: &[u8],
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<String>;
}

/// Production issuer: one ACME account with the upstream CA, created at
/// startup and held in memory only. A restart simply registers again.
pub struct AcmeUpstreamIssuer {
    account: Account,
    dns: Arc<dyn DnsProvider>,
    resolvers: Vec<String>,
}

impl AcmeUpstreamIssuer {
    /// Register with the upstream CA directory.
    pub async fn bootstrap(
        directory_url: &str,
        email: Option<&str>,
        dns: Arc<dyn DnsProvider>,
        resolvers: Vec<String>,
    ) -> anyhow::Result<Self> {
        let contact: Vec<String> = email.map(|e| format!("mailto:{e}")).into_iter().collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        info!(directory = directory_url, "registering account with upstream CA");
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await
        .context("failed to register with the upstream ACME CA")?;

        Ok(Self {
            account,
            dns,
            resolvers,
        })
    }

    async fn obtain(&self, csr_der: &[u8]) -> anyhow::Result<String> {
        let domains = csr_dns_names(csr_der)?;
        if domains.is_empty() {
            bail!("CSR names no DNS identifiers");
        }

        let identifiers: Vec<Identifier> =
            domains.iter().cloned().map(Identifier::Dns).collect();
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("upstream new-order failed")?;

        // Answer every pending DNS-01 challenge, remembering the records we
        // created so they can be removed afterwards.
        let mut presented: Vec<(String, String)> = Vec::new();
        let result = self.solve_and_finalize(&mut order, csr_der, &mut presented).await;

        for (fqdn, value) in &presented {
            if let Err(err) = self.dns.cleanup(fqdn, value).await {
                warn!(fqdn, error = %err, "failed to clean up DNS challenge record");
            }
        }

        result
    }

    async fn solve_and_finalize(
        &self,
        order: &mut instant_acme::Order,
        csr_der: &[u8],
        presented: &mut Vec<(String, String)>,
    ) -> anyhow::Result<String> {
        let authorizations = order
            .authorizations()
            .await
            .context("upstream authorizations fetch failed")?;

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => bail!("unexpected upstream authorization status {status:?}"),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .context("upstream offered no DNS-01 challenge")?;

            let Identifier::Dns(domain) = &authz.identifier;
            let fqdn = format!("_acme-challenge.{domain}");
            let value = order.key_authorization(challenge).dns_value();

            self.dns
                .present(&fqdn, &value)
                .await
                .with_context(|| format!("failed to present TXT record for {domain}"))?;
            presented.push((fqdn.clone(), value.clone()));

            dns::wait_for_propagation(&self.resolvers, &fqdn, &value).await?;
            order
                .set_challenge_ready(&challenge.url)
                .await
                .context("failed to signal challenge readiness upstream")?;
        }

        self.poll_until(order, |status| {
            matches!(status, OrderStatus::Ready | OrderStatus::Valid)
        })
        .await
        .context("upstream order did not become ready")?;

        order
            .finalize(csr_der)
            .await
            .context("upstream finalize failed")?;

        self.poll_until(order, |status| matches!(status, OrderStatus::Valid))
            .await
            .context("upstream order did not become valid after finalize")?;

        let chain = order
            .certificate()
            .await
            .context("upstream certificate download failed")?
            .context("upstream returned no certificate")?;
        Ok(chain)
    }

    async fn poll_until(
        &self,
        order: &mut instant_acme::Order,
        done: impl Fn(OrderStatus) -> bool,
    ) -> anyhow::Result<()> {
        for _ in 0..POLL_ATTEMPTS {
            let state = order.state();
            if done(state.status) {
                return Ok(());
            }
            if state.status == OrderStatus::Invalid {
                bail!("upstream order became invalid");
            }
            debug!(status = ?state.status, "waiting on upstream order");
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await.context("upstream order refresh failed")?;
        }
        bail!("timed out polling the upstream order")
    }
}

#[async_trait]
impl UpstreamIssuer for AcmeUpstreamIssuer {
    async fn obtain_for_csr(
        &self,
        csr_der: &[u8],
        _not_before: Option<DateTime<Utc>>,
        _not_after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<String> {
        // Validity hints are accepted for interface compatibility; public
        // CAs pick their own notBefore/notAfter.
        tokio::time::timeout(OBTAIN_TIMEOUT, self.obtain(csr_der))
            .await
            .map_err(|_| anyhow::anyhow!("upstream issuance timed out"))?
    }
}

/// DNS names covered by a CSR: the SAN extension when present, otherwise the
/// subject CN.
fn csr_dns_names(csr_der: &[u8]) -> anyhow::Result<Vec<String>> {
    let csr = CertReq::from_der(csr_der).context("CSR is not valid DER")?;

    let mut names = Vec::new();
    for attr in csr.info.attributes.iter() {
        if attr.oid != ExtensionReq::OID {
            continue;
        }
        for value in attr.values.iter() {
            let Ok(ext_req) = value.decode_as::<ExtensionReq>() else {
                continue;
            };
            for ext in ext_req.0 {
                if ext.extn_id != SubjectAltName::OID {
                    continue;
                }
                if let Ok(san) = SubjectAltName::from_der(ext.extn_value.as_bytes()) {
                    for general_name in san.0 {
                        if let GeneralName::DnsName(dns) = general_name {
                            names.push(dns.to_string());
                        }
                    }
                }
            }
        }
    }

    if names.is_empty() {
        // Fall back to the subject common name, rendered as "CN=<name>".
        let subject = csr.info.subject.to_string();
        for part in subject.split(',') {
            if let Some(cn) = part.trim().strip_prefix("CN=") {
                if !cn.is_empty() {
                    names.push(cn.to_string());
                }
            }
        }
    }

    names.dedup();
    Ok(names)
}
