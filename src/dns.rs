//! DNS provider seam and TXT propagation checks
//!
//! The upstream issuer answers DNS-01 challenges through an operator-supplied
//! provider; nothing else in the server touches DNS. Two providers ship:
//! a webhook provider that POSTs record changes to an HTTP endpoint, and a
//! manual provider that only logs what an operator must create. After a
//! record is presented, propagation is confirmed against the configured
//! public resolvers before the CA is told to validate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// How long to wait for a presented record to become visible.
const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(300);
const PROPAGATION_INTERVAL: Duration = Duration::from_secs(30);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates and removes `_acme-challenge` TXT records for DNS-01.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn present(&self, fqdn: &str, value: &str) -> anyhow::Result<()>;
    async fn cleanup(&self, fqdn: &str, value: &str) -> anyhow::Result<()>;
}

/// Build a provider from the `DNS_PROVIDER` setting: `manual` or
/// `webhook:<url>`.
pub fn provider_from_spec(spec: &str) -> anyhow::Result<Arc<dyn DnsProvider>> {
    if spec == "manual" {
        return Ok(Arc::new(ManualDnsProvider));
    }
    if let Some(endpoint) = spec.strip_prefix("webhook:") {
        if endpoint.is_empty() {
            bail!("webhook DNS provider requires an endpoint URL");
        }
        return Ok(Arc::new(WebhookDnsProvider::new(endpoint.to_string())?));
    }
    bail!("unknown DNS provider {spec:?}; expected \"manual\" or \"webhook:<url>\"")
}

/// Logs the records an operator has to manage by hand. Useful when the zone
/// is pre-provisioned or managed out of band.
pub struct ManualDnsProvider;

#[async_trait]
impl DnsProvider for ManualDnsProvider {
    async fn present(&self, fqdn: &str, value: &str) -> anyhow::Result<()> {
        info!(fqdn, value, "manual DNS mode: create this TXT record now");
        Ok(())
    }

    async fn cleanup(&self, fqdn: &str, value: &str) -> anyhow::Result<()> {
        info!(fqdn, value, "manual DNS mode: the TXT record can be removed");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookRecordChange<'a> {
    action: &'a str,
    fqdn: &'a str,
    value: &'a str,
}

/// POSTs record changes to an operator-run endpoint that knows how to talk
/// to the authoritative DNS.
pub struct WebhookDnsProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookDnsProvider {
    pub fn new(endpoint: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, endpoint })
    }

    async fn send(&self, action: &str, fqdn: &str, value: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&WebhookRecordChange {
                action,
                fqdn,
                value,
            })
            .send()
            .await
            .with_context(|| format!("DNS webhook request to {} failed", self.endpoint))?;

        if !response.status().is_success() {
            bail!(
                "DNS webhook returned {} for {action} of {fqdn}",
                response.status()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for WebhookDnsProvider {
    async fn present(&self, fqdn: &str, value: &str) -> anyhow::Result<()> {
        self.send("present", fqdn, value).await
    }

    async fn cleanup(&self, fqdn: &str, value: &str) -> anyhow::Result<()> {
        self.send("cleanup", fqdn, value).await
    }
}

fn resolver_for(resolvers: &[String]) -> anyhow::Result<TokioAsyncResolver> {
    // Spread lookups across the configured resolvers in random order.
    let mut shuffled = resolvers.to_vec();
    shuffled.shuffle(&mut rand::thread_rng());

    let mut config = ResolverConfig::new();
    for resolver in &shuffled {
        let with_port = if resolver.contains(':') {
            resolver.clone()
        } else {
            format!("{resolver}:53")
        };
        let addr: SocketAddr = with_port
            .parse()
            .with_context(|| format!("invalid public resolver address {resolver:?}"))?;
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
    }

    let mut opts = ResolverOpts::default();
    opts.timeout = LOOKUP_TIMEOUT;
    Ok(TokioAsyncResolver::tokio(config, opts))
}

/// Poll the public resolvers until the TXT record shows up. Returns `false`
/// on timeout; the caller proceeds anyway and lets the CA do its own lookup,
/// matching how upstream validation actually behaves.
pub async fn wait_for_propagation(
    resolvers: &[String],
    fqdn: &str,
    value: &str,
) -> anyhow::Result<bool> {
    let resolver = resolver_for(resolvers)?;
    let deadline = tokio::time::Instant::now() + PROPAGATION_TIMEOUT;

    debug!(fqdn, "starting DNS record propagation check");
    loop {
        if tokio::time::Instant::now() >= deadline {
            warn!(fqdn, "timed out waiting for DNS record propagation");
            return Ok(false);
        }
        tokio::time::sleep(PROPAGATION_INTERVAL).await;

        let answers = match resolver.txt_lookup(fqdn.to_string()).await {
            Ok(lookup) => lookup,
            Err(err) => {
                debug!(fqdn, error = %err, "TXT lookup failed, will retry");
                continue;
            }
        };

        for record in answers.iter() {
            let text = record
                .txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part))
                .collect::<String>();
            if text == value {
                debug!(fqdn, "DNS record propagated");
                return Ok(true);
            }
            debug!(fqdn, found = %text, "TXT result did not match");
        }
    }
}
