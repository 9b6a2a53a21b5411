//! Environment-driven configuration
//!
//! Everything is configured through `ACMESPIDER_*` environment variables
//! (also accepted as CLI flags). The two derivation rules worth knowing:
//! `BASE_URL` and `HOSTNAME` can each be computed from the other, and TLS
//! defaults to on when the port is 443 and `ACMESPIDER_TLS` is unset.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Key type used for locally generated service keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    Rsa8192,
    Ec256,
    Ec384,
}

impl KeyType {
    /// Lenient parse matching the documented names; anything unrecognized
    /// falls back to RSA-2048.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "rsa" | "rsa2048" => Self::Rsa2048,
            "rsa3072" => Self::Rsa3072,
            "rsa4096" => Self::Rsa4096,
            "rsa8192" => Self::Rsa8192,
            "ec256" => Self::Ec256,
            "ec384" => Self::Ec384,
            other => {
                if !other.is_empty() {
                    warn!(key_type = other, "unrecognized KEY_TYPE, using rsa2048");
                }
                Self::Rsa2048
            }
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "yes" | "true" | "1")
}

/// ACMESpider - internal ACME front-end that proxies issuance to a public CA
#[derive(Debug, Parser)]
#[command(name = "acmespider")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen port
    #[arg(long, default_value = "443", env = "ACMESPIDER_PORT")]
    pub port: u16,

    /// Serve TLS (truthy/empty; empty plus port 443 means on)
    #[arg(long, default_value = "", env = "ACMESPIDER_TLS")]
    pub tls: String,

    /// Externally visible base URL (derived from hostname when absent)
    #[arg(long, env = "ACMESPIDER_BASE_URL")]
    pub base_url: Option<String>,

    /// Hostname for the service certificate (derived from base URL when absent)
    #[arg(long, env = "ACMESPIDER_HOSTNAME")]
    pub hostname: Option<String>,

    /// Directory holding the database and the service certificate cache
    #[arg(long, default_value = "./", env = "ACMESPIDER_STORAGE_PATH")]
    pub storage_path: PathBuf,

    /// Comma-separated public resolvers used for propagation checks
    #[arg(
        long,
        default_value = "1.1.1.1,8.8.8.8",
        env = "ACMESPIDER_PUBLIC_RESOLVERS"
    )]
    pub public_resolvers: String,

    /// DNS provider for upstream DNS-01 ("manual" or "webhook:<url>")
    #[arg(long, default_value = "manual", env = "ACMESPIDER_DNS_PROVIDER")]
    pub dns_provider: String,

    /// Upstream ACME directory URL
    #[arg(
        long,
        default_value = LETS_ENCRYPT_PRODUCTION,
        env = "ACMESPIDER_ACME_CA_DIRECTORY"
    )]
    pub acme_ca_directory: String,

    /// Must be truthy: accepts the upstream CA's terms of service
    #[arg(long, default_value = "", env = "ACMESPIDER_ACME_TOS_ACCEPT")]
    pub acme_tos_accept: String,

    /// Contact email registered with the upstream CA
    #[arg(long, env = "ACMESPIDER_ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Service key type (rsa2048|rsa3072|rsa4096|rsa8192|ec256|ec384)
    #[arg(long, default_value = "rsa2048", env = "ACMESPIDER_KEY_TYPE")]
    pub key_type: String,

    /// Terms-of-service URL advertised in the directory meta
    #[arg(long, default_value = "", env = "ACMESPIDER_META_TOS_URL")]
    pub meta_tos_url: String,

    /// Comma-separated CAA identities advertised in the directory meta
    #[arg(long, default_value = "", env = "ACMESPIDER_META_CAAS")]
    pub meta_caas: String,

    /// Website URL advertised in the directory meta
    #[arg(long, default_value = "", env = "ACMESPIDER_META_WEBSITE")]
    pub meta_website: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "ACMESPIDER_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "ACMESPIDER_JSON_LOGS")]
    pub json_logs: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub use_tls: bool,
    pub base_url: String,
    pub hostname: String,
    pub storage_path: PathBuf,
    pub public_resolvers: Vec<String>,
    pub dns_provider: String,
    pub acme_ca_directory: String,
    pub acme_email: Option<String>,
    pub key_type: KeyType,
    pub meta_tos_url: String,
    pub meta_caas: Vec<String>,
    pub meta_website: String,
}

impl Config {
    /// Apply the derivation and validation rules to raw arguments.
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        if !is_truthy(&args.acme_tos_accept) {
            bail!(
                "please indicate that you accept the terms-of-service for your ACME provider \
                 by setting ACMESPIDER_ACME_TOS_ACCEPT=true"
            );
        }

        let use_tls = is_truthy(&args.tls) || (args.tls.is_empty() && args.port == 443);

        let mut base_url = args.base_url.clone().unwrap_or_default();
        let mut hostname = args.hostname.clone().unwrap_or_default();

        if base_url.is_empty() && hostname.is_empty() {
            bail!(
                "please provide a base URL in ACMESPIDER_BASE_URL and/or a hostname \
                 in ACMESPIDER_HOSTNAME"
            );
        }

        if !base_url.is_empty() && hostname.is_empty() {
            let parsed = Url::parse(&base_url).context("failed to parse provided base URL")?;
            hostname = parsed
                .host_str()
                .context("base URL carries no hostname")?
                .to_string();
            info!(hostname, "using hostname parsed from base URL");
        } else if !hostname.is_empty() && base_url.is_empty() {
            let scheme = if use_tls { "https" } else { "http" };
            let default_port = (scheme == "http" && args.port == 80)
                || (scheme == "https" && args.port == 443);
            base_url = if default_port {
                format!("{scheme}://{hostname}")
            } else {
                format!("{scheme}://{hostname}:{}", args.port)
            };
            info!(base_url, "using base URL derived from hostname, port, and scheme");
        }

        let public_resolvers = split_csv(&args.public_resolvers);
        if public_resolvers.is_empty() {
            bail!("ACMESPIDER_PUBLIC_RESOLVERS must name at least one resolver");
        }

        Ok(Self {
            port: args.port,
            use_tls,
            base_url,
            hostname,
            storage_path: args.storage_path.clone(),
            public_resolvers,
            dns_provider: args.dns_provider.clone(),
            acme_ca_directory: args.acme_ca_directory.clone(),
            acme_email: args.acme_email.clone(),
            key_type: KeyType::parse(&args.key_type),
            meta_tos_url: args.meta_tos_url.clone(),
            meta_caas: split_csv(&args.meta_caas),
            meta_website: args.meta_website.clone(),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_path.join("acmespider.db")
    }

    pub fn service_cert_dir(&self) -> PathBuf {
        self.storage_path.join("service-certs")
    }

    pub fn directory_meta(&self) -> crate::dto::DirectoryMeta {
        crate::dto::DirectoryMeta {
            terms_of_service: self.meta_tos_url.clone(),
            website: self.meta_website.clone(),
            caa_identities: self.meta_caas.clone(),
            external_account_required: false,
        }
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
