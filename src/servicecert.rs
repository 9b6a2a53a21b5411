//! Self-serving TLS certificate cache
//!
//! When the server terminates TLS itself, it serves a locally generated
//! certificate for the configured hostname, cached as PEM files under
//! `<storage>/service-certs/` so restarts keep the same material. Swapping
//! in a publicly trusted certificate is an operational concern: drop the
//! files in place and restart.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tracing::{info, warn};

use crate::config::KeyType;

/// Make sure certificate and key PEM files exist for `hostname`, generating
/// them on first use. Returns `(cert_path, key_path)`.
pub fn ensure_service_cert(
    cache_dir: &Path,
    hostname: &str,
    key_type: KeyType,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    let cert_path = cache_dir.join(format!("{hostname}.crt"));
    let key_path = cache_dir.join(format!("{hostname}.key"));

    if cert_path.exists() && key_path.exists() {
        info!(hostname, "using cached service certificate");
        return Ok((cert_path, key_path));
    }

    fs::create_dir_all(cache_dir)
        .with_context(|| format!("failed to create {}", cache_dir.display()))?;

    let alg = match key_type {
        KeyType::Ec384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        KeyType::Ec256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        _ => {
            // The local generator has no RSA support.
            warn!("RSA service keys are not generatable locally; using ECDSA P-256");
            &rcgen::PKCS_ECDSA_P256_SHA256
        }
    };

    info!(hostname, "generating service certificate");
    let key_pair = KeyPair::generate_for(alg).context("service key generation failed")?;
    let mut params = CertificateParams::new(vec![hostname.to_string()])
        .context("invalid service certificate parameters")?;
    params.distinguished_name = DistinguishedName::new();
    let cert = params
        .self_signed(&key_pair)
        .context("service certificate generation failed")?;

    fs::write(&cert_path, cert.pem())?;
    fs::write(&key_path, key_pair.serialize_pem())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
    }

    Ok((cert_path, key_path))
}
