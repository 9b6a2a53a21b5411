//! ACMESpider server binary
//!
//! Startup order matters: configuration validation, store open plus the
//! stale-lock sweep, upstream CA registration, then the listener. Exits
//! non-zero on any fatal configuration or listener error and zero only on
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use acmespider::config::{Args, Config};
use acmespider::dns;
use acmespider::engine::AcmeEngine;
use acmespider::handlers::{router, AppState};
use acmespider::http01::Http01Verifier;
use acmespider::issuer::AcmeUpstreamIssuer;
use acmespider::jws::JwsGate;
use acmespider::links::LinkBuilder;
use acmespider::nonce::NonceService;
use acmespider::servicecert;
use acmespider::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Pick a rustls CryptoProvider before any TLS client or listener is
    // built; with several provider features enabled there is no default.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    info!("starting acmespider v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(&args)?;

    let store = Arc::new(Store::open(config.database_path()).context("failed to open store")?);
    let cleared = store
        .clear_stale_authz_locks()
        .context("failed to sweep stale authorization locks")?;
    if cleared > 0 {
        info!(cleared, "released authorization locks left by a previous run");
    }

    let links = LinkBuilder::new(&config.base_url, config.directory_meta());
    let nonces = Arc::new(NonceService::new());

    let dns_provider = dns::provider_from_spec(&config.dns_provider)?;
    info!(provider = %config.dns_provider, "using DNS provider");

    let issuer = AcmeUpstreamIssuer::bootstrap(
        &config.acme_ca_directory,
        config.acme_email.as_deref(),
        dns_provider,
        config.public_resolvers.clone(),
    )
    .await
    .context("failed to register with the upstream CA")?;

    let verifier =
        Http01Verifier::new(store.clone()).context("failed to build HTTP-01 client")?;
    let engine = AcmeEngine::new(store.clone(), links.clone(), Arc::new(issuer), verifier);
    let gate = JwsGate::new(store.clone(), nonces.clone(), links.clone());

    let state = Arc::new(AppState {
        engine,
        gate,
        nonces,
        links,
    });
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    if config.use_tls {
        let (cert_path, key_path) = servicecert::ensure_service_cert(
            &config.service_cert_dir(),
            &config.hostname,
            config.key_type,
        )?;
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .context("failed to load service certificate")?;

        info!(%addr, base_url = %config.base_url, "listening with TLS");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("listener failed")?;
    } else {
        info!(%addr, base_url = %config.base_url, "listening on plain HTTP");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("listener failed")?;
    }

    info!("acmespider shutdown complete");
    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Trigger a graceful drain on Ctrl+C or SIGTERM.
async fn shutdown_on_signal(handle: axum_server::Handle) {
    wait_for_signal().await;
    info!("shutdown signal received, draining connections");
    handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => {
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
}
