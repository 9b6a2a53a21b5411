//! ACMESpider - intermediary ACME certificate-authority front-end
//!
//! Terminates RFC 8555 requests from clients on an internal network,
//! validates domain control with HTTP-01, and proxies actual issuance to an
//! upstream public CA over DNS-01 so that no internal client ever holds DNS
//! credentials or talks to the CA directly.
//!
//! - JWS-authenticated protocol surface with replay-nonce enforcement
//! - Persistent accounts, orders, authorizations, and certificates
//! - At-most-one-concurrent HTTP-01 verification per authorization
//! - Pluggable upstream issuer and DNS provider seams

pub mod config;
pub mod dns;
pub mod dto;
pub mod engine;
pub mod handlers;
pub mod http01;
pub mod issuer;
pub mod jws;
pub mod links;
pub mod nonce;
pub mod problem;
pub mod servicecert;
pub mod store;
pub mod util;

#[cfg(test)]
mod test_support;

// Re-export the types most callers need.
pub use config::{Args, Config};
pub use engine::AcmeEngine;
pub use handlers::{router, AppState};
pub use http01::Http01Verifier;
pub use issuer::{AcmeUpstreamIssuer, UpstreamIssuer};
pub use jws::JwsGate;
pub use links::LinkBuilder;
pub use nonce::NonceService;
pub use problem::Problem;
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
