//! HTTP endpoints
//!
//! Thin translation layer between axum and the engine: every handler runs
//! the JWS gate with its endpoint's key policy, hands the verified payload
//! to the engine, and serializes the result. A single response middleware
//! stamps the headers every ACME response carries (`Replay-Nonce`,
//! `Cache-Control: no-store`, `Link: <directory>;rel="index"`).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::dto::{
    account_response, authz_response, challenge_dto, order_response, AccountRequest,
    OrderCreateRequest, OrderFinalizeRequest, OrdersListResponse,
};
use crate::engine::AcmeEngine;
use crate::jws::{JwsGate, KeyPolicy, VerifiedRequest};
use crate::links::LinkBuilder;
use crate::nonce::NonceService;
use crate::problem::Problem;

pub const PEM_CHAIN_CONTENT_TYPE: &str = "application/pem-certificate-chain";

/// Shared state behind every handler.
pub struct AppState {
    pub engine: AcmeEngine,
    pub gate: JwsGate,
    pub nonces: Arc<NonceService>,
    pub links: LinkBuilder,
}

/// Build the ACME router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/acme/directory", get(directory))
        .route("/acme/new-nonce", get(new_nonce))
        .route("/acme/new-account", post(new_account))
        .route("/acme/account/:acc_id", post(account))
        .route("/acme/account/:acc_id/orders", post(account_orders))
        .route("/acme/new-order", post(new_order))
        .route("/acme/order/:order_id", post(order))
        .route("/acme/order/:order_id/finalize", post(finalize_order))
        .route("/acme/authz/:authz_id", post(authorization))
        .route("/acme/chall/:chall_id", post(challenge))
        .route("/acme/certificate/:cert_id", post(certificate))
        .route("/acme/revoke-cert", post(revoke_cert))
        .route("/acme/key-change", post(key_change))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            acme_response_headers,
        ))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Convert a handler panic into a `serverInternal` problem instead of a
/// closed connection.
fn handle_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string());
    error!(panic = %detail, "handler panicked");
    Problem::server_internal(anyhow::anyhow!("handler panicked: {detail}")).into_response()
}

/// Stamp the headers carried by every ACME response.
async fn acme_response_headers(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let nonce = match state.nonces.generate() {
        Ok(nonce) => nonce,
        Err(err) => return Problem::server_internal(err).into_response(),
    };

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&nonce) {
        headers.insert("Replay-Nonce", value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Ok(value) = HeaderValue::from_str(&format!("<{}>;rel=\"index\"", state.links.directory()))
    {
        headers.insert(header::LINK, value);
    }
    response
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

fn verify(
    state: &AppState,
    headers: &HeaderMap,
    uri: &OriginalUri,
    body: &Bytes,
    policy: KeyPolicy,
) -> Result<VerifiedRequest, Problem> {
    state
        .gate
        .verify(content_type(headers), uri.path(), body, policy)
}

/// The gate leaves `account_id` empty only for JWK-policy endpoints, which
/// never call this.
fn require_account_id(verified: &VerifiedRequest) -> Result<String, Problem> {
    verified
        .account_id
        .clone()
        .ok_or_else(|| Problem::server_internal(anyhow::anyhow!("request carried no account id")))
}

fn location(url: String) -> [(header::HeaderName, String); 1] {
    [(header::LOCATION, url)]
}

// =============================================================================
// Public resources
// =============================================================================

async fn directory(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.links.directory_document())
}

/// The nonce itself rides in on the response middleware; this endpoint is
/// just a carrier. HEAD answers 200, GET 204.
async fn new_nonce(method: Method) -> StatusCode {
    if method == Method::HEAD {
        StatusCode::OK
    } else {
        StatusCode::NO_CONTENT
    }
}

// =============================================================================
// Accounts
// =============================================================================

async fn new_account(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::JwkOnly)?;
    let payload: AccountRequest = verified.parse_payload()?;
    let jwk = verified
        .header
        .jwk
        .as_ref()
        .ok_or_else(|| Problem::malformed("JWK not provided"))?;

    let outcome = state.engine.new_account(&payload, jwk)?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        location(state.links.account(&outcome.account.id)),
        Json(account_response(&state.links, &outcome.account)),
    )
        .into_response())
}

async fn account(
    State(state): State<Arc<AppState>>,
    Path(acc_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    let requester = require_account_id(&verified)?;

    // Empty payload is POST-as-GET; anything else is an update.
    let account = if verified.payload.is_empty() {
        state.engine.get_account(&acc_id, &requester)?
    } else {
        let payload: AccountRequest = verified.parse_payload()?;
        state.engine.update_account(&acc_id, &requester, &payload)?
    };

    Ok(Json(account_response(&state.links, &account)).into_response())
}

async fn account_orders(
    State(state): State<Arc<AppState>>,
    Path(acc_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    verified.require_post_as_get()?;
    let requester = require_account_id(&verified)?;

    let orders = state.engine.orders_for_account(&acc_id, &requester)?;
    Ok(Json(OrdersListResponse { orders }).into_response())
}

// =============================================================================
// Orders
// =============================================================================

async fn new_order(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    let requester = require_account_id(&verified)?;
    let payload: OrderCreateRequest = verified.parse_payload()?;

    let order = state.engine.new_order(&requester, &payload)?;
    Ok((
        StatusCode::CREATED,
        location(state.links.order(&order.id)),
        Json(order_response(&state.links, &order)),
    )
        .into_response())
}

async fn order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    let requester = require_account_id(&verified)?;

    let order = state.engine.get_order(&order_id, &requester)?;
    Ok(Json(order_response(&state.links, &order)).into_response())
}

async fn finalize_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    let requester = require_account_id(&verified)?;
    let payload: OrderFinalizeRequest = verified.parse_payload()?;

    let order = state
        .engine
        .finalize_order(&order_id, &requester, &payload)
        .await?;
    Ok((
        location(state.links.order(&order.id)),
        Json(order_response(&state.links, &order)),
    )
        .into_response())
}

// =============================================================================
// Authorizations, challenges, certificates
// =============================================================================

async fn authorization(
    State(state): State<Arc<AppState>>,
    Path(authz_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    verified.require_post_as_get()?;
    let requester = require_account_id(&verified)?;

    let authz = state.engine.get_authorization(&authz_id, &requester)?;
    Ok(Json(authz_response(&state.links, &authz)).into_response())
}

async fn challenge(
    State(state): State<Arc<AppState>>,
    Path(chall_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    if verified.payload != b"{}" {
        return Err(Problem::malformed(
            "Expected empty JSON object ({}) for payload",
        ));
    }
    let requester = require_account_id(&verified)?;

    let (authz, index) = state.engine.initiate_challenge(&chall_id, &requester).await?;
    let dto = challenge_dto(&state.links, &authz.id, index, &authz.challenges[index]);
    Ok(Json(dto).into_response())
}

async fn certificate(
    State(state): State<Arc<AppState>>,
    Path(cert_id): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    let verified = verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    verified.require_post_as_get()?;
    let requester = require_account_id(&verified)?;

    let cert = state.engine.get_certificate(&cert_id, &requester)?;
    Ok((
        [(header::CONTENT_TYPE, PEM_CHAIN_CONTENT_TYPE)],
        cert.chain_pem,
    )
        .into_response())
}

// Revocation and key rollover are deliberately not supported; the endpoints
// exist so clients get a clean problem document instead of a 404.

async fn revoke_cert(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    Err(Problem::not_implemented(
        "certificate revocation is not supported",
    ))
}

async fn key_change(
    State(state): State<Arc<AppState>>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    verify(&state, &headers, &uri, &body, KeyPolicy::KidOnly)?;
    Err(Problem::not_implemented("account key change is not supported"))
}
