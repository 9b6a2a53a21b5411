//! HTTP-01 challenge verification
//!
//! Fetches `http://{identifier}/.well-known/acme-challenge/{token}` and
//! compares the response against the account key authorization. The loop for
//! a given authorization is guarded by the advisory lock persisted with the
//! authz record, so at most one verification runs per authz at any time.
//! Challenge initiation gives the loop a one-second head start in the request
//! task and detaches it afterwards; the HTTP response is never held open for
//! the full verification window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::jwk::Jwk;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine;
use crate::jws::jwk_thumbprint;
use crate::problem::Problem;
use crate::store::{Authorization, AuthzStatus, ChallengeStatus, Order, Store};
use crate::util::b64_decode;

pub const HTTP01_CHALLENGE_TYPE: &str = "http-01";

/// Upper bound on response bytes read per attempt, so a malicious target
/// cannot feed us unbounded data.
const MAX_RESPONSE_BYTES: usize = 8 * 1024;

/// Per-attempt request timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_MAX_ATTEMPTS: u32 = 60;
const DEFAULT_PACING: Duration = Duration::from_secs(1);
const DEFAULT_HEAD_START: Duration = Duration::from_secs(1);

/// Runs HTTP-01 verification loops.
#[derive(Clone)]
pub struct Http01Verifier {
    store: Arc<Store>,
    client: reqwest::Client,
    max_attempts: u32,
    pacing: Duration,
    head_start: Duration,
}

impl Http01Verifier {
    pub fn new(store: Arc<Store>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()?;
        Ok(Self {
            store,
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            pacing: DEFAULT_PACING,
            head_start: DEFAULT_HEAD_START,
        })
    }

    /// Shrink the verification window, for tests that exercise the failure
    /// path without waiting out a full minute.
    pub fn with_timing(mut self, max_attempts: u32, pacing: Duration, head_start: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.pacing = pacing;
        self.head_start = head_start;
        self
    }

    /// Kick off verification for one challenge. Returns once the loop has
    /// finished or after the head-start window, whichever comes first; in
    /// the latter case the loop keeps running in a background task.
    pub async fn start(
        &self,
        order: &Order,
        authz: &Authorization,
        challenge_index: usize,
    ) -> Result<(), Problem> {
        let (tx, rx) = oneshot::channel();

        let store = self.store.clone();
        let client = self.client.clone();
        let order_id = order.id.clone();
        let authz = authz.clone();
        let max_attempts = self.max_attempts;
        let pacing = self.pacing;

        tokio::spawn(async move {
            let result =
                verify_loop(store, client, order_id, authz, challenge_index, max_attempts, pacing)
                    .await;
            if let Err(problem) = &result {
                warn!(error = %problem, "HTTP-01 verification loop failed");
            }
            let _ = tx.send(result);
        });

        tokio::select! {
            result = rx => result.unwrap_or(Ok(())),
            () = tokio::time::sleep(self.head_start) => Ok(()),
        }
    }
}

async fn verify_loop(
    store: Arc<Store>,
    client: reqwest::Client,
    order_id: String,
    authz: Authorization,
    challenge_index: usize,
    max_attempts: u32,
    pacing: Duration,
) -> Result<(), Problem> {
    let locked = store.try_take_authz_lock(&authz.id)?;
    if !locked {
        return Err(Problem::malformed(format!(
            "authorization {} is locked - challenge in progress",
            authz.id
        )));
    }

    let outcome = run_verification(
        &store,
        &client,
        &authz,
        challenge_index,
        max_attempts,
        pacing,
    )
    .await;

    // Both run on every exit path, success or not.
    if let Err(err) = store.unlock_authz(&authz.id) {
        warn!(authz_id = %authz.id, error = %err, "failed to release authorization lock");
    }
    if let Err(err) = engine::recompute_order_status(&store, &order_id) {
        warn!(order_id = %order_id, error = %err, "failed to recompute order status");
    }

    outcome
}

async fn run_verification(
    store: &Store,
    client: &reqwest::Client,
    authz: &Authorization,
    challenge_index: usize,
    max_attempts: u32,
    pacing: Duration,
) -> Result<(), Problem> {
    let challenge = authz
        .challenges
        .get(challenge_index)
        .ok_or_else(|| Problem::malformed("challenge index is invalid"))?;
    if challenge.kind != HTTP01_CHALLENGE_TYPE {
        return Err(Problem::malformed(format!(
            "challenge type is {} not {HTTP01_CHALLENGE_TYPE}",
            challenge.kind
        )));
    }

    let jwk_json = store.get_account_key(&authz.account_id)?;
    let jwk: Jwk = serde_json::from_value(jwk_json).map_err(Problem::server_internal)?;
    let thumbprint = jwk_thumbprint(&jwk)?;
    let expected_digest =
        b64_decode(&thumbprint).map_err(Problem::server_internal)?;

    let token = challenge.token.clone();
    let url = format!(
        "http://{}/.well-known/acme-challenge/{token}",
        authz.identifier.value
    );

    store.update_authz(&authz.id, |a| {
        if let Some(c) = a.challenges.get_mut(challenge_index) {
            c.status = ChallengeStatus::Processing;
        }
    })?;

    for _ in 0..max_attempts {
        if attempt(client, &url, &token, &expected_digest).await {
            store.update_authz(&authz.id, |a| {
                a.status = AuthzStatus::Valid;
                if let Some(c) = a.challenges.get_mut(challenge_index) {
                    c.status = ChallengeStatus::Valid;
                    c.validated = Some(Utc::now());
                }
            })?;
            debug!(authz_id = %authz.id, "HTTP-01 challenge verified");
            return Ok(());
        }

        tokio::time::sleep(pacing).await;
    }

    store.update_authz(&authz.id, |a| {
        a.status = AuthzStatus::Invalid;
        if let Some(c) = a.challenges.get_mut(challenge_index) {
            c.status = ChallengeStatus::Invalid;
        }
    })?;
    debug!(authz_id = %authz.id, "HTTP-01 challenge timed out");
    Ok(())
}

/// One fetch of the challenge URL. Network errors, oversized bodies and
/// mismatched content all just fail this attempt.
async fn attempt(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    expected_digest: &[u8],
) -> bool {
    let mut response = match client.get(url).send().await {
        Ok(resp) => resp,
        Err(err) => {
            debug!(url, error = %err, "challenge fetch failed");
            return false;
        }
    };

    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                    debug!(url, "challenge response exceeded size cap");
                    return false;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(url, error = %err, "failed to read challenge response");
                return false;
            }
        }
    }

    let Ok(body) = std::str::from_utf8(&body) else {
        return false;
    };
    let Some((got_token, got_thumbprint)) = body.split_once('.') else {
        return false;
    };
    if got_token != token {
        return false;
    }

    let Ok(decoded) = b64_decode(got_thumbprint.trim_end()) else {
        return false;
    };
    decoded == expected_digest
}
