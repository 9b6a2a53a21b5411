//! Replay-nonce service
//!
//! Nonces are self-verifying: the server seals `{timestamp, inner counter,
//! outer counter}` with XChaCha20-Poly1305 under a key generated at startup,
//! so a nonce needs no storage of its own. Replay protection is a circular
//! bitmap over the 16-bit inner counter: a nonce is accepted if its counters
//! fall within the last full lap and its bitmap slot is still clear.
//! Restarting the process rotates the key and invalidates every outstanding
//! nonce, which ACME clients handle by retrying with a fresh one.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::util::{b64_decode, b64_encode};

/// Size of the sealed tuple: u64 timestamp + u16 inner + u32 outer, all LE.
const PLAINTEXT_SIZE: usize = 8 + 2 + 4;

/// XChaCha20-Poly1305 nonce prefix length.
const AEAD_NONCE_SIZE: usize = 24;

/// One slot per inner-counter value.
const SLOTS: usize = 1 << 16;

/// Default nonce lifetime.
const DEFAULT_LIFETIME_SECS: i64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NonceError {
    #[error("nonce is not decodable")]
    Malformed,
    #[error("nonce expired {0} seconds ago")]
    Expired(i64),
    #[error("nonce counters fall outside the acceptance window")]
    OutOfWindow,
    #[error("nonce has already been used")]
    Replayed,
    #[error("failed to seal nonce")]
    Seal,
}

struct NonceState {
    used: Box<[bool; SLOTS]>,
    inner_counter: u16,
    outer_counter: u32,
}

/// Generates and consumes replay nonces. All state is process-local.
pub struct NonceService {
    cipher: XChaCha20Poly1305,
    max_lifetime: Duration,
    state: Mutex<NonceState>,
}

struct NonceData {
    timestamp: u64,
    inner: u16,
    outer: u32,
}

impl NonceService {
    pub fn new() -> Self {
        Self::with_lifetime(Duration::seconds(DEFAULT_LIFETIME_SECS))
    }

    pub fn with_lifetime(max_lifetime: Duration) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

        Self {
            cipher,
            max_lifetime,
            state: Mutex::new(NonceState {
                used: Box::new([false; SLOTS]),
                inner_counter: 0,
                outer_counter: 0,
            }),
        }
    }

    fn seal(&self, data: &NonceData) -> Result<Vec<u8>, NonceError> {
        let mut plaintext = [0u8; PLAINTEXT_SIZE];
        plaintext[..8].copy_from_slice(&data.timestamp.to_le_bytes());
        plaintext[8..10].copy_from_slice(&data.inner.to_le_bytes());
        plaintext[10..].copy_from_slice(&data.outer.to_le_bytes());

        let mut aead_nonce = [0u8; AEAD_NONCE_SIZE];
        OsRng.fill_bytes(&mut aead_nonce);

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&aead_nonce), plaintext.as_slice())
            .map_err(|_| NonceError::Seal)?;

        let mut out = Vec::with_capacity(AEAD_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&aead_nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<NonceData, NonceError> {
        if sealed.len() < AEAD_NONCE_SIZE {
            return Err(NonceError::Malformed);
        }
        let (aead_nonce, ciphertext) = sealed.split_at(AEAD_NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(aead_nonce), ciphertext)
            .map_err(|_| NonceError::Malformed)?;

        if plaintext.len() != PLAINTEXT_SIZE {
            return Err(NonceError::Malformed);
        }

        Ok(NonceData {
            timestamp: u64::from_le_bytes(plaintext[..8].try_into().unwrap()),
            inner: u16::from_le_bytes(plaintext[8..10].try_into().unwrap()),
            outer: u32::from_le_bytes(plaintext[10..].try_into().unwrap()),
        })
    }

    /// Issue a fresh nonce.
    pub fn generate(&self) -> Result<String, NonceError> {
        let mut state = self.state.lock();

        let sealed = self.seal(&NonceData {
            timestamp: Utc::now().timestamp() as u64,
            inner: state.inner_counter,
            outer: state.outer_counter,
        })?;

        // The slot for the nonce being handed out starts clear; validation
        // is what sets it.
        let slot = state.inner_counter as usize;
        state.used[slot] = false;

        state.inner_counter = state.inner_counter.wrapping_add(1);
        if state.inner_counter == 0 {
            state.outer_counter = state.outer_counter.wrapping_add(1);
        }

        Ok(b64_encode(&sealed))
    }

    /// Validate a nonce and mark it consumed. Each nonce validates at most
    /// once; anything older than one full lap of the inner counter, or than
    /// the lifetime, is rejected.
    pub fn validate_and_consume(&self, nonce: &str) -> Result<(), NonceError> {
        let mut state = self.state.lock();

        let sealed = b64_decode(nonce).map_err(|_| NonceError::Malformed)?;
        let data = self.open(&sealed)?;

        let now = Utc::now().timestamp();
        let expiry = data.timestamp as i64 + self.max_lifetime.num_seconds();
        if now > expiry {
            return Err(NonceError::Expired(now - expiry));
        }

        // Two valid cases:
        // 1) same outer counter, inner at or below the current position
        // 2) previous outer counter, inner above the current position
        // Together these describe exactly one circular lap of live slots.
        let valid_this_lap =
            data.outer == state.outer_counter && data.inner <= state.inner_counter;
        let valid_last_lap = state.outer_counter != 0
            && data.outer == state.outer_counter - 1
            && data.inner > state.inner_counter;

        if !(valid_this_lap || valid_last_lap) {
            return Err(NonceError::OutOfWindow);
        }

        let slot = data.inner as usize;
        if state.used[slot] {
            return Err(NonceError::Replayed);
        }
        state.used[slot] = true;
        Ok(())
    }
}

impl Default for NonceService {
    fn default() -> Self {
        Self::new()
    }
}
