//! Small shared helpers: identifier generation and base64url codecs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

/// base64url without padding, the encoding used for every opaque token in
/// the protocol.
pub fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}

/// New object id: 16 random bytes, base64url (22 chars).
pub fn generate_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    b64_encode(&buf)
}

/// New challenge token: 32 random bytes, base64url (43 chars).
pub fn generate_challenge_token() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    b64_encode(&buf)
}
