//! Shared HMAC-SHA256 helpers.
//!
//! Every subsystem that needs a keyed MAC (event signatures, session
//! tokens, elicitation response binding) goes through these two functions
//! rather than constructing `Hmac` directly, so the construction is
//! reviewed once.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes `HMAC-SHA256(key, message)`, hex-encoded.
pub fn sign(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    hex_encode(&mac.finalize().into_bytes())
}

/// Verifies a hex-encoded MAC in constant time relative to the computed
/// digest (the underlying `hmac` crate's `verify_slice` is constant-time;
/// we decode the caller-supplied hex first, which is not on the secret
/// path).
pub fn verify(key: &[u8], message: &[u8], expected_hex: &str) -> bool {
    let Some(expected) = hex_decode(expected_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).expect("writing to a String cannot fail");
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
