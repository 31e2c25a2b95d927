//! Device request signing.
//!
//! Devices hold a shared key; the server stores only its SHA-256 hex digest.
//! Requests are signed with `HMAC-SHA256(key = digest, msg = timestamp + "." + body)`
//! and the signature travels hex encoded.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Lower-case hex SHA-256 of `value`
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Constant-time check that `device_key` hashes to `stored_hash`
pub fn device_key_matches(device_key: &str, stored_hash: &str) -> bool {
    let computed = sha256_hex(device_key);
    let stored = stored_hash.trim().to_ascii_lowercase();
    computed.as_bytes().ct_eq(stored.as_bytes()).into()
}

fn signing_mac(key_hash: &str, timestamp: &str, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key_hash.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(mac)
}

/// Hex signature a device sends for `body` at `timestamp`
pub fn sign_device_request(key_hash: &str, timestamp: &str, body: &[u8]) -> String {
    signing_mac(key_hash, timestamp, body)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Verify a hex signature in constant time
pub fn verify_device_signature(key_hash: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(signature) = hex::decode(signature.trim()) else {
        return false;
    };
    match signing_mac(key_hash, timestamp, body) {
        Some(mac) => mac.verify_slice(&signature).is_ok(),
        None => false,
    }
}
