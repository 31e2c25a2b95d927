//! Reversible, stable device-identifier tokens.
//!
//! A token is `enc.` followed by base64url (no padding) of
//! `nonce || ciphertext`. The 12-byte nonce is the truncated HMAC of the
//! device id under a derived key, so the same device always seals to the
//! same token and a token can be used as a lookup key by callers.

use crate::domain::{DomainError, DomainResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const DEVICE_TOKEN_PREFIX: &str = "enc.";

const HKDF_SALT: &[u8] = b"heatline.device-token";
const ENC_KEY_INFO: &[u8] = b"device-token.v1.enc";
const NONCE_KEY_INFO: &[u8] = b"device-token.v1.nonce";
const TOKEN_AAD: &[u8] = b"device-token.v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SECRET_LEN: usize = 16;

pub struct DeviceTokenizer {
    cipher: Aes256Gcm,
    nonce_key: [u8; 32],
}

impl DeviceTokenizer {
    pub fn new(secret: &[u8]) -> DomainResult<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(DomainError::ValidationError(format!(
                "token secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret);
        let mut enc_key = [0u8; 32];
        let mut nonce_key = [0u8; 32];
        hk.expand(ENC_KEY_INFO, &mut enc_key)
            .and_then(|_| hk.expand(NONCE_KEY_INFO, &mut nonce_key))
            .map_err(|e| anyhow::anyhow!("hkdf expand failed: {}", e))?;

        let cipher = Aes256Gcm::new_from_slice(&enc_key)
            .map_err(|e| anyhow::anyhow!("cipher init failed: {}", e))?;

        Ok(Self { cipher, nonce_key })
    }

    fn nonce_for(&self, device_id: &[u8]) -> DomainResult<[u8; NONCE_LEN]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.nonce_key)
            .map_err(|e| anyhow::anyhow!("hmac init failed: {}", e))?;
        mac.update(device_id);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        Ok(nonce)
    }

    /// Seal a device id into its stable token
    pub fn seal(&self, device_id: &str) -> DomainResult<String> {
        let nonce = self.nonce_for(device_id.as_bytes())?;
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: device_id.as_bytes(),
                    aad: TOKEN_AAD,
                },
            )
            .map_err(|e| anyhow::anyhow!("encrypt failed: {}", e))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", DEVICE_TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(blob)))
    }

    /// Recover the device id from a token. Any malformed, tampered or
    /// foreign token yields `None`.
    pub fn unseal(&self, token: &str) -> Option<String> {
        let encoded = token.strip_prefix(DEVICE_TOKEN_PREFIX)?;
        let blob = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: TOKEN_AAD,
                },
            )
            .ok()?;

        // Only tokens produced by `seal` carry the derived nonce
        if self.nonce_for(&plaintext).ok()?.as_slice() != nonce {
            return None;
        }

        String::from_utf8(plaintext).ok()
    }
}

pub fn is_device_token(value: &str) -> bool {
    value.starts_with(DEVICE_TOKEN_PREFIX)
}

/// Partial identifier for low-trust display, e.g. `hp-0…0042`
pub fn mask_device_id(device_id: &str) -> String {
    let chars: Vec<char> = device_id.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}
