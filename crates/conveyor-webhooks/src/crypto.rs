//! Payload signing and secret storage.
//!
//! Delivery payloads are signed with HMAC-SHA256 over `{timestamp}.{body}`
//! so subscribers can verify authenticity and reject stale deliveries.
//! Subscription secrets are stored AES-256-GCM encrypted.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::WebhookError;

/// AES-GCM nonce size (96 bits).
const NONCE_SIZE: usize = 12;

/// Required encryption key size (AES-256).
const KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Payload signatures
// ---------------------------------------------------------------------------

/// Sign a delivery payload. Returns the hex-encoded HMAC-SHA256 of
/// `{timestamp}.{body}` under the subscriber's shared secret.
pub fn sign_payload(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");

    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    hex::encode(mac.finalize().into_bytes())
}

/// Verify a payload signature in constant time.
pub fn verify_payload(signature_hex: &str, secret: &str, timestamp: &str, body: &[u8]) -> bool {
    let expected = sign_payload(secret, timestamp, body);
    expected.as_bytes().ct_eq(signature_hex.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// Secrets at rest
// ---------------------------------------------------------------------------

/// Encrypt a subscription secret for storage.
///
/// Output format: `base64(nonce || ciphertext || tag)`. Each call uses a
/// fresh random nonce from the OS CSPRNG.
pub fn encrypt_secret(plaintext: &str, key: &[u8]) -> Result<String, WebhookError> {
    let cipher = build_cipher(key)?;

    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|e| WebhookError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&sealed))
}

/// Decrypt a stored subscription secret.
pub fn decrypt_secret(encoded: &str, key: &[u8]) -> Result<String, WebhookError> {
    let cipher = build_cipher(key)?;

    let sealed = BASE64
        .decode(encoded)
        .map_err(|e| WebhookError::EncryptionFailed(format!("base64 decode failed: {e}")))?;

    if sealed.len() <= NONCE_SIZE {
        return Err(WebhookError::EncryptionFailed(
            "sealed secret too short".to_string(),
        ));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| WebhookError::EncryptionFailed(e.to_string()))?;

    String::from_utf8(plaintext).map_err(|e| WebhookError::EncryptionFailed(e.to_string()))
}

fn build_cipher(key: &[u8]) -> Result<Aes256Gcm, WebhookError> {
    if key.len() != KEY_SIZE {
        return Err(WebhookError::EncryptionFailed(format!(
            "expected a {KEY_SIZE}-byte key, got {}",
            key.len()
        )));
    }

    Aes256Gcm::new_from_slice(key).map_err(|e| WebhookError::EncryptionFailed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
