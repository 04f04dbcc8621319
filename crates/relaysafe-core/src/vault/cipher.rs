//! PIN-derived vault encryption (PBKDF2-HMAC-SHA256 + AES-256-GCM)
//!
//! Current envelope (JSON, all binary fields base64):
//!
//! ```text
//! { "v": 2, "iter": 310000, "salt": "..", "iv": "..", "data": ".." }
//! ```
//!
//! Salt and IV are fresh on every seal, so identical plaintext never
//! produces identical blobs, and the salt travels with the data.
//!
//! The legacy envelope is `base64(iv) ":" base64(ciphertext)` with the salt
//! kept under a separate storage key. It can still be opened and is
//! re-sealed in the current format on the next write.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::{MAX_PBKDF2_ITERATIONS, MIN_PBKDF2_ITERATIONS};
use crate::error::{SafeError, SafeResult};

/// Current envelope version
pub const ENVELOPE_VERSION: u8 = 2;

/// Salt length in bytes
pub const SALT_SIZE: usize = 16;

/// AES-GCM nonce length in bytes
pub const IV_SIZE: usize = 12;

/// Iterations assumed for envelopes that do not record their own
pub const LEGACY_ITERATIONS: u32 = MIN_PBKDF2_ITERATIONS;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    #[serde(default = "legacy_iterations")]
    iter: u32,
    salt: String,
    iv: String,
    data: String,
}

fn legacy_iterations() -> u32 {
    LEGACY_ITERATIONS
}

/// Derive the 256-bit vault key from a PIN
pub fn derive_key(pin: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(pin.as_bytes(), salt, iterations, &mut key[..]);
    key
}

fn aes_encrypt(key: &[u8; 32], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> SafeResult<Vec<u8>> {
    Aes256Gcm::new(key.into())
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|e| SafeError::Crypto(format!("vault encryption failed: {}", e)))
}

fn aes_decrypt(key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> SafeResult<Vec<u8>> {
    if iv.len() != IV_SIZE {
        return Err(SafeError::DecryptionFailed("vault IV must be 12 bytes".to_string()));
    }
    Aes256Gcm::new(key.into())
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| SafeError::DecryptionFailed("vault authentication failed".to_string()))
}

fn decode_b64(field: &str, value: &str) -> SafeResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| SafeError::Serialization(format!("vault {}: {}", field, e)))
}

/// Encrypt `plaintext` into a current-format envelope
pub fn seal(plaintext: &[u8], pin: &str, iterations: u32) -> SafeResult<String> {
    let iterations = iterations.clamp(MIN_PBKDF2_ITERATIONS, MAX_PBKDF2_ITERATIONS);
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut iv);

    let key = derive_key(pin, &salt, iterations);
    let data = aes_encrypt(&key, &iv, plaintext)?;

    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        iter: iterations,
        salt: BASE64.encode(salt),
        iv: BASE64.encode(iv),
        data: BASE64.encode(data),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Whether `blob` is shaped like a current-format envelope
pub fn is_envelope(blob: &str) -> bool {
    blob.trim_start().starts_with('{')
}

/// Decrypt a current-format envelope.
///
/// A wrong PIN and a tampered blob both yield
/// [`SafeError::DecryptionFailed`]; the caller decides what that costs.
/// An iteration count outside the accepted range is a
/// [`SafeError::Serialization`] error and no key is derived.
pub fn open(blob: &str, pin: &str) -> SafeResult<Zeroizing<Vec<u8>>> {
    let envelope: Envelope = serde_json::from_str(blob)?;
    if envelope.v != ENVELOPE_VERSION {
        return Err(SafeError::UnsupportedVersion(envelope.v));
    }
    if !(MIN_PBKDF2_ITERATIONS..=MAX_PBKDF2_ITERATIONS).contains(&envelope.iter) {
        return Err(SafeError::Serialization(format!(
            "vault iteration count {} out of range",
            envelope.iter
        )));
    }

    let salt = decode_b64("salt", &envelope.salt)?;
    let iv = decode_b64("iv", &envelope.iv)?;
    let data = decode_b64("data", &envelope.data)?;

    let key = derive_key(pin, &salt, envelope.iter);
    Ok(Zeroizing::new(aes_decrypt(&key, &iv, &data)?))
}

/// Decrypt a legacy `iv:ciphertext` blob with its separately stored salt
pub fn open_legacy(blob: &str, salt: &[u8], pin: &str) -> SafeResult<Zeroizing<Vec<u8>>> {
    let (iv, data) = blob
        .trim()
        .split_once(':')
        .ok_or_else(|| SafeError::Serialization("legacy vault missing IV separator".to_string()))?;
    let iv = decode_b64("iv", iv)?;
    let data = decode_b64("data", data)?;

    let key = derive_key(pin, salt, LEGACY_ITERATIONS);
    Ok(Zeroizing::new(aes_decrypt(&key, &iv, &data)?))
}

/// Produce a legacy blob and its salt (migration tests only)
#[cfg(test)]
pub(crate) fn seal_legacy(plaintext: &[u8], pin: &str) -> (String, Vec<u8>) {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut iv);
    let key = derive_key(pin, &salt, LEGACY_ITERATIONS);
    let data = aes_encrypt(&key, &iv, plaintext).unwrap();
    (
        format!("{}:{}", BASE64.encode(iv), BASE64.encode(data)),
        salt.to_vec(),
    )
}
