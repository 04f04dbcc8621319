//! Per-secret encryption schemes
//!
//! Two interchangeable schemes keyed by a secp256k1 ECDH shared secret:
//!
//! - **v1 (legacy)**: AES-256-CBC with a random IV, no integrity tag.
//!   Decrypt-only in practice; kept so old records stay readable.
//! - **v2 (current)**: ChaCha20 + HMAC-SHA256 under an HKDF-derived
//!   conversation key, with power-of-two length padding.
//!
//! Both are pure: no I/O, no vault access.

pub mod conversation;
pub mod legacy;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use secp256k1::{ecdh, Parity, PublicKey, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{SafeError, SafeResult};

/// Encryption scheme selector carried next to every secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EncryptionScheme {
    /// AES-256-CBC, `base64(ct)?iv=base64(iv)`
    Legacy,
    /// ChaCha20 + HMAC-SHA256, self-describing base64 payload
    Current,
}

impl EncryptionScheme {
    /// Numeric version tag
    pub fn version(self) -> u8 {
        match self {
            EncryptionScheme::Legacy => 1,
            EncryptionScheme::Current => conversation::VERSION,
        }
    }

    /// Resolve a numeric version tag
    pub fn from_version(version: u8) -> SafeResult<Self> {
        match version {
            1 => Ok(EncryptionScheme::Legacy),
            conversation::VERSION => Ok(EncryptionScheme::Current),
            other => Err(SafeError::UnsupportedVersion(other)),
        }
    }

    /// Best-effort classification of an untagged ciphertext.
    ///
    /// The legacy IV separator implies v1; a payload whose first decoded
    /// byte is the v2 version byte implies v2; anything else is treated as
    /// v1. Only used on explicitly lenient read paths.
    pub fn detect(ciphertext: &str) -> Self {
        if ciphertext.contains(legacy::IV_SEPARATOR) {
            return EncryptionScheme::Legacy;
        }
        match BASE64.decode(ciphertext.trim()) {
            Ok(bytes) if bytes.first() == Some(&conversation::VERSION) => {
                EncryptionScheme::Current
            }
            _ => EncryptionScheme::Legacy,
        }
    }

    /// Encrypt `plaintext` from `local` to `remote`
    pub fn encrypt(
        self,
        plaintext: &str,
        local: &SecretKey,
        remote: &XOnlyPublicKey,
    ) -> SafeResult<String> {
        match self {
            EncryptionScheme::Legacy => legacy::encrypt(plaintext, local, remote),
            EncryptionScheme::Current => conversation::encrypt(plaintext, local, remote),
        }
    }

    /// Decrypt `ciphertext` sent between `local` and `remote`
    pub fn decrypt(
        self,
        ciphertext: &str,
        local: &SecretKey,
        remote: &XOnlyPublicKey,
    ) -> SafeResult<String> {
        match self {
            EncryptionScheme::Legacy => legacy::decrypt(ciphertext, local, remote),
            EncryptionScheme::Current => conversation::decrypt(ciphertext, local, remote),
        }
    }
}

impl Default for EncryptionScheme {
    fn default() -> Self {
        EncryptionScheme::Current
    }
}

impl TryFrom<u8> for EncryptionScheme {
    type Error = SafeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_version(value)
    }
}

impl From<EncryptionScheme> for u8 {
    fn from(scheme: EncryptionScheme) -> Self {
        scheme.version()
    }
}

/// X coordinate of the ECDH point between `local` and `remote`.
///
/// Remote keys are x-only; the even-parity lift is used, which yields the
/// same x coordinate as the odd one.
pub(crate) fn shared_x(local: &SecretKey, remote: &XOnlyPublicKey) -> [u8; 32] {
    let remote = PublicKey::from_x_only_public_key(*remote, Parity::Even);
    let point = ecdh::shared_secret_point(&remote, local);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}
