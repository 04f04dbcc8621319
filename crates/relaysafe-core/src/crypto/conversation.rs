//! Scheme v2: padded ChaCha20 + HMAC-SHA256 under a conversation key
//!
//! ## Key schedule
//!
//! ```text
//! shared_x          = ECDH(local, remote).x
//! conversation_key  = HKDF-Extract(salt = "nip44-v2", ikm = shared_x)
//! message_keys      = HKDF-Expand(conversation_key, info = nonce, L = 76)
//!                     ├── chacha_key   [0..32]
//!                     ├── chacha_nonce [32..44]
//!                     └── hmac_key     [44..76]
//! ```
//!
//! ## Wire format
//!
//! ```text
//! base64( version (1) | nonce (32) | ciphertext (padded) | mac (32) )
//! ```
//!
//! The MAC covers `nonce || ciphertext` and is checked in constant time
//! before any decryption happens.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{SecretKey, XOnlyPublicKey};
use sha2::Sha256;
use zeroize::Zeroize;

use super::shared_x;
use crate::error::{SafeError, SafeResult};

type HmacSha256 = Hmac<Sha256>;

/// Version byte leading every v2 payload
pub const VERSION: u8 = 2;

/// Nonce size (32 bytes)
pub const NONCE_SIZE: usize = 32;

/// MAC size (32 bytes)
pub const MAC_SIZE: usize = 32;

/// Largest plaintext the length prefix can describe
pub const MAX_PLAINTEXT_LEN: usize = 65_535;

const SALT: &[u8] = b"nip44-v2";
const MIN_PADDED_LEN: usize = 32;
// version + nonce + (length prefix + minimum padding) + mac
const MIN_PAYLOAD_LEN: usize = 1 + NONCE_SIZE + 2 + MIN_PADDED_LEN + MAC_SIZE;

/// Symmetric key shared by a pair of public keys
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// Derive the conversation key between `local` and `remote`
    pub fn derive(local: &SecretKey, remote: &XOnlyPublicKey) -> Self {
        let mut shared = shared_x(local, remote);
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared);
        shared.zeroize();
        Self(prk.into())
    }

    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn message_keys(&self, nonce: &[u8; NONCE_SIZE]) -> SafeResult<MessageKeys> {
        let hk = Hkdf::<Sha256>::from_prk(&self.0)
            .map_err(|e| SafeError::Crypto(format!("invalid conversation key: {}", e)))?;
        let mut okm = [0u8; 76];
        hk.expand(nonce, &mut okm)
            .map_err(|e| SafeError::Crypto(format!("key expansion failed: {}", e)))?;

        let mut keys = MessageKeys {
            chacha_key: [0u8; 32],
            chacha_nonce: [0u8; 12],
            hmac_key: [0u8; 32],
        };
        keys.chacha_key.copy_from_slice(&okm[0..32]);
        keys.chacha_nonce.copy_from_slice(&okm[32..44]);
        keys.hmac_key.copy_from_slice(&okm[44..76]);
        okm.zeroize();
        Ok(keys)
    }
}

impl Drop for ConversationKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(<redacted>)")
    }
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    fn apply_keystream(&self, buf: &mut [u8]) {
        let mut cipher = ChaCha20::new(&self.chacha_key.into(), &self.chacha_nonce.into());
        cipher.apply_keystream(buf);
    }

    fn mac(&self, nonce: &[u8], ciphertext: &[u8]) -> SafeResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key)
            .map_err(|e| SafeError::Crypto(format!("invalid HMAC key: {}", e)))?;
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }
}

impl Drop for MessageKeys {
    fn drop(&mut self) {
        self.chacha_key.zeroize();
        self.chacha_nonce.zeroize();
        self.hmac_key.zeroize();
    }
}

/// Padded length for a plaintext of `unpadded_len` bytes.
///
/// Lengths up to 32 pad to 32; beyond that the length is rounded up to a
/// chunk of the next power of two (32-byte chunks up to 256, then 1/8 of
/// the power).
pub fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= MIN_PADDED_LEN {
        return MIN_PADDED_LEN;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> SafeResult<Vec<u8>> {
    let len = plaintext.len();
    if len > MAX_PLAINTEXT_LEN {
        return Err(SafeError::Crypto(format!(
            "plaintext too long: {} bytes (max {})",
            len, MAX_PLAINTEXT_LEN
        )));
    }

    let padded_len = calc_padded_len(len);
    let mut padded = Vec::with_capacity(2 + padded_len);
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + padded_len, 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> SafeResult<Vec<u8>> {
    if padded.len() < 2 {
        return Err(SafeError::DecryptionFailed("invalid padding".to_string()));
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if 2 + len > padded.len() || padded.len() != 2 + calc_padded_len(len) {
        return Err(SafeError::DecryptionFailed("invalid padding".to_string()));
    }
    Ok(padded[2..2 + len].to_vec())
}

/// Encrypt between `local` and `remote` with a fresh random nonce
pub fn encrypt(plaintext: &str, local: &SecretKey, remote: &XOnlyPublicKey) -> SafeResult<String> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(&ConversationKey::derive(local, remote), plaintext, &nonce)
}

/// Encrypt under an explicit conversation key and nonce.
///
/// The nonce must never repeat for the same conversation key.
pub fn encrypt_with_nonce(
    key: &ConversationKey,
    plaintext: &str,
    nonce: &[u8; NONCE_SIZE],
) -> SafeResult<String> {
    let keys = key.message_keys(nonce)?;

    let mut buf = pad(plaintext.as_bytes())?;
    keys.apply_keystream(&mut buf);
    let tag = keys.mac(nonce, &buf)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + buf.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buf);
    payload.extend_from_slice(&tag);

    Ok(BASE64.encode(payload))
}

/// Decrypt a payload sent between `local` and `remote`
pub fn decrypt(payload: &str, local: &SecretKey, remote: &XOnlyPublicKey) -> SafeResult<String> {
    decrypt_with_key(&ConversationKey::derive(local, remote), payload)
}

/// Decrypt under an explicit conversation key.
///
/// Fails closed: no plaintext is produced unless the MAC verifies.
pub fn decrypt_with_key(key: &ConversationKey, payload: &str) -> SafeResult<String> {
    if payload.starts_with('#') {
        return Err(SafeError::UnsupportedVersion(0));
    }

    let raw = BASE64
        .decode(payload.trim())
        .map_err(|e| SafeError::DecryptionFailed(format!("invalid base64: {}", e)))?;

    if raw.len() < MIN_PAYLOAD_LEN {
        return Err(SafeError::DecryptionFailed(format!(
            "payload too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0] != VERSION {
        return Err(SafeError::UnsupportedVersion(raw[0]));
    }

    let nonce: [u8; NONCE_SIZE] = raw[1..1 + NONCE_SIZE]
        .try_into()
        .map_err(|_| SafeError::DecryptionFailed("invalid nonce".to_string()))?;
    let mac_start = raw.len() - MAC_SIZE;
    let ciphertext = &raw[1 + NONCE_SIZE..mac_start];
    let tag = &raw[mac_start..];

    let keys = key.message_keys(&nonce)?;
    keys.mac(&nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| SafeError::DecryptionFailed("authentication tag mismatch".to_string()))?;

    let mut buf = ciphertext.to_vec();
    keys.apply_keystream(&mut buf);
    let plaintext = unpad(&buf);
    buf.zeroize();

    String::from_utf8(plaintext?)
        .map_err(|_| SafeError::DecryptionFailed("plaintext is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keys;

    #[test]
    fn test_padded_lengths() {
        assert_eq!(calc_padded_len(0), 32);
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(37), 64);
        assert_eq!(calc_padded_len(65), 96);
        assert_eq!(calc_padded_len(100), 128);
        assert_eq!(calc_padded_len(256), 256);
        assert_eq!(calc_padded_len(257), 320);
        assert_eq!(calc_padded_len(383), 384);
        assert_eq!(calc_padded_len(1000), 1024);
        assert_eq!(calc_padded_len(65_535), 65_536);
    }

    #[test]
    fn test_roundtrip() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let ct = encrypt("current secret", alice.secret_key(), &bob.public_key()).unwrap();
        let pt = decrypt(&ct, bob.secret_key(), &alice.public_key()).unwrap();
        assert_eq!(pt, "current secret");
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let alice = Keys::generate();
        let ct = encrypt("", alice.secret_key(), &alice.public_key()).unwrap();
        assert_eq!(decrypt(&ct, alice.secret_key(), &alice.public_key()).unwrap(), "");
    }

    #[test]
    fn test_payload_shape() {
        let alice = Keys::generate();
        let ct = encrypt("abc", alice.secret_key(), &alice.public_key()).unwrap();
        let raw = BASE64.decode(&ct).unwrap();
        assert_eq!(raw[0], VERSION);
        assert_eq!(raw.len(), 1 + NONCE_SIZE + 2 + 32 + MAC_SIZE);
    }

    #[test]
    fn test_deterministic_with_fixed_nonce() {
        let key = ConversationKey::from_bytes([0x11; 32]);
        let nonce = [0x22; NONCE_SIZE];
        let a = encrypt_with_nonce(&key, "fixed", &nonce).unwrap();
        let b = encrypt_with_nonce(&key, "fixed", &nonce).unwrap();
        assert_eq!(a, b);
        assert_eq!(decrypt_with_key(&key, &a).unwrap(), "fixed");
    }

    #[test]
    fn test_conversation_key_symmetric() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        assert_eq!(
            ConversationKey::derive(alice.secret_key(), &bob.public_key()),
            ConversationKey::derive(bob.secret_key(), &alice.public_key())
        );
    }

    #[test]
    fn test_flipped_mac_byte_fails_closed() {
        let alice = Keys::generate();
        let ct = encrypt("tamper me", alice.secret_key(), &alice.public_key()).unwrap();
        let raw = BASE64.decode(&ct).unwrap();

        for offset in 1..=MAC_SIZE {
            let mut tampered = raw.clone();
            let idx = tampered.len() - offset;
            tampered[idx] ^= 0x01;
            let result = decrypt(
                &BASE64.encode(&tampered),
                alice.secret_key(),
                &alice.public_key(),
            );
            assert!(matches!(result, Err(SafeError::DecryptionFailed(_))));
        }
    }

    #[test]
    fn test_flipped_ciphertext_byte_fails_closed() {
        let alice = Keys::generate();
        let ct = encrypt("tamper me", alice.secret_key(), &alice.public_key()).unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        raw[1 + NONCE_SIZE + 3] ^= 0x80;
        let result = decrypt(&BASE64.encode(&raw), alice.secret_key(), &alice.public_key());
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();
        let ct = encrypt("for bob", alice.secret_key(), &bob.public_key()).unwrap();
        assert!(decrypt(&ct, eve.secret_key(), &alice.public_key()).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let alice = Keys::generate();
        let ct = encrypt("v", alice.secret_key(), &alice.public_key()).unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        raw[0] = 3;
        let result = decrypt(&BASE64.encode(&raw), alice.secret_key(), &alice.public_key());
        assert!(matches!(result, Err(SafeError::UnsupportedVersion(3))));
        assert!(matches!(
            decrypt("#future", alice.secret_key(), &alice.public_key()),
            Err(SafeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_too_long_plaintext_rejected() {
        let alice = Keys::generate();
        let big = "a".repeat(MAX_PLAINTEXT_LEN + 1);
        assert!(encrypt(&big, alice.secret_key(), &alice.public_key()).is_err());
    }
}
