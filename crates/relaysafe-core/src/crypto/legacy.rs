//! Scheme v1: AES-256-CBC keyed by the raw ECDH x coordinate
//!
//! Wire format: `base64(ciphertext) + "?iv=" + base64(iv)`.
//!
//! There is no integrity tag. A wrong key or a flipped byte shows up as a
//! padding error at best and as garbage plaintext at worst; callers treat
//! any failure as a per-record decryption failure.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use secp256k1::{SecretKey, XOnlyPublicKey};
use zeroize::Zeroize;

use super::shared_x;
use crate::error::{SafeError, SafeResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Separator between ciphertext and IV
pub const IV_SEPARATOR: &str = "?iv=";

/// IV size for AES-CBC (16 bytes)
pub const IV_SIZE: usize = 16;

/// Encrypt with a fresh random IV
pub fn encrypt(plaintext: &str, local: &SecretKey, remote: &XOnlyPublicKey) -> SafeResult<String> {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let mut key = shared_x(local, remote);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    key.zeroize();

    Ok(format!(
        "{}{}{}",
        BASE64.encode(ciphertext),
        IV_SEPARATOR,
        BASE64.encode(iv)
    ))
}

/// Decrypt a `ciphertext?iv=iv` payload
pub fn decrypt(payload: &str, local: &SecretKey, remote: &XOnlyPublicKey) -> SafeResult<String> {
    let (ciphertext, iv) = payload
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| SafeError::DecryptionFailed("missing IV separator".to_string()))?;

    let ciphertext = BASE64
        .decode(ciphertext)
        .map_err(|e| SafeError::DecryptionFailed(format!("invalid ciphertext encoding: {}", e)))?;
    let iv: [u8; IV_SIZE] = BASE64
        .decode(iv)
        .map_err(|e| SafeError::DecryptionFailed(format!("invalid IV encoding: {}", e)))?
        .try_into()
        .map_err(|_| SafeError::DecryptionFailed("IV must be 16 bytes".to_string()))?;

    let mut key = shared_x(local, remote);
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| SafeError::DecryptionFailed("invalid padding".to_string()));
    key.zeroize();

    String::from_utf8(plaintext?)
        .map_err(|_| SafeError::DecryptionFailed("plaintext is not UTF-8".to_string()))
}
