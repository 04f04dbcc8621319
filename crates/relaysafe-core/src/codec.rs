//! Key encodings: bech32 (`npub` / `nsec`) and hex
//!
//! Public and private keys are 32-byte values. They are shown to users as
//! bech32 strings and written to the wire as lowercase hex.

use bech32::{Bech32, Hrp};

use crate::error::{SafeError, SafeResult};

/// Human-readable prefix for public keys
pub const NPUB_HRP: &str = "npub";

/// Human-readable prefix for private keys
pub const NSEC_HRP: &str = "nsec";

fn encode_bech32(hrp: &str, bytes: &[u8; 32]) -> SafeResult<String> {
    let hrp = Hrp::parse(hrp).map_err(|e| SafeError::InvalidKey(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, bytes).map_err(|e| SafeError::InvalidKey(e.to_string()))
}

fn decode_bech32(expected_hrp: &str, encoded: &str) -> SafeResult<[u8; 32]> {
    let expected = Hrp::parse(expected_hrp).map_err(|e| SafeError::InvalidKey(e.to_string()))?;
    let (hrp, data) =
        bech32::decode(encoded.trim()).map_err(|e| SafeError::InvalidKey(e.to_string()))?;

    if hrp != expected {
        return Err(SafeError::InvalidKey(format!(
            "expected {} prefix",
            expected_hrp
        )));
    }

    to_array32(&data)
}

fn to_array32(data: &[u8]) -> SafeResult<[u8; 32]> {
    data.try_into().map_err(|_| {
        SafeError::InvalidKey(format!("expected 32 bytes, got {}", data.len()))
    })
}

/// Encode a 32-byte x-only public key as `npub1...`
pub fn encode_npub(bytes: &[u8; 32]) -> SafeResult<String> {
    encode_bech32(NPUB_HRP, bytes)
}

/// Encode a 32-byte secret key as `nsec1...`
pub fn encode_nsec(bytes: &[u8; 32]) -> SafeResult<String> {
    encode_bech32(NSEC_HRP, bytes)
}

/// Decode an `npub1...` string
pub fn decode_npub(encoded: &str) -> SafeResult<[u8; 32]> {
    decode_bech32(NPUB_HRP, encoded)
}

/// Decode an `nsec1...` string
pub fn decode_nsec(encoded: &str) -> SafeResult<[u8; 32]> {
    decode_bech32(NSEC_HRP, encoded)
}

/// Decode a 64-character hex string into 32 bytes
pub fn decode_hex32(encoded: &str) -> SafeResult<[u8; 32]> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| SafeError::InvalidKey(e.to_string()))?;
    to_array32(&bytes)
}

/// Decode a public key given as either `npub1...` or hex
pub fn decode_public(encoded: &str) -> SafeResult<[u8; 32]> {
    let encoded = encoded.trim();
    if encoded.starts_with("npub1") {
        decode_npub(encoded)
    } else {
        decode_hex32(encoded)
    }
}

/// Decode a secret key given as either `nsec1...` or hex
pub fn decode_secret(encoded: &str) -> SafeResult<[u8; 32]> {
    let encoded = encoded.trim();
    if encoded.starts_with("nsec1") {
        decode_nsec(encoded)
    } else {
        decode_hex32(encoded)
    }
}
