//! secp256k1 owner keypairs
//!
//! A [`Keys`] value holds a secret key and its x-only public key. The public
//! key is the author identity on relays; the secret key signs records and
//! feeds the ECDH used by both encryption schemes.

use rand::RngCore;
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use zeroize::Zeroize;

use crate::codec;
use crate::error::{SafeError, SafeResult};

/// An owner keypair
#[derive(Clone)]
pub struct Keys {
    secret: SecretKey,
    public: XOnlyPublicKey,
}

impl Keys {
    /// Generate a new random keypair from the OS RNG
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            let parsed = Self::from_secret_bytes(&bytes);
            bytes.zeroize();
            // Out-of-range scalars are astronomically rare; draw again
            if let Ok(keys) = parsed {
                return keys;
            }
        }
    }

    /// Build a keypair from raw secret key bytes
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> SafeResult<Self> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| SafeError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret))
    }

    /// Parse a secret key given as `nsec1...` or hex
    pub fn parse(secret: &str) -> SafeResult<Self> {
        let mut bytes = codec::decode_secret(secret)?;
        let keys = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        keys
    }

    fn from_secret_key(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (public, _) = keypair.x_only_public_key();
        Self { secret, public }
    }

    /// The secp256k1 secret key
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// The x-only public key
    pub fn public_key(&self) -> XOnlyPublicKey {
        self.public
    }

    /// Public key as lowercase hex (wire format)
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// Public key as `npub1...`
    pub fn npub(&self) -> SafeResult<String> {
        codec::encode_npub(&self.public.serialize())
    }

    /// Secret key as `nsec1...`
    pub fn nsec(&self) -> SafeResult<String> {
        codec::encode_nsec(&self.secret.secret_bytes())
    }

    /// Keypair for schnorr signing
    pub(crate) fn keypair(&self) -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_secret_key(&secp, &self.secret)
    }
}

impl PartialEq for Keys {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for Keys {}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public_hex())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Parse a public key given as `npub1...` or hex
pub fn parse_public_key(encoded: &str) -> SafeResult<XOnlyPublicKey> {
    let bytes = codec::decode_public(encoded)?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| SafeError::InvalidKey(e.to_string()))
}

/// Normalise a public key string (`npub1...` or hex) to lowercase hex
pub fn public_key_hex(encoded: &str) -> SafeResult<String> {
    parse_public_key(encoded).map(|pk| hex::encode(pk.serialize()))
}
