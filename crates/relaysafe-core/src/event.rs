//! Protocol records ("events")
//!
//! An event is `{kind, pubkey, created_at, tags, content}` plus its id and
//! signature. The id is the SHA-256 of the canonical serialization
//!
//! ```text
//! [0, <pubkey hex>, <created_at>, <kind>, <tags>, <content>]
//! ```
//!
//! so the same fields always hash to the same id. That id is what relays
//! and the aggregator deduplicate on.
//!
//! Two kinds matter here:
//!
//! - **4** (encrypted direct message): carries a secret's ciphertext,
//!   tagged `["p", <recipient>]`. Secrets are self-addressed.
//! - **5** (deletion): `["e", <id>]` tags name the events being deleted.

use secp256k1::{schnorr, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SafeError, SafeResult};
use crate::keys::Keys;

/// Event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    /// Encrypted direct message
    pub const ENCRYPTED_DIRECT_MESSAGE: Kind = Kind(4);
    /// Deletion request
    pub const DELETION: Kind = Kind(5);

    /// Numeric value
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event fields before hashing and signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Author public key (hex)
    pub pubkey: String,
    /// Declared creation time (unix seconds)
    pub created_at: u64,
    /// Event kind
    pub kind: Kind,
    /// Tag list
    pub tags: Vec<Vec<String>>,
    /// Content
    pub content: String,
}

impl UnsignedEvent {
    /// Build event fields stamped with the current time
    pub fn new(kind: Kind, author: &XOnlyPublicKey, tags: Vec<Vec<String>>, content: String) -> Self {
        Self {
            pubkey: hex::encode(author.serialize()),
            created_at: chrono::Utc::now().timestamp().max(0) as u64,
            kind,
            tags,
            content,
        }
    }

    /// Override the creation time
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Canonical serialization the id is computed over
    pub fn canonical_json(&self) -> String {
        serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind.0,
            self.tags,
            self.content
        ])
        .to_string()
    }

    /// SHA-256 of the canonical serialization
    pub fn id_bytes(&self) -> [u8; 32] {
        Sha256::digest(self.canonical_json().as_bytes()).into()
    }

    /// Hex event id
    pub fn id(&self) -> String {
        hex::encode(self.id_bytes())
    }

    /// Hash and sign with the author's keys.
    ///
    /// Fails if `keys` is not the author named in `pubkey`.
    pub fn sign(self, keys: &Keys) -> SafeResult<SignedEvent> {
        if keys.public_hex() != self.pubkey {
            return Err(SafeError::InvalidEvent(
                "signing key does not match event author".to_string(),
            ));
        }

        let id = self.id_bytes();
        let mut aux = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut aux);

        let secp = Secp256k1::new();
        let sig = secp.sign_schnorr_with_aux_rand(&Message::from_digest(id), &keys.keypair(), &aux);

        Ok(SignedEvent {
            id: hex::encode(id),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.to_string(),
        })
    }
}

/// Build unsigned event fields
pub fn build_event(
    kind: Kind,
    author: &XOnlyPublicKey,
    tags: Vec<Vec<String>>,
    content: impl Into<String>,
) -> UnsignedEvent {
    UnsignedEvent::new(kind, author, tags, content.into())
}

/// A signed, content-addressed event as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    /// Hex SHA-256 of the canonical serialization
    pub id: String,
    /// Author public key (hex)
    pub pubkey: String,
    /// Declared creation time (unix seconds)
    pub created_at: u64,
    /// Event kind
    pub kind: Kind,
    /// Tag list
    pub tags: Vec<Vec<String>>,
    /// Content
    pub content: String,
    /// Hex schnorr signature over the id
    pub sig: String,
}

impl SignedEvent {
    /// The hashed fields of this event
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Recompute the id and check the signature
    pub fn verify(&self) -> bool {
        self.verify_strict().is_ok()
    }

    /// Like [`verify`](Self::verify) but says what is wrong
    pub fn verify_strict(&self) -> SafeResult<()> {
        let id = self.unsigned().id_bytes();
        if hex::encode(id) != self.id {
            return Err(SafeError::SignatureInvalid(format!(
                "id mismatch for event {}",
                self.id
            )));
        }

        let author_bytes = hex::decode(&self.pubkey)
            .map_err(|e| SafeError::SignatureInvalid(format!("bad pubkey: {}", e)))?;
        let author = XOnlyPublicKey::from_slice(&author_bytes)
            .map_err(|e| SafeError::SignatureInvalid(format!("bad pubkey: {}", e)))?;
        let sig: schnorr::Signature = self
            .sig
            .parse()
            .map_err(|e| SafeError::SignatureInvalid(format!("bad signature: {}", e)))?;

        Secp256k1::verification_only()
            .verify_schnorr(&sig, &Message::from_digest(id), &author)
            .map_err(|e| SafeError::SignatureInvalid(format!("event {}: {}", self.id, e)))
    }

    /// Values of every tag named `name` (first element after the name)
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// First `p` tag value
    pub fn recipient(&self) -> Option<&str> {
        self.tag_values("p").next()
    }

    /// Author and tagged recipient are the same identity
    pub fn is_self_addressed(&self) -> bool {
        self.recipient() == Some(self.pubkey.as_str())
    }

    /// Wire JSON
    pub fn to_json(&self) -> SafeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire JSON (does not verify)
    pub fn from_json(json: &str) -> SafeResult<Self> {
        serde_json::from_str(json).map_err(|e| SafeError::InvalidEvent(e.to_string()))
    }
}

/// Kind-4 event carrying `ciphertext` to `recipient`
pub fn encrypted_direct_message(
    keys: &Keys,
    recipient: &XOnlyPublicKey,
    ciphertext: impl Into<String>,
) -> SafeResult<SignedEvent> {
    let tags = vec![vec!["p".to_string(), hex::encode(recipient.serialize())]];
    build_event(
        Kind::ENCRYPTED_DIRECT_MESSAGE,
        &keys.public_key(),
        tags,
        ciphertext,
    )
    .sign(keys)
}

/// Kind-5 deletion request for `event_ids`
pub fn deletion(keys: &Keys, event_ids: &[String], reason: &str) -> SafeResult<SignedEvent> {
    let tags = event_ids
        .iter()
        .map(|id| vec!["e".to_string(), id.clone()])
        .collect();
    build_event(Kind::DELETION, &keys.public_key(), tags, reason).sign(keys)
}
