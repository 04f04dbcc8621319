//! Secret payloads and records
//!
//! A secret travels in a double envelope:
//!
//! ```text
//! kind-4 event, self-addressed
//! └── content = encrypt(scheme, payload JSON)
//!     └── {"type":"nostr-secret","version":2,"title":..,"tags":[..],
//!          "content": encrypt(scheme, secret text)}
//! ```
//!
//! Title and tags only become visible after the outer layer is decrypted;
//! the inner `content` is decrypted on demand (reveal). Not every
//! self-addressed direct message is a secret: anything without the
//! `type` discriminator parses as [`ParsedPayload::NotASecret`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::EncryptionScheme;
use crate::error::{SafeError, SafeResult};
use crate::event::{encrypted_direct_message, SignedEvent};
use crate::keys::Keys;

/// Discriminator marking a decrypted payload as a vault secret
pub const SECRET_TYPE: &str = "nostr-secret";

/// Length of the id prefix used in placeholder titles
const PLACEHOLDER_PREFIX_LEN: usize = 8;

/// Decrypted outer payload of a secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPayload {
    /// Human title
    pub title: String,
    /// Free-text tag ids
    #[serde(default)]
    pub tags: Vec<String>,
    /// Encryption scheme version of `content`; absent in some old data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u8>,
    /// Scheme-specific ciphertext of the secret text
    pub content: String,
}

/// Result of classifying a decrypted direct message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPayload {
    /// A vault secret
    Secret(SecretPayload),
    /// Some other self-addressed message
    NotASecret,
}

impl ParsedPayload {
    /// Classify decrypted event content. Never fails.
    pub fn parse(plaintext: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(plaintext) else {
            return ParsedPayload::NotASecret;
        };
        if value.get("type").and_then(Value::as_str) != Some(SECRET_TYPE) {
            return ParsedPayload::NotASecret;
        }
        match serde_json::from_value::<SecretPayload>(value) {
            Ok(payload) => ParsedPayload::Secret(payload),
            Err(_) => ParsedPayload::NotASecret,
        }
    }
}

impl SecretPayload {
    /// Encrypt `secret` to the owner under `scheme`
    pub fn seal(
        keys: &Keys,
        title: &str,
        secret: &str,
        tags: Vec<String>,
        scheme: EncryptionScheme,
    ) -> SafeResult<Self> {
        Ok(Self {
            title: title.to_string(),
            tags,
            version: Some(scheme.version()),
            content: scheme.encrypt(secret, keys.secret_key(), &keys.public_key())?,
        })
    }

    /// JSON with the type discriminator
    pub fn to_json(&self) -> SafeResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), Value::from(SECRET_TYPE));
        }
        Ok(value.to_string())
    }

    /// Scheme named by the explicit version tag
    pub fn scheme(&self) -> SafeResult<EncryptionScheme> {
        match self.version {
            Some(version) => EncryptionScheme::from_version(version),
            None => Err(SafeError::MissingVersionTag),
        }
    }

    /// Scheme from the version tag, or sniffed from the ciphertext when the
    /// tag is absent
    pub fn scheme_lenient(&self) -> SafeResult<EncryptionScheme> {
        match self.version {
            Some(version) => EncryptionScheme::from_version(version),
            None => Ok(EncryptionScheme::detect(&self.content)),
        }
    }

    /// Decrypt the secret text; requires the version tag
    pub fn decode_secret(&self, keys: &Keys) -> SafeResult<String> {
        self.scheme()?
            .decrypt(&self.content, keys.secret_key(), &keys.public_key())
    }

    /// Decrypt the secret text, guessing the scheme if untagged
    pub fn decode_secret_lenient(&self, keys: &Keys) -> SafeResult<String> {
        self.scheme_lenient()?
            .decrypt(&self.content, keys.secret_key(), &keys.public_key())
    }
}

/// Build the self-addressed kind-4 event carrying a secret
pub fn encode_secret_event(
    keys: &Keys,
    title: &str,
    secret: &str,
    tags: Vec<String>,
    scheme: EncryptionScheme,
) -> SafeResult<SignedEvent> {
    let payload = SecretPayload::seal(keys, title, secret, tags, scheme)?;
    let content = encrypt_outer(keys, &payload, scheme)?;
    encrypted_direct_message(keys, &keys.public_key(), content)
}

/// Outer-layer ciphertext for a self-addressed secret, for queueing
pub fn encrypt_outer(
    keys: &Keys,
    payload: &SecretPayload,
    scheme: EncryptionScheme,
) -> SafeResult<String> {
    scheme.encrypt(&payload.to_json()?, keys.secret_key(), &keys.public_key())
}

/// Decrypt an event's outer layer and classify it.
///
/// The outer scheme is detected from the ciphertext shape: legacy clients
/// wrote v1 here, current ones write v2.
pub fn open_secret_event(event: &SignedEvent, keys: &Keys) -> SafeResult<ParsedPayload> {
    let scheme = EncryptionScheme::detect(&event.content);
    let plaintext = scheme.decrypt(&event.content, keys.secret_key(), &keys.public_key())?;
    Ok(ParsedPayload::parse(&plaintext))
}

/// Placeholder title shown before a record is hydrated
pub fn placeholder_title(event_id: &str) -> String {
    let end = event_id
        .char_indices()
        .nth(PLACEHOLDER_PREFIX_LEN)
        .map(|(idx, _)| idx)
        .unwrap_or(event_id.len());
    format!("Secret {}", &event_id[..end])
}

/// One logical secret as seen across relays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    /// Event id (identity)
    pub id: String,
    /// Owning vault key id
    pub key_id: String,
    /// Declared creation time (unix seconds)
    pub created_at: u64,
    /// Relays this exact id was observed on
    pub relays: BTreeSet<String>,
    /// Title (placeholder until hydrated)
    pub title: String,
    /// Tag ids (empty until hydrated)
    pub tags: Vec<String>,
    /// Decrypted outer payload
    pub payload: Option<SecretPayload>,
    /// Why the payload could not be fully read, if it could not
    pub hydration_error: Option<String>,
    /// The original signed event, forwarded verbatim by sync
    pub event: SignedEvent,
}

impl SecretRecord {
    /// Unhydrated record first observed on `relay`
    pub fn observed(event: SignedEvent, key_id: &str, relay: &str) -> Self {
        let mut relays = BTreeSet::new();
        relays.insert(relay.to_string());
        Self {
            id: event.id.clone(),
            key_id: key_id.to_string(),
            created_at: event.created_at,
            relays,
            title: placeholder_title(&event.id),
            tags: Vec::new(),
            payload: None,
            hydration_error: None,
            event,
        }
    }

    /// Add a relay to the membership set. Returns `true` if it was new.
    pub fn observe_on(&mut self, relay: &str) -> bool {
        self.relays.insert(relay.to_string())
    }

    /// Whether the payload has been decrypted
    pub fn is_hydrated(&self) -> bool {
        self.payload.is_some()
    }

    /// Encryption scheme version of the inner content, once hydrated
    pub fn version(&self) -> Option<u8> {
        self.payload.as_ref().and_then(|p| p.version)
    }

    /// Decrypt the inner secret text
    pub fn reveal(&self, keys: &Keys, lenient: bool) -> SafeResult<String> {
        let payload = self.payload.as_ref().ok_or_else(|| {
            SafeError::DecryptionFailed(format!("secret {} has not been decrypted", self.id))
        })?;
        if lenient {
            payload.decode_secret_lenient(keys)
        } else {
            payload.decode_secret(keys)
        }
    }

    /// Attach a decrypted payload; flags an unusable version tag
    pub fn hydrate(&mut self, payload: SecretPayload, lenient: bool) {
        let scheme = if lenient {
            payload.scheme_lenient()
        } else {
            payload.scheme()
        };
        self.hydration_error = scheme.err().map(|e| e.to_string());
        self.title = payload.title.clone();
        self.tags = payload.tags.clone();
        self.payload = Some(payload);
    }
}
