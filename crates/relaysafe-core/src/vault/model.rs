//! Vault contents: owner keys, audit log, tombstones, last-opened stamps

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{NPUB_HRP, NSEC_HRP};
use crate::error::{SafeError, SafeResult};
use crate::keys::{public_key_hex, Keys};

/// Audit log capacity (most recent first)
pub const MAX_LOG_ENTRIES: usize = 100;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// A keypair the user controls
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerKey {
    /// Ownership id
    pub id: String,
    /// Display name
    pub name: String,
    /// `npub1...`
    pub public_key: String,
    /// `nsec1...`
    pub private_key: String,
    /// Optional color tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Creation time (unix millis)
    pub created_at: i64,
    /// Mirrors [`VaultData::default_key_id`]
    #[serde(default)]
    pub is_default: bool,
}

impl std::fmt::Debug for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("color", &self.color)
            .field("created_at", &self.created_at)
            .field("is_default", &self.is_default)
            .finish()
    }
}

impl OwnerKey {
    fn from_keys(name: &str, keys: &Keys, color: Option<String>) -> SafeResult<Self> {
        Ok(Self {
            id: new_id(),
            name: name.to_string(),
            public_key: keys.npub()?,
            private_key: keys.nsec()?,
            color,
            created_at: now_millis(),
            is_default: false,
        })
    }

    /// Signing keys
    pub fn keys(&self) -> SafeResult<Keys> {
        Keys::parse(&self.private_key)
    }

    /// Hex x-only public key
    pub fn public_hex(&self) -> SafeResult<String> {
        public_key_hex(&self.public_key)
    }

    /// Fields present with the expected prefixes, and the private key
    /// actually derives the public key.
    pub fn is_well_formed(&self) -> bool {
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return false;
        }
        if !self.public_key.starts_with(&format!("{}1", NPUB_HRP))
            || !self.private_key.starts_with(&format!("{}1", NSEC_HRP))
        {
            return false;
        }
        match (self.keys(), self.public_hex()) {
            (Ok(keys), Ok(public)) => keys.public_hex() == public,
            _ => false,
        }
    }
}

/// Kinds of audited operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Vault created
    VaultCreated,
    /// Key generated
    KeyGenerated,
    /// Key imported
    KeyImported,
    /// Key renamed
    KeyRenamed,
    /// Key color changed
    KeyRecolored,
    /// Key removed
    KeyRemoved,
    /// Default key changed
    DefaultKeyChanged,
    /// Secret published
    SecretSaved,
    /// Secret queued for later publish
    SecretQueued,
    /// Secret deleted (tombstoned)
    SecretDeleted,
    /// Tombstone removed
    SecretRestored,
    /// Secret content decrypted for display
    SecretViewed,
    /// Secret replicated to missing relays
    SecretSynced,
    /// Structural repairs applied on load
    VaultHealed,
    /// PIN protection turned on
    PinEnabled,
    /// PIN protection turned off
    PinDisabled,
}

/// One audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id
    pub id: String,
    /// When (unix millis)
    pub timestamp: i64,
    /// What happened
    pub action: AuditAction,
    /// Key involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Free-form detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Soft-delete marker for a secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Deleted event id
    pub event_id: String,
    /// Key the secret belonged to
    pub key_id: String,
    /// When (unix millis)
    pub deleted_at: i64,
}

/// Decrypted vault contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultData {
    /// Owner keys, in creation order
    #[serde(default)]
    pub keys: Vec<OwnerKey>,
    /// Audit log, most recent first
    #[serde(default)]
    pub logs: Vec<AuditEntry>,
    /// Default key id
    #[serde(default)]
    pub default_key_id: Option<String>,
    /// Tombstones
    #[serde(default)]
    pub deleted_event_ids: Vec<Tombstone>,
    /// Event id → last successful decrypt (unix millis)
    #[serde(default)]
    pub last_opened: BTreeMap<String, i64>,
}

impl VaultData {
    /// Empty vault with a creation entry in the log
    pub fn new() -> Self {
        let mut data = Self::default();
        data.push_log(AuditAction::VaultCreated, None, None);
        data
    }

    /// Key by id
    pub fn key(&self, id: &str) -> Option<&OwnerKey> {
        self.keys.iter().find(|k| k.id == id)
    }

    /// Key by `npub` or hex public key
    pub fn key_by_public(&self, public: &str) -> Option<&OwnerKey> {
        let hex = public_key_hex(public).ok()?;
        self.keys
            .iter()
            .find(|k| k.public_hex().map(|p| p == hex).unwrap_or(false))
    }

    /// Current default key
    pub fn default_key(&self) -> Option<&OwnerKey> {
        self.default_key_id.as_deref().and_then(|id| self.key(id))
    }

    fn require_key(&self, id: &str) -> SafeResult<usize> {
        self.keys
            .iter()
            .position(|k| k.id == id)
            .ok_or_else(|| SafeError::KeyNotFound(id.to_string()))
    }

    fn add_key(
        &mut self,
        name: &str,
        keys: &Keys,
        color: Option<String>,
        action: AuditAction,
    ) -> SafeResult<OwnerKey> {
        let npub = keys.npub()?;
        if self.keys.iter().any(|k| k.public_key == npub) {
            return Err(SafeError::DuplicateKey(npub));
        }

        let key = OwnerKey::from_keys(name, keys, color)?;
        self.keys.push(key.clone());
        if self.default_key_id.is_none() {
            self.set_default_flags(&key.id);
        }
        self.push_log(action, Some(key.id.clone()), Some(name.to_string()));
        debug!(key_id = %key.id, "Owner key added");

        Ok(self.key(&key.id).cloned().unwrap_or(key))
    }

    /// Generate and store a fresh key. The first key becomes the default.
    pub fn generate_key(&mut self, name: &str, color: Option<String>) -> SafeResult<OwnerKey> {
        self.add_key(name, &Keys::generate(), color, AuditAction::KeyGenerated)
    }

    /// Import an `nsec` or hex secret key
    pub fn import_key(
        &mut self,
        name: &str,
        secret: &str,
        color: Option<String>,
    ) -> SafeResult<OwnerKey> {
        let keys = Keys::parse(secret)?;
        self.add_key(name, &keys, color, AuditAction::KeyImported)
    }

    /// Rename a key
    pub fn rename_key(&mut self, id: &str, name: &str) -> SafeResult<()> {
        if name.trim().is_empty() {
            return Err(SafeError::InvalidKey("key name cannot be empty".to_string()));
        }
        let idx = self.require_key(id)?;
        let old = std::mem::replace(&mut self.keys[idx].name, name.to_string());
        self.push_log(
            AuditAction::KeyRenamed,
            Some(id.to_string()),
            Some(format!("{} -> {}", old, name)),
        );
        Ok(())
    }

    /// Set or clear a key's color
    pub fn recolor_key(&mut self, id: &str, color: Option<String>) -> SafeResult<()> {
        let idx = self.require_key(id)?;
        self.keys[idx].color = color.clone();
        self.push_log(AuditAction::KeyRecolored, Some(id.to_string()), color);
        Ok(())
    }

    /// Remove a key together with its log entries and tombstones.
    ///
    /// Irreversible: secrets addressed to the key can no longer be read.
    pub fn remove_key(&mut self, id: &str) -> SafeResult<OwnerKey> {
        let idx = self.require_key(id)?;
        let removed = self.keys.remove(idx);

        self.logs.retain(|entry| entry.key_id.as_deref() != Some(id));
        self.deleted_event_ids.retain(|t| t.key_id != id);

        if self.default_key_id.as_deref() == Some(id) {
            match self.keys.first().map(|k| k.id.clone()) {
                Some(next) => self.set_default_flags(&next),
                None => self.default_key_id = None,
            }
        }

        self.push_log(AuditAction::KeyRemoved, None, Some(removed.name.clone()));
        debug!(key_id = %id, "Owner key removed");
        Ok(removed)
    }

    /// Mark a key as the default
    pub fn set_default_key(&mut self, id: &str) -> SafeResult<()> {
        self.require_key(id)?;
        self.set_default_flags(id);
        self.push_log(AuditAction::DefaultKeyChanged, Some(id.to_string()), None);
        Ok(())
    }

    pub(crate) fn set_default_flags(&mut self, id: &str) {
        for key in &mut self.keys {
            key.is_default = key.id == id;
        }
        self.default_key_id = Some(id.to_string());
    }

    /// Prepend an audit entry, dropping the oldest beyond capacity
    pub fn push_log(&mut self, action: AuditAction, key_id: Option<String>, details: Option<String>) {
        self.logs.insert(
            0,
            AuditEntry {
                id: new_id(),
                timestamp: now_millis(),
                action,
                key_id,
                details,
            },
        );
        self.logs.truncate(MAX_LOG_ENTRIES);
    }

    /// Tombstone a secret. Returns `false` if it already was.
    pub fn tombstone(&mut self, event_id: &str, key_id: &str) -> SafeResult<bool> {
        self.require_key(key_id)?;
        if self.is_tombstoned(event_id) {
            return Ok(false);
        }
        self.deleted_event_ids.push(Tombstone {
            event_id: event_id.to_string(),
            key_id: key_id.to_string(),
            deleted_at: now_millis(),
        });
        self.push_log(
            AuditAction::SecretDeleted,
            Some(key_id.to_string()),
            Some(event_id.to_string()),
        );
        Ok(true)
    }

    /// Remove a tombstone. Returns `false` if there was none.
    pub fn restore(&mut self, event_id: &str) -> bool {
        let Some(idx) = self
            .deleted_event_ids
            .iter()
            .position(|t| t.event_id == event_id)
        else {
            return false;
        };
        let tombstone = self.deleted_event_ids.remove(idx);
        self.push_log(
            AuditAction::SecretRestored,
            Some(tombstone.key_id),
            Some(event_id.to_string()),
        );
        true
    }

    /// Whether a secret is tombstoned
    pub fn is_tombstoned(&self, event_id: &str) -> bool {
        self.deleted_event_ids.iter().any(|t| t.event_id == event_id)
    }

    /// Record a successful decrypt
    pub fn mark_opened(&mut self, event_id: &str) {
        self.last_opened.insert(event_id.to_string(), now_millis());
    }

    /// Last successful decrypt of `event_id`
    pub fn last_opened(&self, event_id: &str) -> Option<i64> {
        self.last_opened.get(event_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_key_becomes_default() {
        let mut data = VaultData::new();
        let first = data.generate_key("Personal", None).unwrap();
        let second = data.generate_key("Work", Some("#ff0000".into())).unwrap();

        assert_eq!(data.default_key_id.as_deref(), Some(first.id.as_str()));
        assert!(data.key(&first.id).unwrap().is_default);
        assert!(!data.key(&second.id).unwrap().is_default);
        assert!(first.is_well_formed());
    }

    #[test]
    fn test_import_rejects_duplicate() {
        let mut data = VaultData::new();
        let keys = Keys::generate();
        let nsec = keys.nsec().unwrap();

        data.import_key("A", &nsec, None).unwrap();
        let result = data.import_key("B", &keys.secret_key().display_secret().to_string(), None);
        assert!(matches!(result, Err(SafeError::DuplicateKey(_))));
        assert_eq!(data.keys.len(), 1);
    }

    #[test]
    fn test_key_by_public_accepts_both_encodings() {
        let mut data = VaultData::new();
        let key = data.generate_key("A", None).unwrap();
        let hex = key.public_hex().unwrap();

        assert_eq!(data.key_by_public(&key.public_key).unwrap().id, key.id);
        assert_eq!(data.key_by_public(&hex).unwrap().id, key.id);
        assert!(data.key_by_public("garbage").is_none());
    }

    #[test]
    fn test_remove_key_cleans_references() {
        let mut data = VaultData::new();
        let a = data.generate_key("A", None).unwrap();
        let b = data.generate_key("B", None).unwrap();
        data.tombstone(&"aa".repeat(32), &a.id).unwrap();

        data.remove_key(&a.id).unwrap();

        assert_eq!(data.default_key_id.as_deref(), Some(b.id.as_str()));
        assert!(data.key(&b.id).unwrap().is_default);
        assert!(data.deleted_event_ids.is_empty());
        assert!(data
            .logs
            .iter()
            .all(|entry| entry.key_id.as_deref() != Some(a.id.as_str())));

        data.remove_key(&b.id).unwrap();
        assert_eq!(data.default_key_id, None);
        assert!(matches!(
            data.remove_key(&b.id),
            Err(SafeError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_log_ring_buffer() {
        let mut data = VaultData::default();
        for i in 0..(MAX_LOG_ENTRIES + 20) {
            data.push_log(AuditAction::SecretViewed, None, Some(i.to_string()));
        }
        assert_eq!(data.logs.len(), MAX_LOG_ENTRIES);
        let newest = (MAX_LOG_ENTRIES + 19).to_string();
        assert_eq!(data.logs[0].details.as_deref(), Some(newest.as_str()));
    }

    #[test]
    fn test_tombstone_and_restore() {
        let mut data = VaultData::new();
        let key = data.generate_key("A", None).unwrap();
        let id = "ab".repeat(32);

        assert!(data.tombstone(&id, &key.id).unwrap());
        assert!(!data.tombstone(&id, &key.id).unwrap());
        assert!(data.is_tombstoned(&id));

        assert!(data.restore(&id));
        assert!(!data.restore(&id));
        assert!(!data.is_tombstoned(&id));

        assert!(data.tombstone(&id, "missing").is_err());
    }

    #[test]
    fn test_rename_and_recolor() {
        let mut data = VaultData::new();
        let key = data.generate_key("A", None).unwrap();

        data.rename_key(&key.id, "Renamed").unwrap();
        data.recolor_key(&key.id, Some("blue".into())).unwrap();
        assert!(data.rename_key(&key.id, "  ").is_err());

        let stored = data.key(&key.id).unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.color.as_deref(), Some("blue"));
        assert_eq!(data.logs[0].action, AuditAction::KeyRecolored);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let mut data = VaultData::new();
        let key = data.generate_key("A", None).unwrap();
        let debug = format!("{:?}", key);
        assert!(!debug.contains(&key.private_key));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_mark_opened() {
        let mut data = VaultData::new();
        assert_eq!(data.last_opened("x"), None);
        data.mark_opened("x");
        assert!(data.last_opened("x").is_some());
    }
}
