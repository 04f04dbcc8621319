//! Structural validation and self-healing of vault contents
//!
//! Loading never fails because of dangling references or malformed
//! entries. Instead:
//!
//! 1. [`parse_lenient`] reads each collection element by element, dropping
//!    the ones that do not deserialize.
//! 2. [`heal`] enforces the cross-reference invariants (keys unique and well
//!    formed, logs and tombstones point at existing keys, default key
//!    resolves).
//! 3. [`checksum`] covers the security-relevant subset (no private keys) and
//!    is compared against the stored value to flag out-of-band tampering.
//!
//! A document that is not a JSON object at all heals to an empty vault and
//! sets [`HealReport::document_replaced`].
//!
//! Every repair is described in the [`HealReport`]. Healing a healed vault
//! changes nothing.

use std::collections::HashSet;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::model::{AuditEntry, OwnerKey, Tombstone, VaultData, MAX_LOG_ENTRIES};

/// What healing changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    /// Human-readable repair descriptions
    pub repairs: Vec<String>,
    /// Stored checksum did not match the loaded data
    pub checksum_mismatch: bool,
    /// The document was unreadable and was replaced by an empty vault
    pub document_replaced: bool,
}

impl HealReport {
    /// Nothing was repaired and the checksum matched
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty() && !self.checksum_mismatch && !self.document_replaced
    }
}

/// Hex SHA-256 over key ids/names/public keys, log count, default key and
/// tombstone ids.
pub fn checksum(data: &VaultData) -> String {
    let keys: Vec<Value> = data
        .keys
        .iter()
        .map(|k| json!([k.id, k.name, k.public_key]))
        .collect();
    let mut tombstones: Vec<&str> = data
        .deleted_event_ids
        .iter()
        .map(|t| t.event_id.as_str())
        .collect();
    tombstones.sort_unstable();

    let subset = json!({
        "keys": keys,
        "log_count": data.logs.len(),
        "default_key_id": data.default_key_id,
        "tombstones": tombstones,
    });
    hex::encode(Sha256::digest(subset.to_string().as_bytes()))
}

fn elements<T: serde::de::DeserializeOwned>(
    value: Option<&Value>,
    what: &str,
    repairs: &mut Vec<String>,
) -> Vec<T> {
    let Some(value) = value else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        repairs.push(format!("Replaced non-list {} with an empty list", what));
        return Vec::new();
    };

    let mut parsed = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match serde_json::from_value(item.clone()) {
            Ok(entry) => parsed.push(entry),
            Err(_) => repairs.push(format!("Dropped unreadable {} at index {}", what, idx)),
        }
    }
    parsed
}

/// Read vault JSON element by element, dropping entries that do not parse
pub fn parse_lenient(value: &Value) -> (VaultData, Vec<String>) {
    let mut repairs = Vec::new();

    let keys: Vec<OwnerKey> = elements(value.get("keys"), "key", &mut repairs);
    let logs: Vec<AuditEntry> = elements(value.get("logs"), "log entry", &mut repairs);
    let deleted_event_ids: Vec<Tombstone> =
        elements(value.get("deleted_event_ids"), "tombstone", &mut repairs);

    let default_key_id = match value.get("default_key_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(_) => {
            repairs.push("Cleared non-string default key reference".to_string());
            None
        }
    };

    let mut last_opened = std::collections::BTreeMap::new();
    if let Some(map) = value.get("last_opened").and_then(Value::as_object) {
        for (id, stamp) in map {
            match stamp.as_i64() {
                Some(stamp) => {
                    last_opened.insert(id.clone(), stamp);
                }
                None => repairs.push(format!("Dropped unreadable last-opened stamp for {}", id)),
            }
        }
    }

    (
        VaultData {
            keys,
            logs,
            default_key_id,
            deleted_event_ids,
            last_opened,
        },
        repairs,
    )
}

/// Enforce structural invariants in place; returns the repairs made
pub fn heal(data: &mut VaultData) -> Vec<String> {
    let mut repairs = Vec::new();

    // Keys: well formed, unique id, unique public key (first wins)
    let mut ids = HashSet::new();
    let mut publics = HashSet::new();
    let mut kept = Vec::with_capacity(data.keys.len());
    for key in data.keys.drain(..) {
        if !key.is_well_formed() {
            repairs.push(format!("Removed malformed key {:?}", key.id));
        } else if !ids.insert(key.id.clone()) {
            repairs.push(format!("Removed duplicate key {}", key.id));
        } else if !publics.insert(key.public_key.clone()) {
            repairs.push(format!(
                "Removed key {} duplicating public key {}",
                key.id, key.public_key
            ));
        } else {
            kept.push(key);
        }
    }
    data.keys = kept;

    // Logs: no orphans, bounded
    let before = data.logs.len();
    data.logs
        .retain(|entry| entry.key_id.as_ref().map_or(true, |id| ids.contains(id)));
    let orphaned = before - data.logs.len();
    if orphaned > 0 {
        repairs.push(format!("Removed {} orphaned log entries", orphaned));
    }
    if data.logs.len() > MAX_LOG_ENTRIES {
        repairs.push(format!(
            "Trimmed audit log from {} to {} entries",
            data.logs.len(),
            MAX_LOG_ENTRIES
        ));
        data.logs.truncate(MAX_LOG_ENTRIES);
    }

    // Default key resolves or is cleared
    if let Some(default) = data.default_key_id.clone() {
        if !ids.contains(&default) {
            let replacement = data.keys.first().map(|k| k.id.clone());
            repairs.push(match &replacement {
                Some(next) => format!("Default key {} missing, now {}", default, next),
                None => format!("Default key {} missing, cleared", default),
            });
            data.default_key_id = replacement;
        }
    }
    let flags_wrong = data
        .keys
        .iter()
        .any(|k| k.is_default != (data.default_key_id.as_deref() == Some(k.id.as_str())));
    if flags_wrong {
        repairs.push("Corrected default key flags".to_string());
        let default = data.default_key_id.clone();
        for key in &mut data.keys {
            key.is_default = default.as_deref() == Some(key.id.as_str());
        }
    }

    // Tombstones: non-empty, unique, owned by an existing key
    let mut seen = HashSet::new();
    let before = data.deleted_event_ids.len();
    data.deleted_event_ids.retain(|t| {
        !t.event_id.trim().is_empty() && ids.contains(&t.key_id) && seen.insert(t.event_id.clone())
    });
    let dropped = before - data.deleted_event_ids.len();
    if dropped > 0 {
        repairs.push(format!("Removed {} invalid or duplicate tombstones", dropped));
    }

    repairs
}

/// Parse raw vault JSON, heal it, and compare against the stored checksum.
pub fn load(bytes: &[u8], stored_checksum: Option<&str>) -> (VaultData, HealReport) {
    let mut repairs = Vec::new();
    let value = match serde_json::from_slice::<Value>(bytes) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            repairs.push("Replaced non-object vault document with an empty vault".to_string());
            None
        }
        Err(e) => {
            repairs.push(format!("Replaced unreadable vault document with an empty vault: {}", e));
            None
        }
    };
    let document_replaced = value.is_none();

    let mut data = match value {
        Some(value) => {
            let (data, parse_repairs) = parse_lenient(&value);
            repairs.extend(parse_repairs);
            data
        }
        None => VaultData::new(),
    };

    let checksum_mismatch = match stored_checksum {
        Some(stored) => stored != checksum(&data),
        None => false,
    };

    repairs.extend(heal(&mut data));

    (
        data,
        HealReport {
            repairs,
            checksum_mismatch,
            document_replaced,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::model::AuditAction;

    fn sample() -> VaultData {
        let mut data = VaultData::new();
        let a = data.generate_key("A", None).unwrap();
        data.generate_key("B", None).unwrap();
        data.tombstone(&"aa".repeat(32), &a.id).unwrap();
        data
    }

    #[test]
    fn test_clean_vault_needs_no_repairs() {
        let mut data = sample();
        assert!(heal(&mut data).is_empty());
    }

    #[test]
    fn test_checksum_ignores_private_keys() {
        let data = sample();
        let mut altered = data.clone();
        altered.keys[0].private_key = "nsec1different".into();
        assert_eq!(checksum(&data), checksum(&altered));

        altered.keys[0].name = "Changed".into();
        assert_ne!(checksum(&data), checksum(&altered));
    }

    #[test]
    fn test_checksum_ignores_tombstone_order() {
        let mut data = sample();
        let key = data.keys[0].id.clone();
        data.tombstone(&"bb".repeat(32), &key).unwrap();
        let mut reordered = data.clone();
        reordered.deleted_event_ids.reverse();
        assert_eq!(checksum(&data), checksum(&reordered));
    }

    #[test]
    fn test_heals_duplicates_orphans_and_dangling_default() {
        let mut data = sample();
        let first = data.keys[0].clone();

        // (a) two keys sharing an id
        let mut dup = data.keys[1].clone();
        dup.id = first.id.clone();
        data.keys.push(dup);
        // (b) log entry for a deleted key
        data.push_log(AuditAction::SecretSaved, Some("gone".into()), None);
        // (c) default pointing nowhere
        data.default_key_id = Some("missing".into());

        let repairs = heal(&mut data);
        assert!(!repairs.is_empty());

        assert_eq!(data.keys.iter().filter(|k| k.id == first.id).count(), 1);
        assert_eq!(data.keys[0].public_key, first.public_key);
        assert!(data
            .logs
            .iter()
            .all(|e| e.key_id.as_ref().map_or(true, |id| data.key(id).is_some())));
        let default = data.default_key_id.clone().unwrap();
        assert!(data.key(&default).is_some());

        // Idempotent
        let snapshot = data.clone();
        assert!(heal(&mut data).is_empty());
        assert_eq!(data, snapshot);
    }

    #[test]
    fn test_malformed_key_dropped() {
        let mut data = sample();
        data.keys[1].public_key = "npub1garbage".into();
        let repairs = heal(&mut data);
        assert_eq!(data.keys.len(), 1);
        assert!(repairs.iter().any(|r| r.contains("malformed")));
    }

    #[test]
    fn test_mismatched_keypair_dropped() {
        let mut data = sample();
        let other = data.keys[0].public_key.clone();
        data.keys[1].public_key = other;
        heal(&mut data);
        assert_eq!(data.keys.len(), 1);
    }

    #[test]
    fn test_default_cleared_when_no_keys() {
        let mut data = VaultData::new();
        data.default_key_id = Some("nobody".into());
        heal(&mut data);
        assert_eq!(data.default_key_id, None);
    }

    #[test]
    fn test_tombstones_deduplicated() {
        let mut data = sample();
        let copy = data.deleted_event_ids[0].clone();
        data.deleted_event_ids.push(copy);
        data.deleted_event_ids.push(Tombstone {
            event_id: "".into(),
            key_id: data.keys[0].id.clone(),
            deleted_at: 0,
        });
        heal(&mut data);
        assert_eq!(data.deleted_event_ids.len(), 1);
    }

    #[test]
    fn test_lenient_parse_drops_bad_elements() {
        let data = sample();
        let mut value = serde_json::to_value(&data).unwrap();
        value["keys"].as_array_mut().unwrap().push(json!({"id": 5}));
        value["logs"].as_array_mut().unwrap().push(json!("nonsense"));
        value["last_opened"] = json!({"x": 1, "y": "soon"});

        let (parsed, repairs) = parse_lenient(&value);
        assert_eq!(parsed.keys, data.keys);
        assert_eq!(parsed.logs, data.logs);
        assert_eq!(parsed.last_opened.get("x"), Some(&1));
        assert_eq!(repairs.len(), 3);
    }

    #[test]
    fn test_load_flags_checksum_mismatch() {
        let data = sample();
        let bytes = serde_json::to_vec(&data).unwrap();

        let (_, report) = load(&bytes, Some(&checksum(&data)));
        assert!(report.is_clean());

        let (_, report) = load(&bytes, Some("deadbeef"));
        assert!(report.checksum_mismatch);
    }

    #[test]
    fn test_unreadable_document_heals_to_empty_vault() {
        let documents: [&[u8]; 5] = [b"not json", b"[]", b"\"x\"", b"42", b"null"];
        for bytes in documents {
            let (data, report) = load(bytes, None);
            assert!(data.keys.is_empty());
            assert!(data.default_key_id.is_none());
            assert!(report.document_replaced);
            assert!(!report.is_clean());
            assert!(report.repairs[0].starts_with("Replaced"));
        }
    }

    #[test]
    fn test_object_document_is_not_replaced() {
        let (_, report) = load(b"{}", None);
        assert!(!report.document_replaced);
        assert!(report.is_clean());
    }
}
