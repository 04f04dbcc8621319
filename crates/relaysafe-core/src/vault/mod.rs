//! Encrypted-at-rest vault
//!
//! ```text
//!   VaultStore ── storage ──► vault.blob     (PIN mode, AES-GCM envelope)
//!                             vault.plain    (PIN disabled, JSON)
//!                             vault.checksum (security-relevant subset)
//!                             vault.legacy / vault.salt (migrated once)
//!                         ──► settings.mode / settings.pin_attempts
//! ```
//!
//! Exactly one representation is authoritative. If an interrupted mode
//! switch leaves both behind, the encrypted one wins unless the mode
//! setting says `plain`, and the loser is removed.
//!
//! Every load runs the self-healing pass in [`heal`]; repairs are persisted
//! immediately so the next load is clean.

pub mod cipher;
pub mod heal;
pub mod model;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use heal::HealReport;
pub use model::{AuditAction, AuditEntry, OwnerKey, Tombstone, VaultData, MAX_LOG_ENTRIES};

use crate::config::EngineConfig;
use crate::error::{SafeError, SafeResult};
use crate::storage::{
    Storage, StorageOp, StorageTable, SETTINGS_MODE, SETTINGS_PIN_ATTEMPTS, VAULT_BLOB,
    VAULT_CHECKSUM, VAULT_LEGACY, VAULT_PLAIN, VAULT_SALT, VAULT_UNREADABLE,
};

/// How the vault is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultMode {
    /// AES-GCM envelope keyed by the PIN
    Pin,
    /// Plain JSON
    Plain,
}

impl VaultMode {
    fn as_str(self) -> &'static str {
        match self {
            VaultMode::Pin => "pin",
            VaultMode::Plain => "plain",
        }
    }

    fn blob_key(self) -> &'static str {
        match self {
            VaultMode::Pin => VAULT_BLOB,
            VaultMode::Plain => VAULT_PLAIN,
        }
    }

    fn other(self) -> Self {
        match self {
            VaultMode::Pin => VaultMode::Plain,
            VaultMode::Plain => VaultMode::Pin,
        }
    }
}

impl std::fmt::Display for VaultMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful unlock
#[derive(Debug, Clone)]
pub struct UnlockedVault {
    /// Healed vault contents
    pub data: VaultData,
    /// Repairs applied while loading
    pub report: HealReport,
    /// Active mode
    pub mode: VaultMode,
}

/// Vault persistence, PIN handling and mode switching
#[derive(Debug, Clone)]
pub struct VaultStore {
    storage: Storage,
    iterations: u32,
    max_pin_attempts: u32,
}

impl VaultStore {
    /// Create a store over `storage`
    pub fn new(storage: Storage, config: &EngineConfig) -> Self {
        Self {
            storage,
            iterations: config.effective_pbkdf2_iterations(),
            max_pin_attempts: config.max_pin_attempts.max(1),
        }
    }

    fn get(&self, key: &str) -> SafeResult<Option<String>> {
        self.storage.get_string(StorageTable::Vault, key)
    }

    /// Whether any vault representation exists
    pub fn exists(&self) -> SafeResult<bool> {
        Ok(self.storage.contains(StorageTable::Vault, VAULT_BLOB)?
            || self.storage.contains(StorageTable::Vault, VAULT_PLAIN)?
            || self.storage.contains(StorageTable::Vault, VAULT_LEGACY)?)
    }

    /// Determine the authoritative representation, removing a stale one
    /// and correcting the mode setting. `None` if no current-format vault
    /// exists.
    pub fn mode(&self) -> SafeResult<Option<VaultMode>> {
        let has_pin = self.storage.contains(StorageTable::Vault, VAULT_BLOB)?;
        let has_plain = self.storage.contains(StorageTable::Vault, VAULT_PLAIN)?;
        let setting = self
            .storage
            .get_string(StorageTable::Settings, SETTINGS_MODE)?;

        let mode = match (has_pin, has_plain) {
            (false, false) => return Ok(None),
            (true, false) => VaultMode::Pin,
            (false, true) => VaultMode::Plain,
            (true, true) if setting.as_deref() == Some("plain") => VaultMode::Plain,
            (true, true) => VaultMode::Pin,
        };

        let mut ops = Vec::new();
        if has_pin && has_plain {
            warn!(%mode, "Both vault representations present, keeping one");
            ops.push(StorageOp::Remove(
                StorageTable::Vault,
                mode.other().blob_key().to_string(),
            ));
        }
        if setting.as_deref() != Some(mode.as_str()) {
            ops.push(StorageOp::Put(
                StorageTable::Settings,
                SETTINGS_MODE.to_string(),
                mode.as_str().as_bytes().to_vec(),
            ));
        }
        if !ops.is_empty() {
            self.storage.apply(&ops)?;
        }

        Ok(Some(mode))
    }

    /// Consecutive failed PIN attempts
    pub fn pin_attempts(&self) -> SafeResult<u32> {
        Ok(self
            .storage
            .get_string(StorageTable::Settings, SETTINGS_PIN_ATTEMPTS)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    /// Attempts left before the vault is wiped
    pub fn remaining_attempts(&self) -> SafeResult<u32> {
        Ok(self.max_pin_attempts.saturating_sub(self.pin_attempts()?))
    }

    fn set_pin_attempts(&self, attempts: u32) -> SafeResult<()> {
        self.storage.put(
            StorageTable::Settings,
            SETTINGS_PIN_ATTEMPTS,
            attempts.to_string().as_bytes(),
        )
    }

    /// Serialize `data` for `mode` into the storage ops that persist it
    fn write_ops(
        &self,
        mode: VaultMode,
        pin: Option<&str>,
        data: &VaultData,
    ) -> SafeResult<Vec<StorageOp>> {
        let json = Zeroizing::new(serde_json::to_vec(data)?);
        let blob = match mode {
            VaultMode::Pin => {
                let pin = pin.ok_or(SafeError::PinRequired)?;
                cipher::seal(&json, pin, self.iterations)?.into_bytes()
            }
            VaultMode::Plain => json.to_vec(),
        };

        Ok(vec![
            StorageOp::Put(StorageTable::Vault, mode.blob_key().to_string(), blob),
            StorageOp::Put(
                StorageTable::Vault,
                VAULT_CHECKSUM.to_string(),
                heal::checksum(data).into_bytes(),
            ),
        ])
    }

    /// Write a new vault. `pin = None` creates it PIN-disabled.
    pub fn create(&self, pin: Option<&str>, data: &VaultData) -> SafeResult<VaultMode> {
        if self.exists()? {
            return Err(SafeError::VaultExists);
        }
        let mode = if pin.is_some() {
            VaultMode::Pin
        } else {
            VaultMode::Plain
        };

        let mut ops = self.write_ops(mode, pin, data)?;
        ops.push(StorageOp::Put(
            StorageTable::Settings,
            SETTINGS_MODE.to_string(),
            mode.as_str().as_bytes().to_vec(),
        ));
        ops.push(StorageOp::Remove(
            StorageTable::Settings,
            SETTINGS_PIN_ATTEMPTS.to_string(),
        ));
        self.storage.apply(&ops)?;

        info!(%mode, "Vault created");
        Ok(mode)
    }

    /// Persist `data` in the current mode
    pub fn save(&self, pin: Option<&str>, data: &VaultData) -> SafeResult<()> {
        let mode = self.mode()?.ok_or(SafeError::VaultNotFound)?;
        let ops = self.write_ops(mode, pin, data)?;
        self.storage.apply(&ops)?;
        debug!(%mode, keys = data.keys.len(), "Vault saved");
        Ok(())
    }

    /// Load, authenticate and heal the vault.
    ///
    /// In PIN mode a wrong PIN costs one attempt; running out wipes the
    /// vault and returns [`SafeError::VaultWiped`].
    pub fn unlock(&self, pin: Option<&str>) -> SafeResult<UnlockedVault> {
        self.migrate_legacy(pin)?;

        let mode = self.mode()?.ok_or(SafeError::VaultNotFound)?;
        let blob = self.get(mode.blob_key())?.ok_or(SafeError::VaultNotFound)?;
        let stored_checksum = self.get(VAULT_CHECKSUM)?;

        let json = match mode {
            VaultMode::Plain => Zeroizing::new(blob.as_bytes().to_vec()),
            VaultMode::Pin => {
                let pin = pin.ok_or(SafeError::PinRequired)?;
                match cipher::open(&blob, pin) {
                    Ok(json) => {
                        if self.pin_attempts()? > 0 {
                            self.set_pin_attempts(0)?;
                        }
                        json
                    }
                    Err(SafeError::DecryptionFailed(_)) => return Err(self.record_failure()?),
                    Err(e) => return Err(e),
                }
            }
        };

        let (mut data, report) = heal::load(&json, stored_checksum.as_deref());
        if report.document_replaced {
            warn!(%mode, "Vault document unreadable, replaced with an empty vault");
        }
        if report.checksum_mismatch {
            warn!("Vault checksum mismatch, contents were modified outside the engine");
        }
        if !report.repairs.is_empty() {
            warn!(repairs = report.repairs.len(), "Vault healed on load");
            for repair in &report.repairs {
                debug!(%repair, "Vault repair");
            }
            data.push_log(
                AuditAction::VaultHealed,
                None,
                Some(report.repairs.join("; ")),
            );
        }
        if !report.is_clean() {
            let mut ops = self.write_ops(mode, pin, &data)?;
            if report.document_replaced {
                ops.push(StorageOp::Put(
                    StorageTable::Vault,
                    VAULT_UNREADABLE.to_string(),
                    blob.into_bytes(),
                ));
            }
            self.storage.apply(&ops)?;
        }

        info!(%mode, keys = data.keys.len(), "Vault unlocked");
        Ok(UnlockedVault { data, report, mode })
    }

    /// Count a failed PIN attempt; wipe at the ceiling
    fn record_failure(&self) -> SafeResult<SafeError> {
        let attempts = self.pin_attempts()? + 1;
        if attempts >= self.max_pin_attempts {
            warn!(attempts, "PIN attempt limit reached, wiping vault");
            self.delete()?;
            return Ok(SafeError::VaultWiped);
        }
        self.set_pin_attempts(attempts)?;
        let remaining_attempts = self.max_pin_attempts - attempts;
        warn!(remaining_attempts, "Incorrect PIN");
        Ok(SafeError::AuthenticationFailed { remaining_attempts })
    }

    fn switch_mode(&self, target: VaultMode, pin: Option<&str>, data: &VaultData) -> SafeResult<()> {
        if !self.exists()? {
            return Err(SafeError::VaultNotFound);
        }

        // New representation, then the setting, then drop the old one
        let mut ops = self.write_ops(target, pin, data)?;
        ops.push(StorageOp::Put(
            StorageTable::Settings,
            SETTINGS_MODE.to_string(),
            target.as_str().as_bytes().to_vec(),
        ));
        ops.push(StorageOp::Remove(
            StorageTable::Vault,
            target.other().blob_key().to_string(),
        ));
        self.storage.apply(&ops)?;

        info!(mode = %target, "Vault mode switched");
        Ok(())
    }

    /// Turn PIN protection off, re-persisting `data` as plain JSON
    pub fn disable(&self, data: &VaultData) -> SafeResult<()> {
        self.switch_mode(VaultMode::Plain, None, data)
    }

    /// Turn PIN protection on, re-persisting `data` encrypted under `pin`
    pub fn enable(&self, pin: &str, data: &VaultData) -> SafeResult<()> {
        self.switch_mode(VaultMode::Pin, Some(pin), data)?;
        self.set_pin_attempts(0)
    }

    /// Remove every vault key, the mode and attempt settings, and the
    /// offline queue (which references vault keys).
    pub fn delete(&self) -> SafeResult<()> {
        let mut ops: Vec<StorageOp> = self
            .storage
            .keys(StorageTable::Vault)?
            .into_iter()
            .map(|key| StorageOp::Remove(StorageTable::Vault, key))
            .collect();
        ops.extend(
            self.storage
                .keys(StorageTable::Queue)?
                .into_iter()
                .map(|key| StorageOp::Remove(StorageTable::Queue, key)),
        );
        ops.push(StorageOp::Remove(
            StorageTable::Settings,
            SETTINGS_MODE.to_string(),
        ));
        ops.push(StorageOp::Remove(
            StorageTable::Settings,
            SETTINGS_PIN_ATTEMPTS.to_string(),
        ));
        self.storage.apply(&ops)?;
        info!("Vault deleted");
        Ok(())
    }

    /// Convert a legacy single-key vault to the current layout, once.
    ///
    /// JSON-shaped legacy data becomes a plain vault; opaque ciphertext
    /// needs the PIN and becomes a PIN vault. Returns whether a migration
    /// happened.
    pub fn migrate_legacy(&self, pin: Option<&str>) -> SafeResult<bool> {
        let Some(legacy) = self.get(VAULT_LEGACY)? else {
            return Ok(false);
        };

        if self.mode()?.is_some() {
            // Already migrated; the legacy key is leftover
            self.storage.apply(&[
                StorageOp::Remove(StorageTable::Vault, VAULT_LEGACY.to_string()),
                StorageOp::Remove(StorageTable::Vault, VAULT_SALT.to_string()),
            ])?;
            return Ok(false);
        }

        let json_shaped = serde_json::from_str::<serde_json::Value>(&legacy)
            .map(|v| v.is_object())
            .unwrap_or(false);

        let (mode, json) = if json_shaped {
            (VaultMode::Plain, Zeroizing::new(legacy.into_bytes()))
        } else {
            let pin = pin.ok_or(SafeError::PinRequired)?;
            let salt = self
                .storage
                .get(StorageTable::Vault, VAULT_SALT)?
                .ok_or_else(|| SafeError::Storage("legacy vault salt missing".to_string()))?;
            match cipher::open_legacy(&legacy, &salt, pin) {
                Ok(json) => (VaultMode::Pin, json),
                Err(SafeError::DecryptionFailed(_)) => return Err(self.record_failure()?),
                Err(e) => return Err(e),
            }
        };

        let (data, _) = heal::load(&json, None);
        let mut ops = self.write_ops(mode, pin, &data)?;
        ops.push(StorageOp::Put(
            StorageTable::Settings,
            SETTINGS_MODE.to_string(),
            mode.as_str().as_bytes().to_vec(),
        ));
        ops.push(StorageOp::Remove(StorageTable::Vault, VAULT_LEGACY.to_string()));
        ops.push(StorageOp::Remove(StorageTable::Vault, VAULT_SALT.to_string()));
        self.storage.apply(&ops)?;

        info!(%mode, "Legacy vault migrated");
        Ok(true)
    }
}
