//! SafeEngine - the entry point for RelaySafe
//!
//! SafeEngine coordinates the vault, the relay pool and the background
//! services:
//! - PIN-protected vault of owner keys, tombstones and audit log
//! - Secret aggregation across every configured relay
//! - Offline write queue for writes no relay acknowledged
//! - Replication repair (sync) that forwards original events verbatim
//!
//! # Example
//!
//! ```ignore
//! use relaysafe_core::SafeEngine;
//!
//! let engine = SafeEngine::open("~/.relaysafe")?;
//! engine.create_vault(Some("1234"))?;
//! let key = engine.generate_key("Personal", None)?;
//!
//! engine.save("Bank", "hunter2", vec![], Some(&key.id)).await?;
//! engine.refresh().await?;
//! for secret in engine.secrets() {
//!     println!("{} on {} relays", secret.title, secret.relays.len());
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::aggregator::{AggregateEvent, AggregateResult, OwnedKey, SecretAggregator, SecretSet};
use crate::config::{EngineConfig, RelayConfig};
use crate::crypto::EncryptionScheme;
use crate::error::{SafeError, SafeResult};
use crate::event::{deletion, encrypted_direct_message, SignedEvent};
use crate::events::{EngineEvent, EVENT_CHANNEL_CAPACITY};
use crate::pool::{PublishReport, RelayPool};
use crate::queue::{KeyResolver, OfflineQueue, ProcessReport, QueueSnapshot, QueuedWrite};
use crate::reconciler::{SyncReconciler, SyncReport, SyncStatus};
use crate::secret::{encrypt_outer, SecretPayload, SecretRecord};
use crate::storage::Storage;
use crate::task::PeriodicTask;
use crate::transport::websocket::WebSocketConnector;
use crate::transport::RelayConnector;
use crate::vault::{
    AuditAction, AuditEntry, HealReport, OwnerKey, Tombstone, VaultData, VaultMode, VaultStore,
};

/// Database file inside the data directory
pub const DATABASE_FILE: &str = "relaysafe.redb";

/// Reason attached to kind-5 deletion requests
const DELETION_REASON: &str = "deleted from vault";

/// What happened to a saved secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// At least one relay stored the event
    Published {
        /// Event id
        event_id: String,
        /// Relays that accepted it
        relays: Vec<String>,
    },
    /// No relay acknowledged; the write is in the offline queue
    Queued {
        /// Queue item id
        queue_id: String,
        /// Event id it will have
        event_id: String,
    },
}

impl SaveOutcome {
    /// Event id of the secret
    pub fn event_id(&self) -> &str {
        match self {
            SaveOutcome::Published { event_id, .. } | SaveOutcome::Queued { event_id, .. } => {
                event_id
            }
        }
    }

    /// A relay acknowledged the write
    pub fn is_published(&self) -> bool {
        matches!(self, SaveOutcome::Published { .. })
    }
}

/// In-memory view shared with background tasks
#[derive(Default)]
struct EngineState {
    /// Unlocked vault contents
    vault: Option<VaultData>,
    /// Active persistence mode
    mode: Option<VaultMode>,
    /// Last aggregated records (tombstoned ones included)
    secrets: Vec<SecretRecord>,
    /// Repairs applied by the last unlock
    heal_report: Option<HealReport>,
    is_loading: bool,
    is_connected: bool,
    error: Option<String>,
}

/// Main entry point for RelaySafe
pub struct SafeEngine {
    /// Data directory, if opened from disk
    data_dir: Option<PathBuf>,
    /// Persistent storage for vault, settings and queue
    storage: Storage,
    config: EngineConfig,
    vault_store: VaultStore,
    relays: RelayConfig,
    pool: RelayPool,
    aggregator: SecretAggregator,
    reconciler: SyncReconciler,
    queue: Arc<OfflineQueue>,
    state: Arc<RwLock<EngineState>>,
    /// PIN of the unlocked vault, needed to re-seal on every write
    pin: RwLock<Option<Zeroizing<String>>>,
    event_tx: broadcast::Sender<EngineEvent>,
    sync_task: Mutex<Option<PeriodicTask>>,
    queue_forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SafeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeEngine")
            .field("data_dir", &self.data_dir)
            .field("unlocked", &self.is_unlocked())
            .field("relays", &self.relays.urls())
            .finish_non_exhaustive()
    }
}

impl SafeEngine {
    /// Open the engine in `data_dir` with websocket relays
    ///
    /// # Errors
    ///
    /// Returns `SafeError::Io` if the directory cannot be created.
    /// Returns `SafeError::Database` if storage initialization fails.
    pub fn open(data_dir: impl AsRef<Path>) -> SafeResult<Self> {
        Self::open_with(data_dir, Arc::new(WebSocketConnector::new()))
    }

    /// Open the engine in `data_dir` with a custom relay connector
    pub fn open_with(
        data_dir: impl AsRef<Path>,
        connector: Arc<dyn RelayConnector>,
    ) -> SafeResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(?data_dir, "Initializing SafeEngine");
        std::fs::create_dir_all(&data_dir)?;

        let storage = Storage::new(data_dir.join(DATABASE_FILE))?;
        let config = EngineConfig::load(&storage)?;
        let mut engine = Self::with_config(storage, connector, config)?;
        engine.data_dir = Some(data_dir);
        Ok(engine)
    }

    /// Build over existing storage, loading the persisted configuration
    pub fn with_storage(storage: Storage, connector: Arc<dyn RelayConnector>) -> SafeResult<Self> {
        let config = EngineConfig::load(&storage)?;
        Self::with_config(storage, connector, config)
    }

    /// Build over existing storage with an explicit configuration
    pub fn with_config(
        storage: Storage,
        connector: Arc<dyn RelayConnector>,
        config: EngineConfig,
    ) -> SafeResult<Self> {
        let relays = RelayConfig::load(&storage)?;
        let pool = RelayPool::new(connector, &config);
        let aggregator = SecretAggregator::new(pool.clone(), relays.clone(), &config);
        let reconciler = SyncReconciler::new(pool.clone(), relays.clone());
        let queue = Arc::new(OfflineQueue::init(storage.clone(), &config)?);
        let vault_store = VaultStore::new(storage.clone(), &config);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        debug!(relays = relays.len(), queued = queue.len(), "Engine components ready");

        Ok(Self {
            data_dir: None,
            storage,
            config,
            vault_store,
            relays,
            pool,
            aggregator,
            reconciler,
            queue,
            state: Arc::new(RwLock::new(EngineState::default())),
            pin: RwLock::new(None),
            event_tx,
            sync_task: Mutex::new(None),
            queue_forwarder: Mutex::new(None),
        })
    }

    /// Data directory, if opened from disk
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Storage layer
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vault Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether a vault exists in storage
    pub fn vault_exists(&self) -> SafeResult<bool> {
        self.vault_store.exists()
    }

    /// Persistence mode of the stored vault
    pub fn vault_mode(&self) -> SafeResult<Option<VaultMode>> {
        self.vault_store.mode()
    }

    /// PIN attempts left before the vault is wiped
    pub fn remaining_pin_attempts(&self) -> SafeResult<u32> {
        self.vault_store.remaining_attempts()
    }

    /// Create an empty vault and unlock it. `None` creates it without a PIN.
    pub fn create_vault(&self, pin: Option<&str>) -> SafeResult<()> {
        if pin.is_some_and(|p| p.is_empty()) {
            return Err(SafeError::PinRequired);
        }
        let data = VaultData::new();
        let mode = self.vault_store.create(pin, &data)?;
        self.install(data, mode, pin, HealReport::default());
        Ok(())
    }

    /// Load and authenticate the vault.
    ///
    /// A wrong PIN costs an attempt; the last attempt wipes the vault and
    /// returns [`SafeError::VaultWiped`].
    pub fn unlock(&self, pin: Option<&str>) -> SafeResult<HealReport> {
        match self.vault_store.unlock(pin) {
            Ok(unlocked) => {
                let report = unlocked.report.clone();
                self.install(unlocked.data, unlocked.mode, pin, unlocked.report);
                Ok(report)
            }
            Err(e) => {
                if matches!(e, SafeError::VaultWiped) {
                    self.queue.clear()?;
                    self.reset();
                }
                self.state.write().error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn install(&self, data: VaultData, mode: VaultMode, pin: Option<&str>, report: HealReport) {
        let key_count = data.keys.len();
        let repairs = report.repairs.len();
        {
            let mut state = self.state.write();
            state.vault = Some(data);
            state.mode = Some(mode);
            state.heal_report = Some(report);
            state.error = None;
        }
        *self.pin.write() = match mode {
            VaultMode::Pin => pin.map(|p| Zeroizing::new(p.to_string())),
            VaultMode::Plain => None,
        };
        info!(%mode, key_count, "Vault ready");
        self.emit(EngineEvent::VaultUnlocked { key_count, repairs });
    }

    fn reset(&self) {
        *self.state.write() = EngineState::default();
        *self.pin.write() = None;
    }

    /// Forget the unlocked vault and every decrypted record
    pub fn lock(&self) {
        self.reset();
        info!("Vault locked");
        self.emit(EngineEvent::VaultLocked);
    }

    /// Whether the vault is unlocked
    pub fn is_unlocked(&self) -> bool {
        self.state.read().vault.is_some()
    }

    /// Mode of the unlocked vault
    pub fn mode(&self) -> Option<VaultMode> {
        self.state.read().mode
    }

    /// Repairs applied by the last unlock
    pub fn heal_report(&self) -> Option<HealReport> {
        self.state.read().heal_report.clone()
    }

    /// Turn PIN protection on, or change the PIN if it is already on
    pub fn enable_pin(&self, pin: &str) -> SafeResult<()> {
        if pin.is_empty() {
            return Err(SafeError::PinRequired);
        }
        let mut data = self.vault_snapshot()?;
        data.push_log(AuditAction::PinEnabled, None, None);
        self.vault_store.enable(pin, &data)?;
        {
            let mut state = self.state.write();
            state.vault = Some(data);
            state.mode = Some(VaultMode::Pin);
        }
        *self.pin.write() = Some(Zeroizing::new(pin.to_string()));
        info!("PIN protection enabled");
        Ok(())
    }

    /// Turn PIN protection off
    pub fn disable_pin(&self) -> SafeResult<()> {
        let mut data = self.vault_snapshot()?;
        data.push_log(AuditAction::PinDisabled, None, None);
        self.vault_store.disable(&data)?;
        {
            let mut state = self.state.write();
            state.vault = Some(data);
            state.mode = Some(VaultMode::Plain);
        }
        *self.pin.write() = None;
        info!("PIN protection disabled");
        Ok(())
    }

    /// Erase the vault, its settings and the offline queue
    pub fn delete_vault(&self) -> SafeResult<()> {
        self.vault_store.delete()?;
        self.queue.clear()?;
        self.reset();
        warn!("Vault deleted");
        self.emit(EngineEvent::VaultLocked);
        Ok(())
    }

    fn vault_snapshot(&self) -> SafeResult<VaultData> {
        self.state.read().vault.clone().ok_or(SafeError::VaultLocked)
    }

    /// Apply `f` to a copy of the vault, persist it, then publish it
    fn mutate_vault<T>(&self, f: impl FnOnce(&mut VaultData) -> SafeResult<T>) -> SafeResult<T> {
        let mut data = self.vault_snapshot()?;
        let value = f(&mut data)?;
        let pin = self.pin.read().clone();
        self.vault_store
            .save(pin.as_deref().map(String::as_str), &data)?;
        self.state.write().vault = Some(data);
        Ok(value)
    }

    /// Recent audit entries, newest first
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.state
            .read()
            .vault
            .as_ref()
            .map(|v| v.logs.clone())
            .unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Owner Keys
    // ═══════════════════════════════════════════════════════════════════════

    /// Keys in the unlocked vault
    pub fn keys(&self) -> Vec<OwnerKey> {
        self.state
            .read()
            .vault
            .as_ref()
            .map(|v| v.keys.clone())
            .unwrap_or_default()
    }

    /// Default key, if any
    pub fn default_key(&self) -> Option<OwnerKey> {
        self.state
            .read()
            .vault
            .as_ref()
            .and_then(|v| v.default_key().cloned())
    }

    /// Resolve a key by id or public key, or the default key for `None`
    pub fn resolve_key(&self, key: Option<&str>) -> SafeResult<OwnerKey> {
        let state = self.state.read();
        let vault = state.vault.as_ref().ok_or(SafeError::VaultLocked)?;
        match key {
            Some(key) => vault
                .key(key)
                .or_else(|| vault.key_by_public(key))
                .cloned()
                .ok_or_else(|| SafeError::KeyNotFound(key.to_string())),
            None => vault
                .default_key()
                .cloned()
                .ok_or_else(|| SafeError::KeyNotFound("no default key".to_string())),
        }
    }

    /// Generate a new owner key
    pub fn generate_key(&self, name: &str, color: Option<String>) -> SafeResult<OwnerKey> {
        let key = self.mutate_vault(|data| data.generate_key(name, color))?;
        info!(key_id = %key.id, "Key generated");
        Ok(key)
    }

    /// Import an `nsec` or hex secret key
    pub fn import_key(
        &self,
        name: &str,
        secret: &str,
        color: Option<String>,
    ) -> SafeResult<OwnerKey> {
        let key = self.mutate_vault(|data| data.import_key(name, secret, color))?;
        info!(key_id = %key.id, "Key imported");
        Ok(key)
    }

    /// Rename a key
    pub fn rename_key(&self, id: &str, name: &str) -> SafeResult<()> {
        self.mutate_vault(|data| data.rename_key(id, name))
    }

    /// Set or clear a key's color
    pub fn recolor_key(&self, id: &str, color: Option<String>) -> SafeResult<()> {
        self.mutate_vault(|data| data.recolor_key(id, color))
    }

    /// Make a key the default for new secrets
    pub fn set_default_key(&self, id: &str) -> SafeResult<()> {
        self.mutate_vault(|data| data.set_default_key(id))
    }

    /// Remove a key; its secrets disappear from the view
    pub fn remove_key(&self, id: &str) -> SafeResult<OwnerKey> {
        let removed = self.mutate_vault(|data| data.remove_key(id))?;
        self.state.write().secrets.retain(|r| r.key_id != id);
        info!(key_id = %id, "Key removed");
        Ok(removed)
    }

    fn owned_keys(&self) -> SafeResult<Vec<OwnedKey>> {
        let state = self.state.read();
        let vault = state.vault.as_ref().ok_or(SafeError::VaultLocked)?;
        Ok(vault
            .keys
            .iter()
            .filter_map(|key| match OwnedKey::from_owner(key) {
                Ok(owned) => Some(owned),
                Err(e) => {
                    warn!(key_id = %key.id, error = %e, "Unusable key skipped");
                    None
                }
            })
            .collect())
    }

    /// Signing-key lookup over the live vault, for the offline queue
    fn resolver(&self) -> KeyResolver {
        let state = Arc::clone(&self.state);
        Arc::new(move |public: &str| {
            let state = state.read();
            let vault = state.vault.as_ref()?;
            vault.key_by_public(public)?.keys().ok()
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Relays
    // ═══════════════════════════════════════════════════════════════════════

    /// Configured relays
    pub fn relays(&self) -> Vec<String> {
        self.relays.urls()
    }

    /// Add and persist a relay. Returns `false` if it was already present.
    pub fn add_relay(&self, url: &str) -> SafeResult<bool> {
        let added = self.relays.add(url)?;
        if added {
            self.relays.save(&self.storage)?;
            info!(relay = %url, "Relay added");
        }
        Ok(added)
    }

    /// Remove and persist a relay. Returns `false` if it was not present.
    pub fn remove_relay(&self, url: &str) -> SafeResult<bool> {
        let removed = self.relays.remove(url);
        if removed {
            self.relays.save(&self.storage)?;
            info!(relay = %url, "Relay removed");
        }
        Ok(removed)
    }

    async fn publish(&self, event: &SignedEvent) -> PublishReport {
        let urls = self.relays.urls();
        if urls.is_empty() {
            return PublishReport::default();
        }
        self.pool.publish_all(&urls, event).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Secrets
    // ═══════════════════════════════════════════════════════════════════════

    /// Visible secrets (tombstoned ones hidden), newest first
    pub fn secrets(&self) -> Vec<SecretRecord> {
        let state = self.state.read();
        let Some(vault) = state.vault.as_ref() else {
            return Vec::new();
        };
        state
            .secrets
            .iter()
            .filter(|r| !vault.is_tombstoned(&r.id))
            .cloned()
            .collect()
    }

    /// Tombstoned secrets still served by some relay
    pub fn deleted_secrets(&self) -> Vec<SecretRecord> {
        let state = self.state.read();
        let Some(vault) = state.vault.as_ref() else {
            return Vec::new();
        };
        state
            .secrets
            .iter()
            .filter(|r| vault.is_tombstoned(&r.id))
            .cloned()
            .collect()
    }

    /// Local tombstones
    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.state
            .read()
            .vault
            .as_ref()
            .map(|v| v.deleted_event_ids.clone())
            .unwrap_or_default()
    }

    /// One record by id, tombstoned or not
    pub fn secret(&self, id: &str) -> Option<SecretRecord> {
        self.state
            .read()
            .secrets
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Last successful reveal of a secret (unix ms)
    pub fn last_opened(&self, id: &str) -> Option<i64> {
        self.state
            .read()
            .vault
            .as_ref()
            .and_then(|v| v.last_opened(id))
    }

    /// A refresh is in flight
    pub fn is_loading(&self) -> bool {
        self.state.read().is_loading
    }

    /// The last refresh reached at least one relay
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Last non-fatal error
    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    fn upsert_record(&self, record: SecretRecord) {
        let mut state = self.state.write();
        let mut set: SecretSet = std::mem::take(&mut state.secrets).into_iter().collect();
        set.merge(std::iter::once(record).collect());
        state.secrets = set.into_records();
    }

    fn apply_progress(&self, event: AggregateEvent) {
        let AggregateEvent::RelayCompleted {
            relay,
            status,
            snapshot,
        } = event
        else {
            return;
        };
        let seen = snapshot.len();
        {
            let mut state = self.state.write();
            let mut set: SecretSet = std::mem::take(&mut state.secrets).into_iter().collect();
            set.merge(snapshot.into_iter().collect());
            state.secrets = set.into_records();
        }
        self.emit(EngineEvent::RelayCompleted {
            relay,
            status,
            seen,
        });
    }

    /// Re-fetch every secret from all relays.
    ///
    /// Partial results are merged into the view as relays answer.
    pub async fn refresh(&self) -> SafeResult<AggregateResult> {
        let owned = self.owned_keys()?;
        self.state.write().is_loading = true;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = self.aggregator.clone();
        let fetch = async move {
            let result = aggregator.fetch(&owned, Some(&tx)).await;
            drop(tx);
            result
        };
        let progress = async {
            while let Some(event) = rx.recv().await {
                self.apply_progress(event);
            }
        };
        let (result, ()) = tokio::join!(fetch, progress);

        {
            let mut state = self.state.write();
            state.is_loading = false;
            match &result {
                Ok(aggregate) => {
                    state.secrets = aggregate.secrets.clone();
                    if !aggregate.responded.is_empty() {
                        state.is_connected = true;
                    }
                    state.error = None;
                }
                Err(e) => {
                    state.error = Some(e.to_string());
                    if matches!(e, SafeError::AllRelaysFailed(_)) {
                        state.is_connected = false;
                    }
                }
            }
        }

        match &result {
            Ok(aggregate) => {
                if !aggregate.responded.is_empty() {
                    self.queue.set_connectivity(true);
                }
                self.emit(EngineEvent::SecretsUpdated {
                    count: self.secrets().len(),
                });
            }
            Err(e) => {
                if matches!(e, SafeError::AllRelaysFailed(_)) {
                    self.queue.set_connectivity(false);
                }
                warn!(error = %e, "Refresh failed");
                self.emit(EngineEvent::Error(e.to_string()));
            }
        }
        result
    }

    /// Encrypt and publish a new secret; queue it if no relay acknowledges.
    ///
    /// `key` is a key id or public key; `None` uses the default key.
    pub async fn save(
        &self,
        title: &str,
        content: &str,
        tags: Vec<String>,
        key: Option<&str>,
    ) -> SafeResult<SaveOutcome> {
        let owner = self.resolve_key(key)?;
        let keys = owner.keys()?;
        let scheme = EncryptionScheme::default();

        let payload = SecretPayload::seal(&keys, title, content, tags, scheme)?;
        let outer = encrypt_outer(&keys, &payload, scheme)?;
        let event = encrypted_direct_message(&keys, &keys.public_key(), outer)?;
        let report = self.publish(&event).await;

        if report.any_accepted() {
            let mut record = SecretRecord::observed(event.clone(), &owner.id, &report.accepted[0]);
            for relay in &report.accepted[1..] {
                record.observe_on(relay);
            }
            record.hydrate(payload, self.config.lenient_version_detection);
            self.upsert_record(record);

            self.mutate_vault(|data| {
                data.push_log(
                    AuditAction::SecretSaved,
                    Some(owner.id.clone()),
                    Some(event.id.clone()),
                );
                Ok(())
            })?;
            info!(event_id = %event.id, relays = report.accepted.len(), "Secret saved");
            self.emit(EngineEvent::SecretSaved {
                event_id: event.id.clone(),
                relays: report.accepted.clone(),
            });
            self.emit(EngineEvent::SecretsUpdated {
                count: self.secrets().len(),
            });
            return Ok(SaveOutcome::Published {
                event_id: event.id,
                relays: report.accepted,
            });
        }

        let item = self.queue.enqueue(&event)?;
        self.mutate_vault(|data| {
            data.push_log(
                AuditAction::SecretQueued,
                Some(owner.id.clone()),
                Some(event.id.clone()),
            );
            Ok(())
        })?;
        warn!(event_id = %event.id, queue_id = %item.id, "No relay accepted secret, queued");
        self.emit(EngineEvent::SecretQueued {
            queue_id: item.id.clone(),
            event_id: event.id.clone(),
        });
        self.emit(EngineEvent::QueueChanged(self.queue.snapshot()));
        Ok(SaveOutcome::Queued {
            queue_id: item.id,
            event_id: event.id,
        })
    }

    /// Tombstone a secret and ask relays to delete it.
    ///
    /// The tombstone is kept whatever the relays answer. Returns whether a
    /// relay acknowledged the deletion request; if none did, the request is
    /// queued.
    ///
    /// `key` is needed only for records not loaded locally. For a loaded
    /// record it must be the record's author.
    pub async fn delete_secret(&self, id: &str, key: Option<&str>) -> SafeResult<bool> {
        let author = self
            .secret(id)
            .map(|record| self.resolve_key(Some(&record.key_id)))
            .transpose()?;
        let owner = match (key, author) {
            (Some(key), Some(author)) => {
                let owner = self.resolve_key(Some(key))?;
                if owner.id != author.id {
                    return Err(SafeError::InvalidKey(format!(
                        "secret {} was not written by key {}",
                        id, owner.id
                    )));
                }
                owner
            }
            (Some(key), None) => self.resolve_key(Some(key))?,
            (None, Some(author)) => author,
            (None, None) => return Err(SafeError::SecretNotFound(id.to_string())),
        };

        self.mutate_vault(|data| data.tombstone(id, &owner.id))?;

        let request = deletion(&owner.keys()?, &[id.to_string()], DELETION_REASON)?;
        let report = self.publish(&request).await;
        let acknowledged = report.any_accepted();
        if !acknowledged {
            let item = self.queue.enqueue(&request)?;
            debug!(event_id = %id, queue_id = %item.id, "Deletion request queued");
            self.emit(EngineEvent::QueueChanged(self.queue.snapshot()));
        }

        info!(event_id = %id, acknowledged, "Secret deleted");
        self.emit(EngineEvent::SecretDeleted {
            event_id: id.to_string(),
            relay_acknowledged: acknowledged,
        });
        self.emit(EngineEvent::SecretsUpdated {
            count: self.secrets().len(),
        });
        Ok(acknowledged)
    }

    /// Lift a tombstone. Relays that honoured the deletion request will not
    /// serve the record again.
    pub fn restore_secret(&self, id: &str) -> SafeResult<bool> {
        let restored = self.mutate_vault(|data| Ok(data.restore(id)))?;
        if restored {
            self.emit(EngineEvent::SecretsUpdated {
                count: self.secrets().len(),
            });
        }
        Ok(restored)
    }

    /// Decrypt a secret's content and record the access
    pub fn reveal(&self, id: &str) -> SafeResult<Zeroizing<String>> {
        let record = self
            .secret(id)
            .ok_or_else(|| SafeError::SecretNotFound(id.to_string()))?;
        let owner = self.resolve_key(Some(&record.key_id))?;
        let text = record.reveal(&owner.keys()?, self.config.lenient_version_detection)?;

        self.mutate_vault(|data| {
            data.mark_opened(id);
            data.push_log(
                AuditAction::SecretViewed,
                Some(owner.id.clone()),
                Some(id.to_string()),
            );
            Ok(())
        })?;
        Ok(Zeroizing::new(text))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Replication state of one secret
    pub fn sync_status(&self, id: &str) -> Option<SyncStatus> {
        self.secret(id).map(|record| self.reconciler.status(&record))
    }

    /// Visible secrets missing from at least one configured relay
    pub fn under_replicated(&self) -> Vec<(SecretRecord, SyncStatus)> {
        self.secrets()
            .into_iter()
            .map(|record| {
                let status = self.reconciler.status(&record);
                (record, status)
            })
            .filter(|(_, status)| status.needs_sync())
            .collect()
    }

    fn apply_sync_reports(&self, reports: &[SyncReport]) -> SafeResult<()> {
        {
            let mut state = self.state.write();
            for report in reports {
                if let Some(record) = state.secrets.iter_mut().find(|r| r.id == report.event_id) {
                    record.relays.extend(report.succeeded.iter().cloned());
                }
            }
        }

        let repaired: Vec<&SyncReport> =
            reports.iter().filter(|r| !r.succeeded.is_empty()).collect();
        if !repaired.is_empty() && self.is_unlocked() {
            let owners: Vec<(String, Option<String>)> = repaired
                .iter()
                .map(|r| (r.event_id.clone(), self.secret(&r.event_id).map(|s| s.key_id)))
                .collect();
            self.mutate_vault(|data| {
                for ((event_id, key_id), report) in owners.into_iter().zip(&repaired) {
                    data.push_log(
                        AuditAction::SecretSynced,
                        key_id,
                        Some(format!("{} to {} relays", event_id, report.succeeded.len())),
                    );
                }
                Ok(())
            })?;
        }

        self.emit(EngineEvent::SyncCompleted {
            repaired: reports
                .iter()
                .filter(|r| r.is_complete() && !r.succeeded.is_empty())
                .count(),
            failed: reports.iter().filter(|r| !r.is_complete()).count(),
        });
        Ok(())
    }

    /// Repair every under-replicated visible secret.
    ///
    /// Fails with [`SafeError::SyncInProgress`] if a pass is running.
    pub async fn sync_all(&self) -> SafeResult<Vec<SyncReport>> {
        let records = self.secrets();
        let tx = self.event_tx.clone();
        let reports = self
            .reconciler
            .sync_all(&records, |progress| {
                let _ = tx.send(EngineEvent::SyncProgress {
                    index: progress.index,
                    total: progress.total,
                    event_id: progress.event_id,
                });
            })
            .await?;
        self.apply_sync_reports(&reports)?;
        Ok(reports)
    }

    /// Repair one secret
    pub async fn sync_one(&self, id: &str) -> SafeResult<SyncReport> {
        let record = self
            .secret(id)
            .ok_or_else(|| SafeError::SecretNotFound(id.to_string()))?;
        let report = self.reconciler.sync_one(&record).await;
        self.apply_sync_reports(std::slice::from_ref(&report))?;
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Offline Queue
    // ═══════════════════════════════════════════════════════════════════════

    /// Queued writes, oldest first
    pub fn queue_items(&self) -> Vec<QueuedWrite> {
        self.queue.items()
    }

    /// Queue size
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// Reset an exhausted queue item
    pub fn retry_queued(&self, id: &str) -> SafeResult<bool> {
        self.queue.retry_exhausted(id)
    }

    /// Drop a queue item
    pub fn remove_queued(&self, id: &str) -> SafeResult<bool> {
        self.queue.remove(id)
    }

    /// Run one retry pass now. `force` ignores backoff waits.
    pub async fn process_queue(&self, force: bool) -> ProcessReport {
        let report = self
            .queue
            .process(&self.resolver(), &self.pool, &self.relays, force)
            .await;
        self.emit(EngineEvent::QueueChanged(self.queue.snapshot()));
        report
    }

    /// Record connectivity. Regaining it runs a forced retry pass, on the
    /// background task if one is running, inline otherwise.
    pub async fn set_connectivity(&self, online: bool) -> Option<ProcessReport> {
        self.state.write().is_connected = online;
        let came_back = self.queue.set_connectivity(online);
        if came_back && !self.queue.is_spawned() {
            return Some(self.process_queue(true).await);
        }
        None
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Background Tasks
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the queue retry loop and the periodic refresh-and-sync pass
    pub fn start_background(self: &Arc<Self>) {
        self.queue
            .spawn(self.resolver(), self.pool.clone(), self.relays.clone());

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("relay-sync", self.config.sync_interval(), move || {
            let weak = weak.clone();
            async move {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                if !engine.is_unlocked() {
                    return;
                }
                if let Err(e) = engine.refresh().await {
                    debug!(error = %e, "Background refresh failed");
                    return;
                }
                match engine.sync_all().await {
                    Ok(reports) => debug!(records = reports.len(), "Background sync finished"),
                    Err(SafeError::SyncInProgress) => debug!("Sync already running"),
                    Err(e) => warn!(error = %e, "Background sync failed"),
                }
            }
        });
        if let Some(previous) = self.sync_task.lock().replace(task) {
            previous.cancel();
        }

        let mut queue_rx = self.queue.subscribe();
        let tx = self.event_tx.clone();
        let forwarder = tokio::spawn(async move {
            while queue_rx.changed().await.is_ok() {
                let snapshot = *queue_rx.borrow_and_update();
                let _ = tx.send(EngineEvent::QueueChanged(snapshot));
            }
        });
        if let Some(previous) = self.queue_forwarder.lock().replace(forwarder) {
            previous.abort();
        }
        info!("Background tasks started");
    }

    /// Pause or resume the periodic sync pass (app visibility)
    pub fn set_visible(&self, visible: bool) {
        if let Some(task) = self.sync_task.lock().as_ref() {
            if visible {
                task.resume();
            } else {
                task.pause();
            }
        }
    }

    /// Stop background work and close relay connections
    pub async fn shutdown(&self) {
        let sync_task = self.sync_task.lock().take();
        if let Some(task) = sync_task {
            task.shutdown().await;
        }
        self.queue.shutdown().await;
        let forwarder = self.queue_forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        self.pool.cancel_all();
        self.pool.disconnect_all().await;
        info!("SafeEngine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Kind;
    use crate::transport::memory::MemoryNetwork;

    const A: &str = "wss://a.test";
    const B: &str = "wss://b.test";

    fn config() -> EngineConfig {
        EngineConfig {
            fetch_timeout_secs: 1,
            publish_timeout_secs: 1,
            pbkdf2_iterations: 1,
            max_pin_attempts: 3,
            ..Default::default()
        }
    }

    fn engine_over(network: &MemoryNetwork, storage: Storage) -> SafeEngine {
        let relays = RelayConfig::new([A, B]).unwrap();
        relays.save(&storage).unwrap();
        SafeEngine::with_config(storage, Arc::new(network.clone()), config()).unwrap()
    }

    fn setup() -> (MemoryNetwork, SafeEngine) {
        let network = MemoryNetwork::new();
        network.add_relay(A);
        network.add_relay(B);
        let engine = engine_over(&network, Storage::in_memory().unwrap());
        (network, engine)
    }

    #[tokio::test]
    async fn test_save_then_refresh_and_reveal() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        let key = engine.generate_key("Personal", None).unwrap();

        let outcome = engine
            .save("Bank", "hunter2", vec!["finance".into()], None)
            .await
            .unwrap();
        assert!(outcome.is_published());
        assert!(network.relay(A).unwrap().has_event(outcome.event_id()));

        let result = engine.refresh().await.unwrap();
        assert_eq!(result.secrets.len(), 1);
        let secret = &engine.secrets()[0];
        assert_eq!(secret.title, "Bank");
        assert_eq!(secret.key_id, key.id);
        assert_eq!(secret.relays.len(), 2);
        assert!(engine.is_connected());

        let text = engine.reveal(&secret.id).unwrap();
        assert_eq!(text.as_str(), "hunter2");
        assert!(engine.last_opened(&secret.id).is_some());
        assert_eq!(engine.audit_log()[0].action, AuditAction::SecretViewed);
    }

    #[tokio::test]
    async fn test_save_offline_queues() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        engine.generate_key("K", None).unwrap();
        network.set_all_online(false);

        let outcome = engine.save("t", "v", vec![], None).await.unwrap();
        let SaveOutcome::Queued { event_id, .. } = &outcome else {
            panic!("expected queued");
        };
        assert_eq!(engine.queue_snapshot().pending, 1);

        network.set_all_online(true);
        engine.set_connectivity(false).await;
        let report = engine.set_connectivity(true).await.unwrap();
        assert_eq!(report.delivered.len(), 1);
        assert!(network.relay(A).unwrap().has_event(event_id));
        assert_eq!(engine.queue_snapshot().total(), 0);
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_publishes_deletion() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        engine.generate_key("K", None).unwrap();
        let id = engine
            .save("t", "v", vec![], None)
            .await
            .unwrap()
            .event_id()
            .to_string();

        assert!(engine.delete_secret(&id, None).await.unwrap());
        assert!(engine.secrets().is_empty());
        assert_eq!(engine.deleted_secrets().len(), 1);
        assert!(network
            .relay(A)
            .unwrap()
            .events()
            .iter()
            .any(|e| e.kind == Kind::DELETION && e.tag_values("e").any(|v| v == id)));

        assert!(engine.restore_secret(&id).unwrap());
        assert_eq!(engine.secrets().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_foreign_key_rejected() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        engine.generate_key("Author", None).unwrap();
        let other = engine.generate_key("Other", None).unwrap();
        let id = engine
            .save("t", "v", vec![], None)
            .await
            .unwrap()
            .event_id()
            .to_string();

        assert!(matches!(
            engine.delete_secret(&id, Some(&other.id)).await,
            Err(SafeError::InvalidKey(_))
        ));
        assert!(engine.tombstones().is_empty());
        assert_eq!(engine.secrets().len(), 1);
        assert!(!network
            .relay(A)
            .unwrap()
            .events()
            .iter()
            .any(|e| e.kind == Kind::DELETION));
    }

    #[tokio::test]
    async fn test_delete_offline_still_tombstones() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        let key = engine.generate_key("K", None).unwrap();
        network.set_all_online(false);

        let acked = engine
            .delete_secret(&"ab".repeat(32), Some(&key.id))
            .await
            .unwrap();
        assert!(!acked);
        assert_eq!(engine.tombstones().len(), 1);
        assert_eq!(engine.queue_snapshot().pending, 1);
    }

    #[tokio::test]
    async fn test_sync_one_forwards_to_missing_relay() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        engine.generate_key("K", None).unwrap();
        network.relay(B).unwrap().set_online(false);
        let id = engine
            .save("t", "v", vec![], None)
            .await
            .unwrap()
            .event_id()
            .to_string();
        assert_eq!(engine.sync_status(&id).unwrap().missing_relays, vec![B]);

        network.relay(B).unwrap().set_online(true);
        let report = engine.sync_one(&id).await.unwrap();
        assert_eq!(report.succeeded, vec![B]);
        assert!(engine.under_replicated().is_empty());
        assert_eq!(
            network.relay(B).unwrap().event(&id),
            network.relay(A).unwrap().event(&id)
        );
    }

    #[test]
    fn test_pin_lifecycle_and_wipe() {
        let network = MemoryNetwork::new();
        let storage = Storage::in_memory().unwrap();
        let engine = engine_over(&network, storage.clone());
        engine.create_vault(Some("1234")).unwrap();
        engine.generate_key("K", None).unwrap();
        engine.lock();
        assert!(!engine.is_unlocked());

        assert!(matches!(
            engine.unlock(Some("0000")),
            Err(SafeError::AuthenticationFailed {
                remaining_attempts: 2
            })
        ));
        engine.unlock(Some("1234")).unwrap();
        assert_eq!(engine.keys().len(), 1);

        engine.disable_pin().unwrap();
        let reopened = engine_over(&network, storage.clone());
        reopened.unlock(None).unwrap();
        assert_eq!(reopened.mode(), Some(VaultMode::Plain));

        reopened.enable_pin("9999").unwrap();
        reopened.lock();
        for _ in 0..2 {
            assert!(reopened.unlock(Some("1111")).is_err());
        }
        assert!(matches!(
            reopened.unlock(Some("1111")),
            Err(SafeError::VaultWiped)
        ));
        assert!(!reopened.vault_exists().unwrap());
    }

    #[test]
    fn test_locked_operations_fail() {
        let (_, engine) = setup();
        assert!(matches!(
            engine.generate_key("K", None),
            Err(SafeError::VaultLocked)
        ));
        assert!(engine.secrets().is_empty());
        assert!(matches!(engine.unlock(None), Err(SafeError::VaultNotFound)));
    }

    #[test]
    fn test_relays_persist() {
        let network = MemoryNetwork::new();
        let storage = Storage::in_memory().unwrap();
        let engine = engine_over(&network, storage.clone());
        assert!(engine.add_relay("wss://c.test").unwrap());
        assert!(!engine.add_relay("wss://c.test/").unwrap());
        assert!(engine.remove_relay(A).unwrap());

        let reopened =
            SafeEngine::with_config(storage, Arc::new(network.clone()), config()).unwrap();
        assert_eq!(reopened.relays(), vec![B, "wss://c.test"]);
    }

    #[tokio::test]
    async fn test_refresh_all_failed_marks_disconnected() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        engine.generate_key("K", None).unwrap();
        network.set_all_online(false);
        let mut events = engine.subscribe();

        assert!(matches!(
            engine.refresh().await,
            Err(SafeError::AllRelaysFailed(_))
        ));
        assert!(!engine.is_connected());
        assert!(engine.error().is_some());
        assert!(!engine.is_loading());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, EngineEvent::Error(_));
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_refresh_without_keys_keeps_connectivity() {
        let (network, engine) = setup();
        engine.create_vault(None).unwrap();
        network.set_all_online(false);
        assert!(engine.set_connectivity(false).await.is_none());

        let result = engine.refresh().await.unwrap();
        assert!(result.responded.is_empty());
        assert!(!engine.is_connected());
        assert!(engine.process_queue(true).await.offline);
    }
}
