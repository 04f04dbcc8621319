//! Persistent storage using redb.
//!
//! The engine needs nothing more than a few key/value namespaces:
//! - `vault`: the vault (encrypted or plain), its integrity checksum,
//!   legacy-format leftovers
//! - `settings`: vault mode, relay list, PIN attempt counter, engine config
//! - `queue`: one entry per queued offline write
//!
//! Multi-key updates that must land together (vault mode switches) go
//! through [`Storage::apply`], which commits every operation in a single
//! write transaction.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::SafeResult;

const VAULT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vault");
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");
const QUEUE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");

/// PIN-mode vault (encrypted JSON envelope)
pub const VAULT_BLOB: &str = "vault.blob";
/// PIN-disabled vault (plaintext JSON)
pub const VAULT_PLAIN: &str = "vault.plain";
/// Integrity checksum over the vault's security-relevant fields
pub const VAULT_CHECKSUM: &str = "vault.checksum";
/// Legacy single-key vault format
pub const VAULT_LEGACY: &str = "vault.legacy";
/// Legacy separately-stored PBKDF2 salt
pub const VAULT_SALT: &str = "vault.salt";
/// Last unreadable vault document, kept when it was replaced
pub const VAULT_UNREADABLE: &str = "vault.unreadable";

/// `"pin"` or `"plain"`
pub const SETTINGS_MODE: &str = "settings.mode";
/// JSON list of relay URLs
pub const SETTINGS_RELAYS: &str = "settings.relays";
/// Consecutive failed PIN attempts (decimal string)
pub const SETTINGS_PIN_ATTEMPTS: &str = "settings.pin_attempts";
/// JSON-encoded engine configuration
pub const SETTINGS_CONFIG: &str = "settings.config";

/// Key/value namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTable {
    /// Vault blob and metadata
    Vault,
    /// Engine settings
    Settings,
    /// Offline write queue
    Queue,
}

impl StorageTable {
    fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            StorageTable::Vault => VAULT_TABLE,
            StorageTable::Settings => SETTINGS_TABLE,
            StorageTable::Queue => QUEUE_TABLE,
        }
    }
}

/// One step of an atomic [`Storage::apply`]
#[derive(Debug, Clone)]
pub enum StorageOp {
    /// Insert or overwrite
    Put(StorageTable, String, Vec<u8>),
    /// Remove if present
    Remove(StorageTable, String),
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> SafeResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Database::create(path)?)
    }

    /// Volatile database for tests and ephemeral sessions
    pub fn in_memory() -> SafeResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> SafeResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(VAULT_TABLE)?;
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
            let _ = write_txn.open_table(QUEUE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Read a value
    pub fn get(&self, table: StorageTable, key: &str) -> SafeResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table.definition())?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Read a UTF-8 value; non-UTF-8 data reads as absent
    pub fn get_string(&self, table: StorageTable, key: &str) -> SafeResult<Option<String>> {
        Ok(self
            .get(table, key)?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    /// Whether `key` is present
    pub fn contains(&self, table: StorageTable, key: &str) -> SafeResult<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    /// Insert or overwrite a value
    pub fn put(&self, table: StorageTable, key: &str, value: &[u8]) -> SafeResult<()> {
        self.apply(&[StorageOp::Put(table, key.to_string(), value.to_vec())])
    }

    /// Remove a value (no-op if absent)
    pub fn remove(&self, table: StorageTable, key: &str) -> SafeResult<()> {
        self.apply(&[StorageOp::Remove(table, key.to_string())])
    }

    /// Every `(key, value)` in a table, in key order
    pub fn entries(&self, table: StorageTable) -> SafeResult<Vec<(String, Vec<u8>)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table.definition())?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    /// Every key in a table, in key order
    pub fn keys(&self, table: StorageTable) -> SafeResult<Vec<String>> {
        Ok(self
            .entries(table)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Remove every entry from a table
    pub fn clear(&self, table: StorageTable) -> SafeResult<()> {
        let ops: Vec<StorageOp> = self
            .keys(table)?
            .into_iter()
            .map(|key| StorageOp::Remove(table, key))
            .collect();
        self.apply(&ops)
    }

    /// Apply every operation in one write transaction
    pub fn apply(&self, ops: &[StorageOp]) -> SafeResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut vault = write_txn.open_table(VAULT_TABLE)?;
            let mut settings = write_txn.open_table(SETTINGS_TABLE)?;
            let mut queue = write_txn.open_table(QUEUE_TABLE)?;

            for op in ops {
                let (table, key) = match op {
                    StorageOp::Put(table, key, _) | StorageOp::Remove(table, key) => (*table, key),
                };
                let target = match table {
                    StorageTable::Vault => &mut vault,
                    StorageTable::Settings => &mut settings,
                    StorageTable::Queue => &mut queue,
                };
                match op {
                    StorageOp::Put(_, _, value) => {
                        target.insert(key.as_str(), value.as_slice())?;
                    }
                    StorageOp::Remove(..) => {
                        target.remove(key.as_str())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
