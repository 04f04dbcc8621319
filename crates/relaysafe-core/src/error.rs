//! Error types for RelaySafe

use thiserror::Error;

/// Main error type for RelaySafe operations
///
/// Vault integrity violations and replication gaps are not errors; they are
/// reported as `HealReport` and `SyncReport`.
#[derive(Error, Debug)]
pub enum SafeError {
    /// Wrong PIN or tampered vault ciphertext
    #[error("Incorrect PIN ({remaining_attempts} attempts remaining)")]
    AuthenticationFailed {
        /// Attempts left before the vault is wiped
        remaining_attempts: u32,
    },

    /// Too many consecutive PIN failures; local state was erased
    #[error("Too many incorrect PIN attempts, vault has been wiped")]
    VaultWiped,

    /// No vault exists in storage
    #[error("Vault not found")]
    VaultNotFound,

    /// A vault already exists and would be overwritten
    #[error("Vault already exists")]
    VaultExists,

    /// Operation requires an unlocked vault
    #[error("Vault is locked")]
    VaultLocked,

    /// The vault is PIN protected but no PIN was supplied
    #[error("PIN required")]
    PinRequired,

    /// Per-record decryption failure (bad MAC, padding, IV or encoding)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Secret payload carries no explicit encryption version tag
    #[error("Secret payload has no encryption version tag")]
    MissingVersionTag,

    /// Unknown encryption scheme version
    #[error("Unsupported encryption version: {0}")]
    UnsupportedVersion(u8),

    /// Cryptographic operation failed (encryption side)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Malformed key material (bech32, hex, curve point)
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Owner key not present in the vault
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key with the same public key is already in the vault
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Secret record not present in the current view
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Malformed protocol record
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Record signature or id does not verify
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Relay connection or framing error
    #[error("Relay {relay}: {message}")]
    Transport {
        /// Relay endpoint URL
        relay: String,
        /// Description of the failure
        message: String,
    },

    /// Relay operation exceeded its time bound
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Relay operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Relay URL rejected by configuration
    #[error("Invalid relay URL: {0}")]
    InvalidRelayUrl(String),

    /// Aggregate operation with an empty relay list
    #[error("No relays configured")]
    NoRelaysConfigured,

    /// Every configured relay failed during an aggregate operation
    #[error("All relays failed: {}", .0.join("; "))]
    AllRelaysFailed(Vec<String>),

    /// A full sync pass is already running
    #[error("Sync already in progress")]
    SyncInProgress,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage operation error (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SafeError {
    /// Build a transport error for a relay
    pub fn transport(relay: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SafeError::Transport {
            relay: relay.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error should surface to the caller as a hard failure
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SafeError::AuthenticationFailed { .. }
                | SafeError::VaultWiped
                | SafeError::VaultNotFound
                | SafeError::PinRequired
        )
    }
}

impl From<serde_json::Error> for SafeError {
    fn from(err: serde_json::Error) -> Self {
        SafeError::Serialization(err.to_string())
    }
}

/// Result type alias using SafeError
pub type SafeResult<T> = Result<T, SafeError>;
