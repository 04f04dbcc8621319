//! RelaySafe Core Library
//!
//! Encrypted secret storage on top of public relays, with an offline write
//! queue and cross-relay replication repair.
//!
//! ## Overview
//!
//! Secrets are encrypted twice to their owner's own key and published as
//! self-addressed direct messages. Relays only ever see ciphertext; owner
//! keys live in a local vault that can be sealed with a PIN.
//!
//! ## Core Principles
//!
//! - **Relay-agnostic**: every configured relay is equal; reads merge them all
//! - **Offline-tolerant**: unacknowledged writes are queued and retried
//! - **Content-addressed**: repair forwards original events, never re-signs
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaysafe_core::SafeEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SafeEngine::open("~/.relaysafe")?;
//!     engine.create_vault(Some("1234"))?;
//!     engine.generate_key("Personal", None)?;
//!
//!     engine.save("Wifi", "correct horse battery staple", vec![], None).await?;
//!
//!     engine.refresh().await?;
//!     for secret in engine.secrets() {
//!         println!("{} ({} relays)", secret.title, secret.relays.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod event;
pub mod events;
pub mod filter;
pub mod keys;
pub mod pool;
pub mod queue;
pub mod reconciler;
pub mod secret;
pub mod storage;
pub mod task;
pub mod transport;
pub mod vault;

// Re-exports
pub use aggregator::{AggregateEvent, AggregateResult, OwnedKey, RelayStatus, SecretAggregator};
pub use config::{normalize_relay_url, EngineConfig, RelayConfig, RetrySchedule};
pub use crypto::EncryptionScheme;
pub use engine::{SafeEngine, SaveOutcome};
pub use error::{SafeError, SafeResult};
pub use event::{Kind, SignedEvent, UnsignedEvent};
pub use events::{EngineEvent, EVENT_CHANNEL_CAPACITY};
pub use filter::Filter;
pub use keys::Keys;
pub use pool::{PublishReport, RelayPool};
pub use queue::{OfflineQueue, ProcessReport, QueueSnapshot, QueuedWrite};
pub use reconciler::{SyncReconciler, SyncReport, SyncStatus};
pub use secret::{SecretPayload, SecretRecord};
pub use storage::Storage;
pub use transport::memory::MemoryNetwork;
pub use transport::websocket::WebSocketConnector;
pub use transport::{RelayConnector, RelayTransport};
pub use vault::{AuditAction, AuditEntry, HealReport, OwnerKey, Tombstone, VaultData, VaultMode};
