//! Engine notifications for UI surfaces
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  EngineEvent (broadcast)                                        │
//! │  ├── VaultUnlocked / VaultLocked                                │
//! │  ├── RelayCompleted: one relay answered during refresh          │
//! │  ├── SecretsUpdated: visible secret list changed                │
//! │  ├── SecretSaved / SecretQueued / SecretDeleted                 │
//! │  ├── SyncProgress / SyncCompleted                               │
//! │  ├── QueueChanged: offline queue size changed                   │
//! │  └── Error: non-fatal problem worth showing                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::aggregator::RelayStatus;
use crate::queue::QueueSnapshot;

/// Broadcast buffer size; slow subscribers lag rather than block
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened inside the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Vault opened
    VaultUnlocked {
        /// Keys in the vault
        key_count: usize,
        /// Repairs applied while loading
        repairs: usize,
    },
    /// Vault closed and in-memory state cleared
    VaultLocked,
    /// A relay finished answering a refresh
    RelayCompleted {
        /// Relay URL
        relay: String,
        /// How it went
        status: RelayStatus,
        /// Records seen so far
        seen: usize,
    },
    /// The visible secret list changed
    SecretsUpdated {
        /// Visible secrets
        count: usize,
    },
    /// A secret reached at least one relay
    SecretSaved {
        /// Event id
        event_id: String,
        /// Relays that accepted it
        relays: Vec<String>,
    },
    /// A write was parked in the offline queue
    SecretQueued {
        /// Queue item id
        queue_id: String,
        /// Event id it will have
        event_id: String,
    },
    /// A secret was tombstoned
    SecretDeleted {
        /// Event id
        event_id: String,
        /// Whether a relay accepted the deletion request
        relay_acknowledged: bool,
    },
    /// A full sync pass moved to the next record
    SyncProgress {
        /// Zero-based position
        index: usize,
        /// Records in the pass
        total: usize,
        /// Record id
        event_id: String,
    },
    /// A sync pass finished
    SyncCompleted {
        /// Records repaired on every missing relay
        repaired: usize,
        /// Records with at least one failed relay
        failed: usize,
    },
    /// Offline queue size changed
    QueueChanged(QueueSnapshot),
    /// Non-fatal error
    Error(String),
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::VaultUnlocked { key_count, repairs } => {
                write!(f, "vault unlocked ({} keys, {} repairs)", key_count, repairs)
            }
            EngineEvent::VaultLocked => write!(f, "vault locked"),
            EngineEvent::RelayCompleted { relay, status, seen } => match status {
                RelayStatus::Responded { events } => {
                    write!(f, "{} answered with {} events ({} secrets so far)", relay, events, seen)
                }
                RelayStatus::Failed(error) => write!(f, "{} failed: {}", relay, error),
            },
            EngineEvent::SecretsUpdated { count } => write!(f, "{} secrets", count),
            EngineEvent::SecretSaved { event_id, relays } => {
                write!(f, "saved {} to {} relays", event_id, relays.len())
            }
            EngineEvent::SecretQueued { queue_id, .. } => write!(f, "queued write {}", queue_id),
            EngineEvent::SecretDeleted { event_id, .. } => write!(f, "deleted {}", event_id),
            EngineEvent::SyncProgress {
                index,
                total,
                event_id,
            } => write!(f, "syncing {}/{}: {}", index + 1, total, event_id),
            EngineEvent::SyncCompleted { repaired, failed } => {
                write!(f, "sync finished ({} repaired, {} failed)", repaired, failed)
            }
            EngineEvent::QueueChanged(snapshot) => write!(
                f,
                "queue: {} pending, {} exhausted",
                snapshot.pending, snapshot.exhausted
            ),
            EngineEvent::Error(message) => write!(f, "error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let event = EngineEvent::SyncProgress {
            index: 0,
            total: 3,
            event_id: "abc".into(),
        };
        assert_eq!(event.to_string(), "syncing 1/3: abc");

        let failed = EngineEvent::RelayCompleted {
            relay: "wss://a".into(),
            status: RelayStatus::Failed("timeout".into()),
            seen: 0,
        };
        assert_eq!(failed.to_string(), "wss://a failed: timeout");
    }
}
