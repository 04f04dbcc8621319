//! Cross-relay replication repair
//!
//! A record is under-replicated when a configured relay is missing from its
//! membership set. Repair forwards the *original* signed event, fetched by
//! id from a relay that already holds it, to each missing relay:
//!
//! ```text
//!   sources (membership set) ── REQ ids=[id] ──► first copy that verifies
//!                                                and equals the known event
//!                                                       │
//!   missing relays ◄──────────── EVENT (verbatim) ──────┘
//! ```
//!
//! Nothing is ever re-encrypted or re-signed here, so the event id cannot
//! change. If no source can serve the original, the repair fails closed and
//! every missing relay is reported as failed.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{SafeError, SafeResult};
use crate::event::SignedEvent;
use crate::filter::Filter;
use crate::pool::RelayPool;
use crate::secret::SecretRecord;
use crate::task::RunGuard;

/// Replication state of one record
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// Configured relays that do not hold the record
    pub missing_relays: Vec<String>,
    /// Share of configured relays holding the record (0-100)
    pub replication_percent: f64,
}

impl SyncStatus {
    /// Compare a membership set against the configured relays
    pub fn of(relays: &BTreeSet<String>, configured: &[String]) -> Self {
        if configured.is_empty() {
            return Self {
                missing_relays: Vec::new(),
                replication_percent: 100.0,
            };
        }
        let missing_relays: Vec<String> = configured
            .iter()
            .filter(|url| !relays.contains(*url))
            .cloned()
            .collect();
        let present = configured.len() - missing_relays.len();
        Self {
            replication_percent: present as f64 * 100.0 / configured.len() as f64,
            missing_relays,
        }
    }

    /// Some configured relay lacks the record
    pub fn needs_sync(&self) -> bool {
        !self.missing_relays.is_empty()
    }
}

/// Outcome of repairing one record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Record id
    pub event_id: String,
    /// Relay the original was fetched from
    pub source: Option<String>,
    /// Relays that accepted the forwarded event
    pub succeeded: Vec<String>,
    /// Relays that could not be repaired, with the reason
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    /// Every missing relay was repaired
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Progress of a full pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    /// Zero-based position of the record being repaired
    pub index: usize,
    /// Records needing repair in this pass
    pub total: usize,
    /// Record id
    pub event_id: String,
}

/// Repairs under-replicated records
#[derive(Debug, Clone)]
pub struct SyncReconciler {
    pool: RelayPool,
    relays: RelayConfig,
    running: Arc<AtomicBool>,
}

impl SyncReconciler {
    /// Create a reconciler over `pool` and the shared relay list
    pub fn new(pool: RelayPool, relays: RelayConfig) -> Self {
        Self {
            pool,
            relays,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replication state of `record` against the current relay list
    pub fn status(&self, record: &SecretRecord) -> SyncStatus {
        SyncStatus::of(&record.relays, &self.relays.urls())
    }

    /// Whether a full pass is running
    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Find the original event on one of `sources`
    async fn fetch_original(
        &self,
        record: &SecretRecord,
        sources: &[String],
    ) -> Option<(String, SignedEvent)> {
        let filter = Filter::new().ids([record.id.clone()]).limit(1);
        for source in sources {
            match self.pool.fetch_from(source, &filter).await {
                Ok(events) => {
                    let original = events.into_iter().find(|event| {
                        event.id == record.id && event.verify() && *event == record.event
                    });
                    match original {
                        Some(event) => return Some((source.clone(), event)),
                        None => debug!(relay = %source, event_id = %record.id, "Source no longer holds record"),
                    }
                }
                Err(e) => debug!(relay = %source, event_id = %record.id, error = %e, "Source unreachable"),
            }
        }
        None
    }

    /// Repair one record. Never fails: problems are reported per relay.
    pub async fn sync_one(&self, record: &SecretRecord) -> SyncReport {
        let status = self.status(record);
        let mut report = SyncReport {
            event_id: record.id.clone(),
            ..Default::default()
        };
        if !status.needs_sync() {
            return report;
        }

        let sources: Vec<String> = record.relays.iter().cloned().collect();
        let Some((source, event)) = self.fetch_original(record, &sources).await else {
            warn!(event_id = %record.id, sources = sources.len(), "Original record unavailable, not repairing");
            report.failed = status
                .missing_relays
                .into_iter()
                .map(|relay| (relay, "original record unavailable on every source relay".to_string()))
                .collect();
            return report;
        };
        report.source = Some(source);

        for relay in status.missing_relays {
            match self.pool.publish_to(&relay, &event).await {
                Ok(ack) if ack.accepted => report.succeeded.push(relay),
                Ok(ack) => report.failed.push((relay, ack.message)),
                Err(e) => report.failed.push((relay, e.to_string())),
            }
        }

        info!(
            event_id = %record.id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Record sync finished"
        );
        report
    }

    /// Repair every under-replicated record, one at a time.
    ///
    /// Fails with [`SafeError::SyncInProgress`] if a pass is already
    /// running.
    pub async fn sync_all<F>(
        &self,
        records: &[SecretRecord],
        mut on_progress: F,
    ) -> SafeResult<Vec<SyncReport>>
    where
        F: FnMut(SyncProgress),
    {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            return Err(SafeError::SyncInProgress);
        };

        let pending: Vec<&SecretRecord> = records
            .iter()
            .filter(|record| self.status(record).needs_sync())
            .collect();
        info!(records = pending.len(), "Sync pass started");

        let mut reports = Vec::with_capacity(pending.len());
        for (index, record) in pending.iter().enumerate() {
            on_progress(SyncProgress {
                index,
                total: pending.len(),
                event_id: record.id.clone(),
            });
            reports.push(self.sync_one(record).await);
        }
        Ok(reports)
    }
}
