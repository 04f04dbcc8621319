//! Durable offline write queue
//!
//! Writes that no relay acknowledged are parked here and retried.
//!
//! ```text
//!   enqueue ──► queue table (postcard, no private keys)
//!                   │
//!   tick / reconnect│  resolve key_ref in the unlocked vault, re-sign
//!                   ▼
//!              publish_all ── any ack ──► removed
//!                   │
//!                   └─ none ──► retry_count += 1, wait per schedule
//!                                  └─ at max_retries: exhausted (kept)
//! ```
//!
//! An item whose key cannot be resolved (vault locked, key removed) is
//! skipped and left untouched. Exhausted items stay until they are reset
//! with [`OfflineQueue::retry_exhausted`] or removed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RelayConfig, RetrySchedule};
use crate::error::{SafeError, SafeResult};
use crate::event::{Kind, SignedEvent, UnsignedEvent};
use crate::keys::Keys;
use crate::pool::{PublishReport, RelayPool};
use crate::storage::{Storage, StorageTable};
use crate::task::{PeriodicTask, RunGuard};

/// Looks up signing keys by hex public key in the live vault
pub type KeyResolver = Arc<dyn Fn(&str) -> Option<Keys> + Send + Sync>;

/// A write waiting for a relay to accept it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWrite {
    /// Queue item id
    pub id: String,
    /// Id the event will have once signed
    pub event_id: String,
    /// Author public key (hex); the private half is resolved at retry time
    pub key_ref: String,
    /// Event kind
    pub kind: Kind,
    /// Event tags (includes the recipient `p` tag)
    pub tags: Vec<Vec<String>>,
    /// Already-encrypted content
    pub content: String,
    /// Event timestamp, fixed so the id survives re-signing
    pub created_at: u64,
    /// When the item was queued (unix ms)
    pub enqueued_at: i64,
    /// Failed retries so far
    pub retry_count: u32,
    /// Last retry (unix ms)
    pub last_retry_at: Option<i64>,
    /// Last failure
    pub last_error: Option<String>,
    /// No more automatic retries
    pub exhausted: bool,
}

impl QueuedWrite {
    /// Strip the signature from `event` and record what is needed to
    /// re-sign it later
    pub fn from_event(event: &SignedEvent) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            event_id: event.id.clone(),
            key_ref: event.pubkey.clone(),
            kind: event.kind,
            tags: event.tags.clone(),
            content: event.content.clone(),
            created_at: event.created_at,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            last_retry_at: None,
            last_error: None,
            exhausted: false,
        }
    }

    /// Recipient public key (hex)
    pub fn recipient(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some("p"))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Re-sign with the hydrated keys
    pub fn hydrate(&self, keys: &Keys) -> SafeResult<SignedEvent> {
        UnsignedEvent {
            pubkey: self.key_ref.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
        .sign(keys)
    }

    /// Earliest time (unix ms) of the next automatic retry, or `None` once
    /// exhausted
    pub fn next_attempt_at(&self, schedule: &RetrySchedule) -> Option<i64> {
        if self.exhausted {
            return None;
        }
        let since = self.last_retry_at.unwrap_or(self.enqueued_at);
        let wait = schedule.delay_for(self.retry_count).as_millis() as i64;
        Some(since.saturating_add(wait))
    }

    fn encode(&self) -> SafeResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SafeError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> SafeResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| SafeError::Serialization(e.to_string()))
    }
}

/// Observable queue size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Items still being retried
    pub pending: usize,
    /// Items that ran out of retries
    pub exhausted: usize,
}

impl QueueSnapshot {
    /// All items
    pub fn total(&self) -> usize {
        self.pending + self.exhausted
    }
}

/// What one retry pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Delivered and removed
    pub delivered: Vec<String>,
    /// Attempted and failed again
    pub failed: Vec<String>,
    /// Failed for the last time this pass
    pub exhausted: Vec<String>,
    /// Key could not be resolved
    pub skipped: usize,
    /// Another pass was running; nothing was done
    pub busy: bool,
    /// Connectivity is down; nothing was done
    pub offline: bool,
}

/// Retry queue service
pub struct OfflineQueue {
    storage: Storage,
    schedule: RetrySchedule,
    max_retries: u32,
    tick: Duration,
    items: RwLock<BTreeMap<String, QueuedWrite>>,
    snapshot: watch::Sender<QueueSnapshot>,
    processing: AtomicBool,
    online: AtomicBool,
    force_next: AtomicBool,
    task: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("snapshot", &*self.snapshot.borrow())
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    /// Load persisted items
    pub fn init(storage: Storage, config: &EngineConfig) -> SafeResult<Self> {
        let mut items = BTreeMap::new();
        for (key, bytes) in storage.entries(StorageTable::Queue)? {
            match QueuedWrite::decode(&bytes) {
                Ok(item) => {
                    items.insert(item.id.clone(), item);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable queue item"),
            }
        }

        let queue = Self {
            storage,
            schedule: config.retry_schedule.clone(),
            max_retries: config.max_retries.max(1),
            tick: config.queue_tick(),
            items: RwLock::new(items),
            snapshot: watch::channel(QueueSnapshot::default()).0,
            processing: AtomicBool::new(false),
            online: AtomicBool::new(true),
            force_next: AtomicBool::new(false),
            task: Mutex::new(None),
        };
        queue.notify();
        info!(items = queue.len(), "Offline queue loaded");
        Ok(queue)
    }

    fn notify(&self) {
        let snapshot = {
            let items = self.items.read();
            let exhausted = items.values().filter(|i| i.exhausted).count();
            QueueSnapshot {
                pending: items.len() - exhausted,
                exhausted,
            }
        };
        self.snapshot.send_if_modified(|current| {
            let changed = *current != snapshot;
            *current = snapshot;
            changed
        });
    }

    /// Watch queue size changes
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.subscribe()
    }

    /// Current size
    pub fn snapshot(&self) -> QueueSnapshot {
        *self.snapshot.borrow()
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// No items
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// All items, oldest first
    pub fn items(&self) -> Vec<QueuedWrite> {
        let mut items: Vec<QueuedWrite> = self.items.read().values().cloned().collect();
        items.sort_by_key(|i| i.enqueued_at);
        items
    }

    /// One item
    pub fn get(&self, id: &str) -> Option<QueuedWrite> {
        self.items.read().get(id).cloned()
    }

    fn persist(&self, item: &QueuedWrite) -> SafeResult<()> {
        let mut items = self.items.write();
        self.storage
            .put(StorageTable::Queue, &item.id, &item.encode()?)?;
        items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    /// Write back retry state, unless the item was removed in the meantime.
    /// Returns `false` when the item no longer exists.
    fn update(&self, item: &QueuedWrite) -> SafeResult<bool> {
        let mut items = self.items.write();
        if !items.contains_key(&item.id) {
            return Ok(false);
        }
        self.storage
            .put(StorageTable::Queue, &item.id, &item.encode()?)?;
        items.insert(item.id.clone(), item.clone());
        Ok(true)
    }

    /// Park `event` for retry. A second enqueue of the same event id returns
    /// the existing item.
    pub fn enqueue(&self, event: &SignedEvent) -> SafeResult<QueuedWrite> {
        let existing = self
            .items
            .read()
            .values()
            .find(|i| i.event_id == event.id)
            .cloned();
        if let Some(existing) = existing {
            debug!(queue_id = %existing.id, event_id = %event.id, "Already queued");
            return Ok(existing);
        }

        let item = QueuedWrite::from_event(event);
        self.persist(&item)?;
        self.notify();
        info!(queue_id = %item.id, event_id = %item.event_id, kind = %item.kind, "Write queued");
        Ok(item)
    }

    /// Drop an item. Returns `false` if it did not exist.
    pub fn remove(&self, id: &str) -> SafeResult<bool> {
        {
            let mut items = self.items.write();
            if !items.contains_key(id) {
                return Ok(false);
            }
            self.storage.remove(StorageTable::Queue, id)?;
            items.remove(id);
        }
        self.notify();
        Ok(true)
    }

    /// Drop every item
    pub fn clear(&self) -> SafeResult<()> {
        self.storage.clear(StorageTable::Queue)?;
        self.items.write().clear();
        self.notify();
        Ok(())
    }

    /// Give an exhausted item a fresh set of retries
    pub fn retry_exhausted(&self, id: &str) -> SafeResult<bool> {
        let Some(mut item) = self.get(id) else {
            return Ok(false);
        };
        if !item.exhausted {
            return Ok(false);
        }
        item.exhausted = false;
        item.retry_count = 0;
        item.last_retry_at = None;
        item.enqueued_at = chrono::Utc::now().timestamp_millis();
        if !self.update(&item)? {
            return Ok(false);
        }
        self.notify();
        info!(queue_id = %id, "Exhausted item reset");
        Ok(true)
    }

    /// Whether retries are currently allowed
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record connectivity. Going from offline to online schedules an
    /// immediate forced pass on the background task; returns whether that
    /// transition happened.
    pub fn set_connectivity(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        let came_back = online && !was_online;
        if came_back {
            info!("Connectivity restored, retrying queued writes");
            self.force_next.store(true, Ordering::SeqCst);
            if let Some(task) = self.task.lock().as_ref() {
                task.trigger();
            }
        } else if !online && was_online {
            info!("Connectivity lost, pausing retries");
        }
        came_back
    }

    /// Run one retry pass.
    ///
    /// `force` ignores backoff waits (exhausted items are still skipped).
    pub async fn process(
        &self,
        resolver: &KeyResolver,
        pool: &RelayPool,
        relays: &RelayConfig,
        force: bool,
    ) -> ProcessReport {
        let mut report = ProcessReport::default();
        if !self.is_online() {
            report.offline = true;
            return report;
        }
        let Some(_guard) = RunGuard::acquire(&self.processing) else {
            debug!("Queue pass already running");
            report.busy = true;
            return report;
        };

        let urls = relays.urls();
        if urls.is_empty() {
            debug!("No relays configured, queue pass skipped");
            return report;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let due: Vec<QueuedWrite> = self
            .items()
            .into_iter()
            .filter(|item| match item.next_attempt_at(&self.schedule) {
                Some(at) => force || at <= now,
                None => false,
            })
            .collect();

        for mut item in due {
            let Some(keys) = resolver(&item.key_ref) else {
                debug!(queue_id = %item.id, "Signing key unavailable, item skipped");
                report.skipped += 1;
                continue;
            };

            let outcome = match item.hydrate(&keys) {
                Ok(event) => pool.publish_all(&urls, &event).await,
                Err(e) => PublishReport {
                    failed: vec![(String::new(), e.to_string())],
                    ..Default::default()
                },
            };

            if outcome.any_accepted() {
                match self.remove(&item.id) {
                    Ok(_) => {
                        info!(queue_id = %item.id, event_id = %item.event_id, relays = outcome.accepted.len(), "Queued write delivered");
                        report.delivered.push(item.id);
                    }
                    Err(e) => warn!(queue_id = %item.id, error = %e, "Delivered but could not dequeue"),
                }
                continue;
            }

            item.retry_count += 1;
            item.last_retry_at = Some(chrono::Utc::now().timestamp_millis());
            item.last_error = Some(summarize(&outcome));
            item.exhausted = item.retry_count >= self.max_retries;
            match self.update(&item) {
                Ok(false) => {
                    debug!(queue_id = %item.id, "Removed during pass, not written back");
                    continue;
                }
                Ok(true) => {}
                Err(e) => warn!(queue_id = %item.id, error = %e, "Could not persist retry state"),
            }
            if item.exhausted {
                warn!(queue_id = %item.id, retries = item.retry_count, "Queued write exhausted");
                report.exhausted.push(item.id.clone());
            } else {
                debug!(queue_id = %item.id, retries = item.retry_count, "Queued write failed");
                report.failed.push(item.id.clone());
            }
        }

        self.notify();
        report
    }

    /// Start the background retry loop. Replaces a previously spawned loop.
    pub fn spawn(
        self: &Arc<Self>,
        resolver: KeyResolver,
        pool: RelayPool,
        relays: RelayConfig,
    ) {
        let weak = Arc::downgrade(self);
        let task = PeriodicTask::spawn("offline-queue", self.tick, move || {
            let weak = weak.clone();
            let resolver = resolver.clone();
            let pool = pool.clone();
            let relays = relays.clone();
            async move {
                let Some(queue) = weak.upgrade() else {
                    return;
                };
                let force = queue.force_next.swap(false, Ordering::SeqCst);
                let report = queue.process(&resolver, &pool, &relays, force).await;
                if !report.delivered.is_empty() || !report.exhausted.is_empty() {
                    debug!(?report, "Queue pass finished");
                }
            }
        });
        if self.force_next.load(Ordering::SeqCst) {
            task.trigger();
        }
        *self.task.lock() = Some(task);
    }

    /// Background loop handle, if spawned
    pub fn is_spawned(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop the background loop
    pub async fn shutdown(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }
}

fn summarize(report: &PublishReport) -> String {
    if report.rejected.is_empty() && report.failed.is_empty() {
        return "no relay accepted the event".to_string();
    }
    report
        .rejected
        .iter()
        .chain(report.failed.iter())
        .map(|(relay, reason)| {
            if relay.is_empty() {
                reason.clone()
            } else {
                format!("{}: {}", relay, reason)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::encrypted_direct_message;
    use crate::transport::memory::MemoryNetwork;

    const RELAY: &str = "wss://relay.test";

    struct Fixture {
        network: MemoryNetwork,
        pool: RelayPool,
        relays: RelayConfig,
        keys: Keys,
        resolver: KeyResolver,
        queue: OfflineQueue,
        storage: Storage,
    }

    fn fixture() -> Fixture {
        let network = MemoryNetwork::new();
        network.add_relay(RELAY);
        let config = EngineConfig {
            publish_timeout_secs: 1,
            max_retries: 3,
            ..Default::default()
        };
        let pool = RelayPool::new(Arc::new(network.clone()), &config);
        let relays = RelayConfig::new([RELAY]).unwrap();
        let keys = Keys::generate();
        let known = keys.clone();
        let resolver: KeyResolver = Arc::new(move |public: &str| {
            (public == known.public_hex()).then(|| known.clone())
        });
        let storage = Storage::in_memory().unwrap();
        let queue = OfflineQueue::init(storage.clone(), &config).unwrap();
        Fixture {
            network,
            pool,
            relays,
            keys,
            resolver,
            queue,
            storage,
        }
    }

    fn event(keys: &Keys) -> SignedEvent {
        encrypted_direct_message(keys, &keys.public_key(), "ciphertext").unwrap()
    }

    #[test]
    fn test_persisted_item_has_no_private_key() {
        let f = fixture();
        let item = f.queue.enqueue(&event(&f.keys)).unwrap();
        let bytes = f.storage.get(StorageTable::Queue, &item.id).unwrap().unwrap();
        let nsec = f.keys.nsec().unwrap();
        let secret_hex = hex::encode(f.keys.secret_key().secret_bytes());

        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains(&nsec));
        assert!(!text.contains(&secret_hex));
        let secret = f.keys.secret_key().secret_bytes();
        assert!(!bytes.windows(32).any(|w| w == secret.as_slice()));
    }

    #[test]
    fn test_hydrate_keeps_event_id() {
        let keys = Keys::generate();
        let original = event(&keys);
        let item = QueuedWrite::from_event(&original);
        let resigned = item.hydrate(&keys).unwrap();
        assert_eq!(resigned.id, original.id);
        assert!(resigned.verify());
        assert_eq!(item.recipient(), Some(keys.public_hex().as_str()));
    }

    #[test]
    fn test_enqueue_dedupes_and_reloads() {
        let f = fixture();
        let e = event(&f.keys);
        let first = f.queue.enqueue(&e).unwrap();
        let second = f.queue.enqueue(&e).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.queue.snapshot().pending, 1);

        let reloaded = OfflineQueue::init(f.storage.clone(), &EngineConfig::default()).unwrap();
        assert_eq!(reloaded.items(), vec![first]);
    }

    #[tokio::test]
    async fn test_delivery_removes_item() {
        let f = fixture();
        let e = event(&f.keys);
        f.queue.enqueue(&e).unwrap();
        let mut rx = f.queue.subscribe();

        let report = f.queue.process(&f.resolver, &f.pool, &f.relays, true).await;
        assert_eq!(report.delivered.len(), 1);
        assert!(f.queue.is_empty());
        assert!(f.network.relay(RELAY).unwrap().has_event(&e.id));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().total(), 0);
    }

    #[tokio::test]
    async fn test_failures_exhaust_and_are_kept() {
        let f = fixture();
        f.network.relay(RELAY).unwrap().set_online(false);
        let item = f.queue.enqueue(&event(&f.keys)).unwrap();

        for expected in 1..=3u32 {
            f.queue.process(&f.resolver, &f.pool, &f.relays, true).await;
            assert_eq!(f.queue.get(&item.id).unwrap().retry_count, expected);
        }
        let stuck = f.queue.get(&item.id).unwrap();
        assert!(stuck.exhausted);
        assert!(stuck.last_error.is_some());
        assert_eq!(f.queue.snapshot().exhausted, 1);

        // No longer selected
        let report = f.queue.process(&f.resolver, &f.pool, &f.relays, true).await;
        assert!(report.failed.is_empty() && report.exhausted.is_empty());
        assert_eq!(f.queue.get(&item.id).unwrap().retry_count, 3);

        // Manual reset
        assert!(f.queue.retry_exhausted(&item.id).unwrap());
        f.network.relay(RELAY).unwrap().set_online(true);
        let report = f.queue.process(&f.resolver, &f.pool, &f.relays, true).await;
        assert_eq!(report.delivered, vec![item.id]);
    }

    #[tokio::test]
    async fn test_unresolvable_key_is_skipped_not_destroyed() {
        let f = fixture();
        let stranger = Keys::generate();
        let item = f.queue.enqueue(&event(&stranger)).unwrap();

        let report = f.queue.process(&f.resolver, &f.pool, &f.relays, true).await;
        assert_eq!(report.skipped, 1);
        let kept = f.queue.get(&item.id).unwrap();
        assert_eq!(kept.retry_count, 0);
        assert!(!kept.exhausted);
    }

    #[tokio::test]
    async fn test_offline_pass_does_nothing() {
        let f = fixture();
        f.queue.enqueue(&event(&f.keys)).unwrap();
        f.queue.set_connectivity(false);

        let report = f.queue.process(&f.resolver, &f.pool, &f.relays, true).await;
        assert!(report.offline);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.network.relay(RELAY).unwrap().publish_count(), 0);
    }

    #[tokio::test]
    async fn test_not_due_items_wait() {
        let f = fixture();
        f.queue.enqueue(&event(&f.keys)).unwrap();
        let report = f.queue.process(&f.resolver, &f.pool, &f.relays, false).await;
        assert!(report.delivered.is_empty());
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn test_backoff_is_monotonic_and_stops() {
        let schedule = RetrySchedule::default();
        let mut item = QueuedWrite::from_event(&event(&Keys::generate()));
        item.last_retry_at = Some(0);
        let mut previous = 0;
        for count in 0..8 {
            item.retry_count = count;
            let wait = item.next_attempt_at(&schedule).unwrap();
            assert!(wait >= previous);
            previous = wait;
        }
        assert_eq!(previous, 120_000);
        item.exhausted = true;
        assert_eq!(item.next_attempt_at(&schedule), None);
    }

    #[test]
    fn test_connectivity_transition() {
        let f = fixture();
        assert!(!f.queue.set_connectivity(true));
        assert!(!f.queue.set_connectivity(false));
        assert!(f.queue.set_connectivity(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_background_pass() {
        let f = fixture();
        let queue = Arc::new(f.queue);
        queue.set_connectivity(false);
        queue.enqueue(&event(&f.keys)).unwrap();
        queue.spawn(f.resolver.clone(), f.pool.clone(), f.relays.clone());

        queue.set_connectivity(true);
        for _ in 0..20 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());
        queue.shutdown().await;
        assert!(!queue.is_spawned());
    }
}
