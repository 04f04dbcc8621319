//! Cross-relay secret aggregation
//!
//! ```text
//!   relay A ──┐
//!   relay B ──┼──► accept (kind 4, self-addressed, owned author, signature)
//!   relay C ──┘        │
//!                      ▼
//!                 SecretSet  id → SecretRecord { relays: A ∪ B ∪ C }
//!                      │      (placeholder titles)
//!                      ▼
//!                 hydrate (decrypt outer layer off the async runtime)
//! ```
//!
//! Merging is a union over relay-membership sets, so arrival order never
//! changes the result. A relay that fails is reported, not fatal, as long
//! as one other relay answered.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RelayConfig};
use crate::error::{SafeError, SafeResult};
use crate::event::{Kind, SignedEvent};
use crate::filter::Filter;
use crate::keys::Keys;
use crate::pool::RelayPool;
use crate::secret::{open_secret_event, ParsedPayload, SecretRecord};
use crate::vault::OwnerKey;

/// A vault key ready for decryption
#[derive(Clone)]
pub struct OwnedKey {
    /// Vault key id
    pub key_id: String,
    /// Parsed keypair
    pub keys: Keys,
}

impl OwnedKey {
    /// Parse the key material of a vault entry
    pub fn from_owner(owner: &OwnerKey) -> SafeResult<Self> {
        Ok(Self {
            key_id: owner.id.clone(),
            keys: owner.keys()?,
        })
    }
}

impl std::fmt::Debug for OwnedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedKey")
            .field("key_id", &self.key_id)
            .field("public", &self.keys.public_hex())
            .finish()
    }
}

/// Secret records keyed by event id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretSet {
    records: BTreeMap<String, SecretRecord>,
}

impl SecretSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `relay` served `event`. Returns `true` for a new id.
    pub fn observe(&mut self, event: &SignedEvent, key_id: &str, relay: &str) -> bool {
        match self.records.get_mut(&event.id) {
            Some(existing) => {
                existing.observe_on(relay);
                false
            }
            None => {
                self.records.insert(
                    event.id.clone(),
                    SecretRecord::observed(event.clone(), key_id, relay),
                );
                true
            }
        }
    }

    /// Fold another set into this one
    pub fn merge(&mut self, other: SecretSet) {
        for (id, record) in other.records {
            match self.records.get_mut(&id) {
                Some(existing) => {
                    let record_hydrated = record.is_hydrated();
                    existing.relays.extend(record.relays);
                    if !existing.is_hydrated() && record_hydrated {
                        existing.title = record.title;
                        existing.tags = record.tags;
                        existing.payload = record.payload;
                        existing.hydration_error = record.hydration_error;
                    }
                }
                None => {
                    self.records.insert(id, record);
                }
            }
        }
    }

    /// Number of distinct ids
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up by event id
    pub fn get(&self, id: &str) -> Option<&SecretRecord> {
        self.records.get(id)
    }

    fn event_matches(&self, event: &SignedEvent) -> bool {
        self.records
            .get(&event.id)
            .is_some_and(|existing| existing.event == *event)
    }

    /// Records newest first
    pub fn snapshot(&self) -> Vec<SecretRecord> {
        sorted(self.records.values().cloned().collect())
    }

    /// Consume into records, newest first
    pub fn into_records(self) -> Vec<SecretRecord> {
        sorted(self.records.into_values().collect())
    }

    /// Decrypt the outer layer of every unhydrated record. Records that are
    /// not secrets, or that no owned key can open, are removed. Returns the
    /// number removed.
    pub fn hydrate(&mut self, keys: &HashMap<String, Keys>, lenient: bool) -> usize {
        let before = self.records.len();
        self.records.retain(|id, record| {
            if record.is_hydrated() {
                return true;
            }
            let Some(owner) = keys.get(&record.key_id) else {
                debug!(event_id = %id, key_id = %record.key_id, "No key for record");
                return false;
            };
            match open_secret_event(&record.event, owner) {
                Ok(ParsedPayload::Secret(payload)) => {
                    record.hydrate(payload, lenient);
                    if let Some(error) = &record.hydration_error {
                        warn!(event_id = %id, %error, "Secret payload unreadable");
                    }
                    true
                }
                Ok(ParsedPayload::NotASecret) => {
                    debug!(event_id = %id, "Self-addressed message is not a secret");
                    false
                }
                Err(e) => {
                    debug!(event_id = %id, error = %e, "Discarding undecryptable record");
                    false
                }
            }
        });
        before - self.records.len()
    }
}

impl FromIterator<SecretRecord> for SecretSet {
    fn from_iter<I: IntoIterator<Item = SecretRecord>>(iter: I) -> Self {
        let mut set = SecretSet::new();
        for record in iter {
            set.merge(SecretSet {
                records: BTreeMap::from([(record.id.clone(), record)]),
            });
        }
        set
    }
}

fn sorted(mut records: Vec<SecretRecord>) -> Vec<SecretRecord> {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

/// How one relay's fetch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    /// Relay answered with this many candidate events
    Responded {
        /// Events returned before filtering
        events: usize,
    },
    /// Connection, timeout or protocol failure
    Failed(String),
}

/// Progress notifications during a fetch
#[derive(Debug, Clone)]
pub enum AggregateEvent {
    /// A relay finished; `snapshot` is the merged view so far
    RelayCompleted {
        /// Relay URL
        relay: String,
        /// What happened
        status: RelayStatus,
        /// Records observed so far (possibly unhydrated)
        snapshot: Vec<SecretRecord>,
    },
    /// Metadata hydration finished
    Hydrated {
        /// Final records
        snapshot: Vec<SecretRecord>,
    },
}

/// Settled result of a fetch
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    /// Hydrated records, newest first
    pub secrets: Vec<SecretRecord>,
    /// Relays that failed, with their error
    pub relay_errors: Vec<(String, String)>,
    /// Relays that answered
    pub responded: Vec<String>,
    /// Events dropped (spoofed, foreign, or not a secret)
    pub rejected: usize,
}

/// Why a fetched event is not a candidate secret
fn reject_reason(event: &SignedEvent, owners: &HashMap<String, &OwnedKey>) -> Option<&'static str> {
    if event.kind != Kind::ENCRYPTED_DIRECT_MESSAGE {
        return Some("wrong kind");
    }
    if !event.is_self_addressed() {
        return Some("not self-addressed");
    }
    if !owners.contains_key(&event.pubkey) {
        return Some("unknown author");
    }
    if !event.verify() {
        return Some("signature does not verify");
    }
    None
}

/// Fetches and merges secrets across the configured relays
#[derive(Debug, Clone)]
pub struct SecretAggregator {
    pool: RelayPool,
    relays: RelayConfig,
    limit: usize,
    lenient: bool,
}

impl SecretAggregator {
    /// Create an aggregator reading the relay list from `relays` on every
    /// fetch
    pub fn new(pool: RelayPool, relays: RelayConfig, config: &EngineConfig) -> Self {
        Self {
            pool,
            relays,
            limit: config.subscription_limit,
            lenient: config.lenient_version_detection,
        }
    }

    /// Subscription filter for self-addressed direct messages of `keys`
    pub fn filter_for(keys: &[OwnedKey], limit: usize) -> Filter {
        let publics: Vec<String> = keys.iter().map(|k| k.keys.public_hex()).collect();
        Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .authors(publics.clone())
            .p_tags(publics)
            .limit(limit)
    }

    /// Fetch every secret owned by `keys` from all relays concurrently.
    ///
    /// Progress is streamed through `progress` if given. Fails with
    /// [`SafeError::NoRelaysConfigured`] for an empty relay list and
    /// [`SafeError::AllRelaysFailed`] when no relay answered.
    pub async fn fetch(
        &self,
        keys: &[OwnedKey],
        progress: Option<&mpsc::UnboundedSender<AggregateEvent>>,
    ) -> SafeResult<AggregateResult> {
        let urls = self.relays.urls();
        if urls.is_empty() {
            return Err(SafeError::NoRelaysConfigured);
        }
        if keys.is_empty() {
            return Ok(AggregateResult::default());
        }

        let owners: HashMap<String, &OwnedKey> =
            keys.iter().map(|k| (k.keys.public_hex(), k)).collect();
        let filter = Self::filter_for(keys, self.limit);

        let mut set = SecretSet::new();
        let mut rejected = 0usize;
        let mut relay_errors = Vec::new();
        let mut responded = Vec::new();

        self.pool
            .fetch_progressive(&urls, &filter, |outcome| {
                let status = match &outcome.result {
                    Ok(events) => {
                        for event in events {
                            // Same id, same bytes: already verified
                            if set.event_matches(event) {
                                set.observe(event, "", &outcome.relay);
                                continue;
                            }
                            match reject_reason(event, &owners) {
                                None => {
                                    if let Some(owner) = owners.get(&event.pubkey) {
                                        set.observe(event, &owner.key_id, &outcome.relay);
                                    }
                                }
                                Some(reason) => {
                                    warn!(relay = %outcome.relay, event_id = %event.id, reason, "Rejected event");
                                    rejected += 1;
                                }
                            }
                        }
                        responded.push(outcome.relay.clone());
                        RelayStatus::Responded {
                            events: events.len(),
                        }
                    }
                    Err(e) => {
                        relay_errors.push((outcome.relay.clone(), e.to_string()));
                        RelayStatus::Failed(e.to_string())
                    }
                };

                if let Some(tx) = progress {
                    let _ = tx.send(AggregateEvent::RelayCompleted {
                        relay: outcome.relay.clone(),
                        status,
                        snapshot: set.snapshot(),
                    });
                }
            })
            .await;

        if responded.is_empty() {
            return Err(SafeError::AllRelaysFailed(
                relay_errors
                    .iter()
                    .map(|(relay, error)| format!("{}: {}", relay, error))
                    .collect(),
            ));
        }

        let key_map: HashMap<String, Keys> = keys
            .iter()
            .map(|k| (k.key_id.clone(), k.keys.clone()))
            .collect();
        let lenient = self.lenient;
        let (set, dropped) = tokio::task::spawn_blocking(move || {
            let mut set = set;
            let dropped = set.hydrate(&key_map, lenient);
            (set, dropped)
        })
        .await
        .map_err(|e| SafeError::Crypto(format!("hydration task failed: {}", e)))?;

        let secrets = set.into_records();
        if let Some(tx) = progress {
            let _ = tx.send(AggregateEvent::Hydrated {
                snapshot: secrets.clone(),
            });
        }

        info!(
            secrets = secrets.len(),
            responded = responded.len(),
            failed = relay_errors.len(),
            rejected = rejected + dropped,
            "Aggregation complete"
        );

        Ok(AggregateResult {
            secrets,
            relay_errors,
            responded,
            rejected: rejected + dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionScheme;
    use crate::event::{build_event, encrypted_direct_message};
    use crate::secret::encode_secret_event;
    use crate::transport::memory::MemoryNetwork;
    use std::sync::Arc;

    fn owned(keys: &Keys) -> OwnedKey {
        OwnedKey {
            key_id: "k1".into(),
            keys: keys.clone(),
        }
    }

    fn setup(urls: &[&str]) -> (MemoryNetwork, SecretAggregator) {
        let network = MemoryNetwork::new();
        for url in urls {
            network.add_relay(url);
        }
        let config = EngineConfig {
            fetch_timeout_secs: 1,
            ..Default::default()
        };
        let pool = RelayPool::new(Arc::new(network.clone()), &config);
        let relays = RelayConfig::new(urls.iter().copied()).unwrap();
        (network.clone(), SecretAggregator::new(pool, relays, &config))
    }

    fn secret(keys: &Keys, title: &str) -> SignedEvent {
        encode_secret_event(keys, title, "value", vec![], EncryptionScheme::Current).unwrap()
    }

    #[test]
    fn test_observe_is_order_independent() {
        let keys = Keys::generate();
        let event = secret(&keys, "t");
        let relays = ["wss://a", "wss://b", "wss://c"];

        let mut forward = SecretSet::new();
        for relay in relays {
            forward.observe(&event, "k1", relay);
        }
        let mut backward = SecretSet::new();
        for relay in relays.iter().rev() {
            backward.observe(&event, "k1", relay);
        }

        assert_eq!(forward.len(), 1);
        assert_eq!(forward, backward);
        assert_eq!(forward.get(&event.id).unwrap().relays.len(), 3);
    }

    #[test]
    fn test_merge_unions_membership() {
        let keys = Keys::generate();
        let event = secret(&keys, "t");
        let mut left = SecretSet::new();
        left.observe(&event, "k1", "wss://a");
        let mut right = SecretSet::new();
        right.observe(&event, "k1", "wss://b");

        left.merge(right);
        let record = left.get(&event.id).unwrap();
        assert_eq!(
            record.relays.iter().cloned().collect::<Vec<_>>(),
            vec!["wss://a", "wss://b"]
        );
    }

    #[tokio::test]
    async fn test_fetch_dedupes_across_relays() {
        let (network, aggregator) = setup(&["wss://a.test", "wss://b.test"]);
        let keys = Keys::generate();
        let event = secret(&keys, "Email");
        for url in ["wss://a.test", "wss://b.test"] {
            network.relay(url).unwrap().insert_raw(event.clone());
        }

        let result = aggregator.fetch(&[owned(&keys)], None).await.unwrap();
        assert_eq!(result.secrets.len(), 1);
        assert_eq!(result.secrets[0].relays.len(), 2);
        assert_eq!(result.secrets[0].title, "Email");
        assert_eq!(result.rejected, 0);
    }

    #[tokio::test]
    async fn test_fetch_partial_failure_is_not_fatal() {
        let (network, aggregator) = setup(&["wss://a.test", "wss://b.test"]);
        let keys = Keys::generate();
        network.relay("wss://a.test").unwrap().insert_raw(secret(&keys, "x"));
        network.relay("wss://b.test").unwrap().set_online(false);

        let result = aggregator.fetch(&[owned(&keys)], None).await.unwrap();
        assert_eq!(result.secrets.len(), 1);
        assert_eq!(result.responded, vec!["wss://a.test"]);
        assert_eq!(result.relay_errors.len(), 1);
        assert_eq!(result.relay_errors[0].0, "wss://b.test");
    }

    #[tokio::test]
    async fn test_no_relays_and_all_failed_are_distinct() {
        let (_, empty) = setup(&[]);
        let keys = Keys::generate();
        assert!(matches!(
            empty.fetch(&[owned(&keys)], None).await,
            Err(SafeError::NoRelaysConfigured)
        ));

        let (network, aggregator) = setup(&["wss://a.test"]);
        network.set_all_online(false);
        match aggregator.fetch(&[owned(&keys)], None).await {
            Err(SafeError::AllRelaysFailed(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].starts_with("wss://a.test"));
            }
            other => panic!("unexpected {:?}", other.map(|r| r.secrets.len())),
        }
    }

    #[tokio::test]
    async fn test_spoofed_and_foreign_records_rejected() {
        let (network, aggregator) = setup(&["wss://a.test"]);
        let relay = network.relay("wss://a.test").unwrap();
        let keys = Keys::generate();

        // Content swapped after signing
        let mut spoofed = secret(&keys, "real");
        spoofed.content = secret(&keys, "fake").content;
        relay.insert_raw(spoofed);

        // Self-addressed but not a secret payload
        let note = EncryptionScheme::Current
            .encrypt("just a note", keys.secret_key(), &keys.public_key())
            .unwrap();
        relay.insert_raw(encrypted_direct_message(&keys, &keys.public_key(), note).unwrap());

        // Addressed to someone else
        let other = Keys::generate();
        relay.insert_raw(encrypted_direct_message(&keys, &other.public_key(), "ct").unwrap());

        let result = aggregator.fetch(&[owned(&keys)], None).await.unwrap();
        assert!(result.secrets.is_empty());
        assert_eq!(result.rejected, 2);
    }

    #[tokio::test]
    async fn test_wrong_kind_never_matches() {
        let (network, aggregator) = setup(&["wss://a.test"]);
        let keys = Keys::generate();
        let note = build_event(
            Kind(1),
            &keys.public_key(),
            vec![vec!["p".into(), keys.public_hex()]],
            "hello",
        )
        .sign(&keys)
        .unwrap();
        network.relay("wss://a.test").unwrap().insert_raw(note);

        let result = aggregator.fetch(&[owned(&keys)], None).await.unwrap();
        assert!(result.secrets.is_empty());
    }

    #[tokio::test]
    async fn test_progress_events_stream() {
        let (network, aggregator) = setup(&["wss://a.test", "wss://b.test"]);
        let keys = Keys::generate();
        network.relay("wss://a.test").unwrap().insert_raw(secret(&keys, "x"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        aggregator.fetch(&[owned(&keys)], Some(&tx)).await.unwrap();
        drop(tx);

        let mut completed = 0;
        let mut hydrated = None;
        while let Some(event) = rx.recv().await {
            match event {
                AggregateEvent::RelayCompleted { snapshot, .. } => {
                    completed += 1;
                    assert!(snapshot.iter().all(|r| r.title.starts_with("Secret ")));
                }
                AggregateEvent::Hydrated { snapshot } => hydrated = Some(snapshot),
            }
        }
        assert_eq!(completed, 2);
        assert_eq!(hydrated.unwrap()[0].title, "x");
    }

    #[tokio::test]
    async fn test_results_sorted_newest_first() {
        let (network, aggregator) = setup(&["wss://a.test"]);
        let keys = Keys::generate();
        let relay = network.relay("wss://a.test").unwrap();
        for (title, at) in [("old", 1_000u64), ("new", 2_000)] {
            let payload = crate::secret::SecretPayload::seal(
                &keys,
                title,
                "v",
                vec![],
                EncryptionScheme::Current,
            )
            .unwrap();
            let content =
                crate::secret::encrypt_outer(&keys, &payload, EncryptionScheme::Current).unwrap();
            let event = build_event(
                Kind::ENCRYPTED_DIRECT_MESSAGE,
                &keys.public_key(),
                vec![vec!["p".into(), keys.public_hex()]],
                content,
            )
            .with_created_at(at)
            .sign(&keys)
            .unwrap();
            relay.insert_raw(event);
        }

        let result = aggregator.fetch(&[owned(&keys)], None).await.unwrap();
        let titles: Vec<_> = result.secrets.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["new", "old"]);
    }
}
