//! In-process relays for tests and offline demos
//!
//! [`MemoryNetwork`] is a [`RelayConnector`] over a set of named
//! [`MemoryRelayState`]s. Each relay can be taken offline, made to reject
//! publishes, or slowed down, which is enough to exercise partial failure,
//! timeouts, and replication gaps without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{PublishAck, RelayConnector, RelayTransport};
use crate::error::{SafeError, SafeResult};
use crate::event::SignedEvent;
use crate::filter::Filter;

/// Shared state of one in-memory relay
#[derive(Debug)]
pub struct MemoryRelayState {
    url: String,
    events: RwLock<Vec<SignedEvent>>,
    online: AtomicBool,
    accept_publish: AtomicBool,
    delay: RwLock<Duration>,
    fetches: AtomicUsize,
    publishes: AtomicUsize,
}

impl MemoryRelayState {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            events: RwLock::new(Vec::new()),
            online: AtomicBool::new(true),
            accept_publish: AtomicBool::new(true),
            delay: RwLock::new(Duration::ZERO),
            fetches: AtomicUsize::new(0),
            publishes: AtomicUsize::new(0),
        }
    }

    /// Relay URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Bring the relay up or down
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Whether the relay accepts connections
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Accept or reject (with `OK false`) future publishes
    pub fn set_accept_publish(&self, accept: bool) {
        self.accept_publish.store(accept, Ordering::SeqCst);
    }

    /// Delay applied to every fetch and publish
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    /// Store an event without any validation
    pub fn insert_raw(&self, event: SignedEvent) {
        let mut events = self.events.write();
        if !events.iter().any(|e| e.id == event.id) {
            events.push(event);
        }
    }

    /// Whether an event with `id` is stored
    pub fn has_event(&self, id: &str) -> bool {
        self.events.read().iter().any(|e| e.id == id)
    }

    /// Stored event by id
    pub fn event(&self, id: &str) -> Option<SignedEvent> {
        self.events.read().iter().find(|e| e.id == id).cloned()
    }

    /// Snapshot of every stored event
    pub fn events(&self) -> Vec<SignedEvent> {
        self.events.read().clone()
    }

    /// Number of fetches served
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of publishes received
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> SafeResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SafeError::transport(&self.url, "connection refused"))
        }
    }

    /// Sleep for the configured delay, failing if it exceeds `limit`
    async fn wait(&self, limit: Duration, op: &str) -> SafeResult<()> {
        let delay = *self.delay.read();
        if delay > limit {
            tokio::time::sleep(limit).await;
            return Err(SafeError::Timeout(format!("{} {}", op, self.url)));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// A set of in-memory relays addressable by URL
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    relays: Arc<RwLock<HashMap<String, Arc<MemoryRelayState>>>>,
}

impl MemoryNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or return the existing) relay at `url`
    pub fn add_relay(&self, url: &str) -> Arc<MemoryRelayState> {
        self.relays
            .write()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemoryRelayState::new(url)))
            .clone()
    }

    /// Relay at `url`, if any
    pub fn relay(&self, url: &str) -> Option<Arc<MemoryRelayState>> {
        self.relays.read().get(url).cloned()
    }

    /// Bring every relay up or down
    pub fn set_all_online(&self, online: bool) {
        for relay in self.relays.read().values() {
            relay.set_online(online);
        }
    }
}

#[async_trait]
impl RelayConnector for MemoryNetwork {
    async fn connect(&self, url: &str, _timeout: Duration) -> SafeResult<Arc<dyn RelayTransport>> {
        let state = self
            .relay(url)
            .ok_or_else(|| SafeError::transport(url, "unknown host"))?;
        state.check_online()?;
        Ok(Arc::new(MemoryRelay { state }))
    }
}

/// Connection handle to a [`MemoryRelayState`]
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    state: Arc<MemoryRelayState>,
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    fn url(&self) -> &str {
        self.state.url()
    }

    async fn fetch(&self, filter: &Filter, timeout: Duration) -> SafeResult<Vec<SignedEvent>> {
        self.state.check_online()?;
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        self.state.wait(timeout, "fetch from").await?;
        self.state.check_online()?;

        let mut matched: Vec<SignedEvent> = self
            .state
            .events
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn publish(&self, event: &SignedEvent, timeout: Duration) -> SafeResult<PublishAck> {
        self.state.check_online()?;
        self.state.publishes.fetch_add(1, Ordering::SeqCst);
        self.state.wait(timeout, "publish to").await?;

        let reject = |message: &str| PublishAck {
            event_id: event.id.clone(),
            accepted: false,
            message: message.to_string(),
        };

        if !self.state.accept_publish.load(Ordering::SeqCst) {
            return Ok(reject("blocked: relay is read-only"));
        }
        if let Err(e) = event.verify_strict() {
            return Ok(reject(&format!("invalid: {}", e)));
        }

        let duplicate = self.state.has_event(&event.id);
        self.state.insert_raw(event.clone());
        Ok(PublishAck {
            event_id: event.id.clone(),
            accepted: true,
            message: if duplicate {
                "duplicate: already have this event".to_string()
            } else {
                String::new()
            },
        })
    }

    async fn close(&self) -> SafeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{encrypted_direct_message, Kind};
    use crate::keys::Keys;

    const URL: &str = "wss://relay.test";

    async fn connect(network: &MemoryNetwork) -> Arc<dyn RelayTransport> {
        network.connect(URL, Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let network = MemoryNetwork::new();
        network.add_relay(URL);
        let relay = connect(&network).await;

        let keys = Keys::generate();
        let event = encrypted_direct_message(&keys, &keys.public_key(), "ct").unwrap();

        let ack = relay.publish(&event, Duration::from_secs(1)).await.unwrap();
        assert!(ack.accepted);

        let filter = Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .authors(vec![keys.public_hex()]);
        let fetched = relay.fetch(&filter, Duration::from_secs(1)).await.unwrap();
        assert_eq!(fetched, vec![event]);
    }

    #[tokio::test]
    async fn test_duplicate_publish_stored_once() {
        let network = MemoryNetwork::new();
        let state = network.add_relay(URL);
        let relay = connect(&network).await;

        let keys = Keys::generate();
        let event = encrypted_direct_message(&keys, &keys.public_key(), "ct").unwrap();
        relay.publish(&event, Duration::from_secs(1)).await.unwrap();
        let ack = relay.publish(&event, Duration::from_secs(1)).await.unwrap();

        assert!(ack.accepted);
        assert!(ack.message.starts_with("duplicate"));
        assert_eq!(state.events().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_signature() {
        let network = MemoryNetwork::new();
        network.add_relay(URL);
        let relay = connect(&network).await;

        let keys = Keys::generate();
        let mut event = encrypted_direct_message(&keys, &keys.public_key(), "ct").unwrap();
        event.content = "tampered".into();

        let ack = relay.publish(&event, Duration::from_secs(1)).await.unwrap();
        assert!(!ack.accepted);
        assert!(ack.message.starts_with("invalid"));
    }

    #[tokio::test]
    async fn test_offline_relay_refuses() {
        let network = MemoryNetwork::new();
        let state = network.add_relay(URL);
        state.set_online(false);

        let result = network.connect(URL, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SafeError::Transport { .. })));
        assert!(network
            .connect("wss://nowhere", Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_relay_times_out() {
        let network = MemoryNetwork::new();
        let state = network.add_relay(URL);
        state.set_delay(Duration::from_secs(30));
        let relay = connect(&network).await;

        let result = relay.fetch(&Filter::new(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SafeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_limit_returns_newest() {
        let network = MemoryNetwork::new();
        let state = network.add_relay(URL);
        let relay = connect(&network).await;

        let keys = Keys::generate();
        for ts in [10u64, 30, 20] {
            let event = crate::event::build_event(
                Kind::ENCRYPTED_DIRECT_MESSAGE,
                &keys.public_key(),
                vec![],
                format!("{}", ts),
            )
            .with_created_at(ts)
            .sign(&keys)
            .unwrap();
            state.insert_raw(event);
        }

        let fetched = relay
            .fetch(&Filter::new().limit(2), Duration::from_secs(1))
            .await
            .unwrap();
        let stamps: Vec<u64> = fetched.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![30, 20]);
    }
}
