//! Concurrent fan-out over many relays
//!
//! ```text
//!                  ┌──────────────┐
//!   fetch/publish  │  RelayPool   │  connection cache (url → transport)
//!   ─────────────► │              │  per-op timeout + CancellationToken
//!                  └──────┬───────┘
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!     RelayTransport RelayTransport RelayTransport
//! ```
//!
//! Per-relay failures never abort sibling operations. Every call returns
//! one outcome per relay and higher layers decide what a partial result
//! means.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{SafeError, SafeResult};
use crate::event::SignedEvent;
use crate::filter::Filter;
use crate::transport::{PublishAck, RelayConnector, RelayTransport};

/// Result of one relay operation
#[derive(Debug)]
pub struct RelayOutcome<T> {
    /// Relay URL
    pub relay: String,
    /// What happened
    pub result: SafeResult<T>,
}

/// Per-relay results of publishing one event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Relays that stored the event
    pub accepted: Vec<String>,
    /// Relays that answered `OK false`, with their reason
    pub rejected: Vec<(String, String)>,
    /// Relays that could not be reached or timed out
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    /// At least one relay stored the event
    pub fn any_accepted(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Timeouts the pool applies to each operation
#[derive(Debug, Clone, Copy)]
pub struct PoolTimeouts {
    /// Connect bound
    pub connect: Duration,
    /// Fetch bound
    pub fetch: Duration,
    /// Publish bound
    pub publish: Duration,
}

impl From<&EngineConfig> for PoolTimeouts {
    fn from(config: &EngineConfig) -> Self {
        Self {
            connect: config.connect_timeout(),
            fetch: config.fetch_timeout(),
            publish: config.publish_timeout(),
        }
    }
}

/// Shared, cloneable pool of relay connections
#[derive(Clone)]
pub struct RelayPool {
    connector: Arc<dyn RelayConnector>,
    connections: Arc<RwLock<HashMap<String, Arc<dyn RelayTransport>>>>,
    timeouts: PoolTimeouts,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("connected", &self.connections.read().len())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl RelayPool {
    /// Create a pool that opens connections through `connector`
    pub fn new(connector: Arc<dyn RelayConnector>, config: &EngineConfig) -> Self {
        Self {
            connector,
            connections: Arc::new(RwLock::new(HashMap::new())),
            timeouts: PoolTimeouts::from(config),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Timeouts in effect
    pub fn timeouts(&self) -> PoolTimeouts {
        self.timeouts
    }

    /// URLs with a cached open connection
    pub fn connected_relays(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.connections.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Abort every in-flight operation with [`SafeError::Cancelled`]
    pub fn cancel_all(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Close and forget every cached connection
    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<dyn RelayTransport>> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        for connection in connections {
            if let Err(e) = connection.close().await {
                debug!(relay = %connection.url(), error = %e, "Close failed");
            }
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    async fn connection(&self, url: &str) -> SafeResult<Arc<dyn RelayTransport>> {
        let cached = self.connections.read().get(url).cloned();
        if let Some(existing) = cached {
            return Ok(existing);
        }

        let connection = self.connector.connect(url, self.timeouts.connect).await?;
        self.connections
            .write()
            .insert(url.to_string(), connection.clone());
        Ok(connection)
    }

    fn evict(&self, url: &str) {
        self.connections.write().remove(url);
    }

    /// Run `op` against `url` under the pool's cancellation token, evicting
    /// the cached connection on transport-level failure.
    async fn with_connection<T, F, Fut>(&self, url: &str, op: F) -> SafeResult<T>
    where
        F: FnOnce(Arc<dyn RelayTransport>) -> Fut,
        Fut: std::future::Future<Output = SafeResult<T>>,
    {
        let token = self.token();
        let work = async {
            let connection = self.connection(url).await?;
            op(connection).await
        };

        let result = tokio::select! {
            _ = token.cancelled() => Err(SafeError::Cancelled),
            result = work => result,
        };

        if let Err(e) = &result {
            if matches!(
                e,
                SafeError::Transport { .. } | SafeError::Timeout(_) | SafeError::Cancelled
            ) {
                self.evict(url);
            }
        }
        result
    }

    /// Fetch from one relay
    pub async fn fetch_from(&self, url: &str, filter: &Filter) -> SafeResult<Vec<SignedEvent>> {
        let timeout = self.timeouts.fetch;
        let result = self
            .with_connection(url, |c| async move { c.fetch(filter, timeout).await })
            .await;
        match &result {
            Ok(events) => debug!(relay = %url, count = events.len(), "Fetched"),
            Err(e) => warn!(relay = %url, error = %e, "Fetch failed"),
        }
        result
    }

    /// Fetch from every relay concurrently, calling `on_outcome` as each
    /// finishes (fastest first). Returns every outcome.
    pub async fn fetch_progressive<F>(
        &self,
        urls: &[String],
        filter: &Filter,
        mut on_outcome: F,
    ) -> Vec<RelayOutcome<Vec<SignedEvent>>>
    where
        F: FnMut(&RelayOutcome<Vec<SignedEvent>>),
    {
        let mut pending: FuturesUnordered<_> = urls
            .iter()
            .map(|url| async move {
                RelayOutcome {
                    relay: url.clone(),
                    result: self.fetch_from(url, filter).await,
                }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(urls.len());
        while let Some(outcome) = pending.next().await {
            on_outcome(&outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Fetch from every relay concurrently
    pub async fn fetch_all(
        &self,
        urls: &[String],
        filter: &Filter,
    ) -> Vec<RelayOutcome<Vec<SignedEvent>>> {
        self.fetch_progressive(urls, filter, |_| {}).await
    }

    /// Publish to one relay
    pub async fn publish_to(&self, url: &str, event: &SignedEvent) -> SafeResult<PublishAck> {
        let timeout = self.timeouts.publish;
        let result = self
            .with_connection(url, |c| async move { c.publish(event, timeout).await })
            .await;
        match &result {
            Ok(ack) if ack.accepted => {
                debug!(relay = %url, event_id = %event.id, "Published")
            }
            Ok(ack) => {
                warn!(relay = %url, event_id = %event.id, reason = %ack.message, "Publish rejected")
            }
            Err(e) => warn!(relay = %url, event_id = %event.id, error = %e, "Publish failed"),
        }
        result
    }

    /// Publish to every relay concurrently
    pub async fn publish_all(&self, urls: &[String], event: &SignedEvent) -> PublishReport {
        let outcomes = join_all(urls.iter().map(|url| async move {
            RelayOutcome {
                relay: url.clone(),
                result: self.publish_to(url, event).await,
            }
        }))
        .await;

        let mut report = PublishReport::default();
        for outcome in outcomes {
            match outcome.result {
                Ok(ack) if ack.accepted => report.accepted.push(outcome.relay),
                Ok(ack) => report.rejected.push((outcome.relay, ack.message)),
                Err(e) => report.failed.push((outcome.relay, e.to_string())),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::encrypted_direct_message;
    use crate::keys::Keys;
    use crate::transport::memory::MemoryNetwork;

    fn pool_over(network: &MemoryNetwork) -> RelayPool {
        let config = EngineConfig {
            fetch_timeout_secs: 1,
            publish_timeout_secs: 1,
            ..Default::default()
        };
        RelayPool::new(Arc::new(network.clone()), &config)
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn test_publish_all_partial_failure() {
        let network = MemoryNetwork::new();
        network.add_relay("wss://up.test");
        network.add_relay("wss://down.test").set_online(false);
        network.add_relay("wss://ro.test").set_accept_publish(false);
        let pool = pool_over(&network);

        let keys = Keys::generate();
        let event = encrypted_direct_message(&keys, &keys.public_key(), "ct").unwrap();
        let report = pool
            .publish_all(&urls(&["wss://up.test", "wss://down.test", "wss://ro.test"]), &event)
            .await;

        assert_eq!(report.accepted, vec!["wss://up.test"]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.any_accepted());
    }

    #[tokio::test]
    async fn test_fetch_progressive_reports_each_relay() {
        let network = MemoryNetwork::new();
        let keys = Keys::generate();
        let event = encrypted_direct_message(&keys, &keys.public_key(), "ct").unwrap();
        network.add_relay("wss://a.test").insert_raw(event.clone());
        network.add_relay("wss://b.test").set_online(false);
        let pool = pool_over(&network);

        let mut seen = Vec::new();
        let outcomes = pool
            .fetch_progressive(
                &urls(&["wss://a.test", "wss://b.test"]),
                &Filter::new(),
                |o| seen.push(o.relay.clone()),
            )
            .await;

        assert_eq!(seen.len(), 2);
        let ok: Vec<_> = outcomes.iter().filter(|o| o.result.is_ok()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].relay, "wss://a.test");
    }

    #[tokio::test]
    async fn test_connections_are_cached_and_evicted() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("wss://a.test");
        let pool = pool_over(&network);

        pool.fetch_from("wss://a.test", &Filter::new()).await.unwrap();
        assert_eq!(pool.connected_relays(), vec!["wss://a.test"]);

        relay.set_online(false);
        assert!(pool.fetch_from("wss://a.test", &Filter::new()).await.is_err());
        assert!(pool.connected_relays().is_empty());

        relay.set_online(true);
        pool.fetch_from("wss://a.test", &Filter::new()).await.unwrap();
        pool.disconnect_all().await;
        assert!(pool.connected_relays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_aborts_in_flight() {
        let network = MemoryNetwork::new();
        network
            .add_relay("wss://slow.test")
            .set_delay(Duration::from_millis(900));
        let pool = pool_over(&network);

        let canceller = pool.clone();
        let handle = tokio::spawn(async move {
            canceller.fetch_from("wss://slow.test", &Filter::new()).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.cancel_all();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SafeError::Cancelled)));
    }
}
