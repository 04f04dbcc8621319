//! Engine and relay configuration
//!
//! [`EngineConfig`] is plain data with defaults, persisted as JSON in the
//! settings table. [`RelayConfig`] is the read-through relay list every
//! component receives by clone; changing it never re-subscribes anything,
//! callers re-fetch explicitly.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SafeError, SafeResult};
use crate::storage::{Storage, StorageTable, SETTINGS_CONFIG, SETTINGS_RELAYS};

/// Relays used when none are configured
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Lower bound on PBKDF2 iterations accepted from configuration
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Upper bound on PBKDF2 iterations, from configuration or a stored vault
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

/// Backoff waits between retries of a queued write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u64>", into = "Vec<u64>")]
pub struct RetrySchedule {
    steps: Vec<u64>,
}

impl RetrySchedule {
    /// Build from second intervals. Steps are sorted so waits never shrink.
    pub fn from_secs(mut steps: Vec<u64>) -> Self {
        steps.sort_unstable();
        if steps.is_empty() {
            steps.push(0);
        }
        Self { steps }
    }

    /// Wait before attempt number `retry_count + 1`, capped at the last step
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let idx = (retry_count as usize).min(self.steps.len() - 1);
        Duration::from_secs(self.steps[idx])
    }

    /// Configured steps in seconds
    pub fn steps(&self) -> &[u64] {
        &self.steps
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_secs(vec![5, 15, 30, 60, 120])
    }
}

impl From<Vec<u64>> for RetrySchedule {
    fn from(steps: Vec<u64>) -> Self {
        Self::from_secs(steps)
    }
}

impl From<RetrySchedule> for Vec<u64> {
    fn from(schedule: RetrySchedule) -> Self {
        schedule.steps
    }
}

/// Tunables for timeouts, retry policy and vault hardening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-relay fetch bound
    pub fetch_timeout_secs: u64,
    /// Per-relay publish bound
    pub publish_timeout_secs: u64,
    /// Per-relay connect bound
    pub connect_timeout_secs: u64,
    /// `limit` sent in subscription filters
    pub subscription_limit: usize,
    /// Queue backoff schedule
    pub retry_schedule: RetrySchedule,
    /// Attempts after which a queued write is exhausted
    pub max_retries: u32,
    /// How often the queue scheduler wakes up
    pub queue_tick_secs: u64,
    /// How often the background sync pass runs
    pub sync_interval_secs: u64,
    /// Consecutive wrong PINs before the vault is wiped
    pub max_pin_attempts: u32,
    /// PBKDF2-HMAC-SHA256 rounds for the vault key
    pub pbkdf2_iterations: u32,
    /// Accept secret payloads without an explicit version tag by sniffing
    /// the ciphertext shape
    pub lenient_version_detection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 5,
            publish_timeout_secs: 10,
            connect_timeout_secs: 5,
            subscription_limit: 100,
            retry_schedule: RetrySchedule::default(),
            max_retries: 5,
            queue_tick_secs: 5,
            sync_interval_secs: 300,
            max_pin_attempts: 5,
            pbkdf2_iterations: 310_000,
            lenient_version_detection: false,
        }
    }
}

impl EngineConfig {
    /// Fetch timeout
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Publish timeout
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Queue scheduler tick
    pub fn queue_tick(&self) -> Duration {
        Duration::from_secs(self.queue_tick_secs.max(1))
    }

    /// Background sync interval
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// Iteration count clamped to the accepted range
    pub fn effective_pbkdf2_iterations(&self) -> u32 {
        self.pbkdf2_iterations
            .clamp(MIN_PBKDF2_ITERATIONS, MAX_PBKDF2_ITERATIONS)
    }

    /// Load from settings, falling back to defaults
    pub fn load(storage: &Storage) -> SafeResult<Self> {
        match storage.get(StorageTable::Settings, SETTINGS_CONFIG)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Self::default()),
        }
    }

    /// Persist to settings
    pub fn save(&self, storage: &Storage) -> SafeResult<()> {
        storage.put(
            StorageTable::Settings,
            SETTINGS_CONFIG,
            &serde_json::to_vec(self)?,
        )
    }
}

/// Validate and normalise a relay URL.
///
/// Trims whitespace and trailing slashes; only `ws://` and `wss://` are
/// accepted.
pub fn normalize_relay_url(raw: &str) -> SafeResult<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed =
        url::Url::parse(trimmed).map_err(|e| SafeError::InvalidRelayUrl(format!("{}: {}", raw, e)))?;

    if !matches!(parsed.scheme(), "ws" | "wss") || parsed.host_str().is_none() {
        return Err(SafeError::InvalidRelayUrl(raw.to_string()));
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Shared, injectable relay list
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    urls: Arc<RwLock<Vec<String>>>,
}

impl RelayConfig {
    /// Build from URLs, normalising and deduplicating
    pub fn new<I, S>(urls: I) -> SafeResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let config = Self::default();
        config.replace(urls)?;
        Ok(config)
    }

    /// [`DEFAULT_RELAYS`]
    pub fn defaults() -> Self {
        Self {
            urls: Arc::new(RwLock::new(
                DEFAULT_RELAYS.iter().map(|u| u.to_string()).collect(),
            )),
        }
    }

    /// Snapshot of the current list
    pub fn urls(&self) -> Vec<String> {
        self.urls.read().clone()
    }

    /// Number of relays
    pub fn len(&self) -> usize {
        self.urls.read().len()
    }

    /// No relays configured
    pub fn is_empty(&self) -> bool {
        self.urls.read().is_empty()
    }

    /// Whether `url` (after normalisation) is configured
    pub fn contains(&self, url: &str) -> bool {
        normalize_relay_url(url)
            .map(|url| self.urls.read().contains(&url))
            .unwrap_or(false)
    }

    /// Add a relay. Returns `false` if it was already present.
    pub fn add(&self, url: &str) -> SafeResult<bool> {
        let url = normalize_relay_url(url)?;
        let mut urls = self.urls.write();
        if urls.contains(&url) {
            return Ok(false);
        }
        debug!(relay = %url, "Relay added");
        urls.push(url);
        Ok(true)
    }

    /// Remove a relay. Returns `false` if it was not present.
    pub fn remove(&self, url: &str) -> bool {
        let target = normalize_relay_url(url).unwrap_or_else(|_| url.to_string());
        let mut urls = self.urls.write();
        let before = urls.len();
        urls.retain(|u| *u != target);
        before != urls.len()
    }

    /// Replace the whole list
    pub fn replace<I, S>(&self, urls: I) -> SafeResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for url in urls {
            let url = normalize_relay_url(url.as_ref())?;
            if !normalized.contains(&url) {
                normalized.push(url);
            }
        }
        *self.urls.write() = normalized;
        Ok(())
    }

    /// Load the persisted list, or [`DEFAULT_RELAYS`] if none was saved
    pub fn load(storage: &Storage) -> SafeResult<Self> {
        match storage.get(StorageTable::Settings, SETTINGS_RELAYS)? {
            Some(bytes) => {
                let urls: Vec<String> = serde_json::from_slice(&bytes)?;
                Self::new(urls)
            }
            None => Ok(Self::defaults()),
        }
    }

    /// Persist the current list
    pub fn save(&self, storage: &Storage) -> SafeResult<()> {
        storage.put(
            StorageTable::Settings,
            SETTINGS_RELAYS,
            &serde_json::to_vec(&self.urls())?,
        )
    }
}
