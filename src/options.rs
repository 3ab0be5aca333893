use crate::env::{
    env_or, LOG_SINK_COMMIT_TIMEOUT_ENV, LOG_SINK_INCLUDE_SCOPES_ENV, LOG_SINK_SHUTDOWN_TIMEOUT_ENV,
    LOG_SINK_STORAGE_TARGET_ENV, LOG_SINK_SYNC_INTERVAL_ENV,
};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_STORAGE_TARGET: &str = "memory";
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Error returned when options fail validation. Invalid values are
/// rejected, never clamped.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sync interval must be greater than 1 second, got {0}")]
    SyncIntervalTooShort(u64),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("storage target must not be empty")]
    MissingStorageTarget,
}

/// Flush period in whole seconds. Always greater than 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u64")]
pub struct SyncInterval(u64);

impl SyncInterval {
    pub fn new(secs: u64) -> Result<Self, ConfigError> {
        if secs > 1 {
            Ok(SyncInterval(secs))
        } else {
            Err(ConfigError::SyncIntervalTooShort(secs))
        }
    }

    pub fn secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for SyncInterval {
    fn default() -> Self {
        SyncInterval(DEFAULT_SYNC_INTERVAL_SECS)
    }
}

impl TryFrom<u64> for SyncInterval {
    type Error = ConfigError;

    fn try_from(secs: u64) -> Result<Self, Self::Error> {
        SyncInterval::new(secs)
    }
}

/// Runtime configuration of the sink.
///
/// **Fields**
/// - `include_scopes`: capture the active scope stack into each record.
/// - `sync_interval`: period between flush cycles.
/// - `storage_target`: key resolved by the storage registry, either a bare
///   scheme (`memory`) or a DSN whose scheme selects the backend.
/// - `commit_timeout`: deadline applied to one storage commit.
/// - `shutdown_timeout`: deadline for the flush worker to finish its
///   in-flight cycle when stopping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SinkOptions {
    pub include_scopes: bool,
    pub sync_interval: SyncInterval,
    pub storage_target: String,
    #[serde(with = "secs")]
    pub commit_timeout: Duration,
    #[serde(with = "secs")]
    pub shutdown_timeout: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            include_scopes: false,
            sync_interval: SyncInterval::default(),
            storage_target: DEFAULT_STORAGE_TARGET.to_string(),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl SinkOptions {
    /// Build options from `LOG_SINK_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = SinkOptions::default();
        let include_scopes = parse_bool(
            LOG_SINK_INCLUDE_SCOPES_ENV,
            &env_or(LOG_SINK_INCLUDE_SCOPES_ENV, "false"),
        )?;
        let sync_interval = SyncInterval::new(parse_u64(
            LOG_SINK_SYNC_INTERVAL_ENV,
            &env_or(LOG_SINK_SYNC_INTERVAL_ENV, &DEFAULT_SYNC_INTERVAL_SECS.to_string()),
        )?)?;
        let commit_timeout = Duration::from_secs(parse_u64(
            LOG_SINK_COMMIT_TIMEOUT_ENV,
            &env_or(LOG_SINK_COMMIT_TIMEOUT_ENV, &defaults.commit_timeout.as_secs().to_string()),
        )?);
        let shutdown_timeout = Duration::from_secs(parse_u64(
            LOG_SINK_SHUTDOWN_TIMEOUT_ENV,
            &env_or(LOG_SINK_SHUTDOWN_TIMEOUT_ENV, &defaults.shutdown_timeout.as_secs().to_string()),
        )?);

        SinkOptions {
            include_scopes,
            sync_interval,
            storage_target: env_or(LOG_SINK_STORAGE_TARGET_ENV, DEFAULT_STORAGE_TARGET),
            commit_timeout,
            shutdown_timeout,
        }
        .validated()
    }

    /// Check invariants that the field types cannot express on their own.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.storage_target.trim().is_empty() {
            return Err(ConfigError::MissingStorageTarget);
        }
        Ok(self)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value: value.to_string() }),
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: value.to_string() })
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

type Listener = Arc<dyn Fn(&SinkOptions) + Send + Sync>;

struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<BTreeMap<u64, Listener>>,
}

/// Live, atomically swapped [`SinkOptions`] snapshot.
///
/// Readers always see a complete snapshot. [`OptionsMonitor::update`]
/// swaps in the new value, then notifies `on_change` listeners
/// synchronously and async subscribers through a watch channel.
pub struct OptionsMonitor {
    current: ArcSwap<SinkOptions>,
    listeners: Arc<Listeners>,
    tx: watch::Sender<Arc<SinkOptions>>,
}

impl OptionsMonitor {
    pub fn new(options: SinkOptions) -> Result<Self, ConfigError> {
        let options = Arc::new(options.validated()?);
        let (tx, _rx) = watch::channel(Arc::clone(&options));
        Ok(OptionsMonitor {
            current: ArcSwap::new(options),
            listeners: Arc::new(Listeners {
                next_id: AtomicU64::new(0),
                entries: RwLock::new(BTreeMap::new()),
            }),
            tx,
        })
    }

    pub fn current(&self) -> Arc<SinkOptions> {
        self.current.load_full()
    }

    /// Validate and publish a new snapshot.
    pub fn update(&self, options: SinkOptions) -> Result<(), ConfigError> {
        let options = Arc::new(options.validated()?);
        self.current.store(Arc::clone(&options));

        let listeners: Vec<Listener> = self.listeners.entries.read().values().cloned().collect();
        for listener in listeners {
            listener(&options);
        }
        self.tx.send_replace(options);
        Ok(())
    }

    /// Register a synchronous reload callback. Dropping the returned
    /// subscription unregisters it.
    pub fn on_change<F>(&self, f: F) -> ChangeSubscription
    where
        F: Fn(&SinkOptions) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.entries.write().insert(id, Arc::new(f));
        ChangeSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Async receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SinkOptions>> {
        self.tx.subscribe()
    }
}

/// Handle returned by [`OptionsMonitor::on_change`].
pub struct ChangeSubscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.entries.write().remove(&self.id);
        }
    }
}
