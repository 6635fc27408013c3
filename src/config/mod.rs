//! Backbone configuration.
//!
//! Loaded from a JSON document. Every section falls back to defaults, so a
//! file only needs the values it changes. The destination, client and
//! schedule tables keep the tab-separated line layout the operator tools
//! produce.

use crate::core::{Result, SignalError};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted hot window: ten years.
pub const MAX_RETENTION_MINUTES: i64 = 10 * 365 * 24 * 60;

/// Signal store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of the hot collection; `None` keeps records in memory only.
    pub data_dir: Option<PathBuf>,

    /// Root of the monthly archive; defaults to `{data_dir}/_backup`.
    pub backup_root: Option<PathBuf>,

    /// Records older than this many minutes leave the hot window.
    pub retention_minutes: i64,

    /// Seconds between archival sweeps.
    pub sweep_interval_secs: u64,

    /// Upper bound on records per durable write.
    pub batch_size: usize,

    /// How long the writer waits to fill a durable batch.
    pub batch_wait_ms: u64,

    /// How long `refresh` waits for the reload.
    pub refresh_timeout_secs: u64,

    /// Journal entries before a collection compacts into its snapshot.
    pub checkpoint_threshold: usize,

    /// fsync every journal append.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            backup_root: None,
            retention_minutes: 1440,
            sweep_interval_secs: 60,
            batch_size: 500,
            batch_wait_ms: 200,
            refresh_timeout_secs: 5,
            checkpoint_threshold: 1000,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn backup_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_root = Some(dir.into());
        self
    }

    pub fn retention_minutes(mut self, minutes: i64) -> Self {
        self.retention_minutes = minutes;
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    pub fn batch_wait_ms(mut self, ms: u64) -> Self {
        self.batch_wait_ms = ms;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// The hot window, clamped to `0..=MAX_RETENTION_MINUTES`.
    pub fn retention(&self) -> TimeDelta {
        TimeDelta::try_minutes(self.retention_minutes.clamp(0, MAX_RETENTION_MINUTES))
            .unwrap_or_default()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    /// Resolved archive root, if the store is on disk.
    pub fn resolved_backup_root(&self) -> Option<PathBuf> {
        self.backup_root
            .clone()
            .or_else(|| self.data_dir.as_ref().map(|dir| dir.join("_backup")))
    }
}

/// Ingestion bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Records handed to the store per flush.
    pub batch_size: usize,

    /// Longest a partial batch waits before it is flushed.
    pub batch_wait_ms: u64,

    /// Capacity of the raw line queue.
    pub line_queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_wait_ms: 200,
            line_queue_capacity: 1024,
        }
    }
}

impl IngestConfig {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_wait_ms(mut self, ms: u64) -> Self {
        self.batch_wait_ms = ms;
        self
    }

    pub fn line_queue_capacity(mut self, capacity: usize) -> Self {
        self.line_queue_capacity = capacity;
        self
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }
}

/// Liveness monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub interval_secs: u64,

    /// Parameter string attached to synthesized timeout records.
    pub timeout_parameter: String,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_parameter: String::new(),
        }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Notification dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Control loop period.
    pub tick_ms: u64,

    /// Per-request HTTP timeout; also the pause between sending and the
    /// first completion poll.
    pub http_timeout_secs: u64,

    /// Wall-clock bound of each device-idle wait.
    pub completion_timeout_secs: u64,

    /// Pause between status polls.
    pub poll_interval_ms: u64,

    /// Pause before a device-idle wait starts polling.
    pub settle_delay_ms: u64,

    /// Whether this instance is the active one of a failover pair.
    pub active: bool,

    pub voice_enabled: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            http_timeout_secs: 3,
            completion_timeout_secs: 30,
            poll_interval_ms: 100,
            settle_delay_ms: 10_000,
            active: true,
            voice_enabled: false,
        }
    }
}

impl DispatchConfig {
    pub fn tick_ms(mut self, ms: u64) -> Self {
        self.tick_ms = ms;
        self
    }

    pub fn completion_timeout_secs(mut self, secs: u64) -> Self {
        self.completion_timeout_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.settle_delay_ms = ms;
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.http_timeout_secs = secs;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn voice_enabled(mut self, enabled: bool) -> Self {
        self.voice_enabled = enabled;
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Text encoding of socket payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PayloadEncoding {
    #[default]
    Utf8,
    Ascii,
}

/// Socket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub encoding: PayloadEncoding,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 1024,
            encoding: PayloadEncoding::Utf8,
        }
    }
}

/// Status endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// One client: its `name \t timeoutCheck \t timeoutLength \t timeoutMessage`
/// line and the destination indexes it notifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub line: String,
    #[serde(default = "all_destinations")]
    pub destinations: String,
}

fn all_destinations() -> String {
    "ALL".to_string()
}

impl ClientEntry {
    pub fn new(line: impl Into<String>, destinations: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            destinations: destinations.into(),
        }
    }
}

/// Complete backbone configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub liveness: LivenessConfig,
    pub dispatch: DispatchConfig,
    pub listener: ListenerConfig,
    pub web: WebConfig,

    /// `address \t name` lines; line N is destination index N (1-based).
    pub destinations: Vec<String>,

    pub clients: Vec<ClientEntry>,

    /// `targetStatus \t unit \t param` lines.
    pub schedules: Vec<String>,
}

impl BackboneConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SignalError::ConfigError(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SignalError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn ingest(mut self, ingest: IngestConfig) -> Self {
        self.ingest = ingest;
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn web(mut self, web: WebConfig) -> Self {
        self.web = web;
        self
    }

    pub fn destination(mut self, line: impl Into<String>) -> Self {
        self.destinations.push(line.into());
        self
    }

    pub fn client(mut self, line: impl Into<String>, destinations: impl Into<String>) -> Self {
        self.clients.push(ClientEntry::new(line, destinations));
        self
    }

    pub fn schedule(mut self, line: impl Into<String>) -> Self {
        self.schedules.push(line.into());
        self
    }

    /// Client entries as `(line, destination list)` pairs.
    pub fn client_pairs(&self) -> Vec<(String, String)> {
        self.clients
            .iter()
            .map(|c| (c.line.clone(), c.destinations.clone()))
            .collect()
    }

    /// Checks the numeric settings; table lines are validated when loaded.
    pub fn validate(&self) -> Result<()> {
        if self.store.retention_minutes <= 0 {
            return Err(SignalError::ConfigError(
                "store.retention_minutes must be > 0".to_string(),
            ));
        }
        if self.store.retention_minutes > MAX_RETENTION_MINUTES {
            return Err(SignalError::ConfigError(format!(
                "store.retention_minutes must be <= {}",
                MAX_RETENTION_MINUTES
            )));
        }
        if self.store.batch_size == 0 || self.ingest.batch_size == 0 {
            return Err(SignalError::ConfigError(
                "batch_size must be > 0".to_string(),
            ));
        }
        if self.ingest.line_queue_capacity == 0 {
            return Err(SignalError::ConfigError(
                "ingest.line_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.dispatch.completion_timeout_secs == 0 {
            return Err(SignalError::ConfigError(
                "dispatch.completion_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackboneConfig::default();
        assert_eq!(config.store.retention_minutes, 1440);
        assert_eq!(config.ingest.batch_size, 50);
        assert_eq!(config.ingest.batch_wait_ms, 200);
        assert_eq!(config.liveness.interval_secs, 10);
        assert_eq!(config.dispatch.completion_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = BackboneConfig::from_json_str(
            r#"{
                "store": { "data_dir": "/var/lib/sigrelay", "retention_minutes": 60 },
                "destinations": ["192.168.1.11\tTower1"],
                "clients": [{ "line": "Press1\ttrue\t60\tPress1 silent", "destinations": "1" }],
                "schedules": ["OK\tEverySeconds\t30"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.store.retention_minutes, 60);
        assert_eq!(config.store.sweep_interval_secs, 60);
        assert_eq!(
            config.store.resolved_backup_root(),
            Some(PathBuf::from("/var/lib/sigrelay/_backup"))
        );
        assert_eq!(config.clients[0].destinations, "1");
        assert_eq!(config.schedules.len(), 1);
    }

    #[test]
    fn test_client_destinations_default_to_all() {
        let config =
            BackboneConfig::from_json_str(r#"{ "clients": [{ "line": "A\tfalse\t0\t" }] }"#)
                .unwrap();
        assert_eq!(config.clients[0].destinations, "ALL");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = BackboneConfig::default().store(StoreConfig::default().retention_minutes(0));
        assert!(config.validate().is_err());

        let config = BackboneConfig::default()
            .store(StoreConfig::default().retention_minutes(99999999999999999));
        assert!(config.validate().is_err());
        assert_eq!(
            config.store.retention(),
            TimeDelta::minutes(MAX_RETENTION_MINUTES)
        );

        let config = BackboneConfig::default().ingest(IngestConfig::default().batch_size(0));
        assert!(config.validate().is_err());

        assert!(BackboneConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_builder_pattern() {
        let config = BackboneConfig::default()
            .destination("10.0.0.1\tA")
            .client("Press1\ttrue\t60\tsilent", "1")
            .schedule("OK\tEveryHours\t0,30")
            .dispatch(DispatchConfig::default().active(false).voice_enabled(true));

        assert_eq!(config.destinations.len(), 1);
        assert_eq!(
            config.client_pairs(),
            vec![("Press1\ttrue\t60\tsilent".to_string(), "1".to_string())]
        );
        assert!(!config.dispatch.active);
        assert!(config.dispatch.voice_enabled);
    }
}
