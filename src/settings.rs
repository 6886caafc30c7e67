//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides
//!
//! CLI flags are applied by the caller on top of the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_engine::OrchestratorConfig;
use tether_protocol::Backoff;
use tether_server::ServerConfig;
use tether_telemetry::TelemetryConfig;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Which protocol client implementation backs sessions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process clients that pair by themselves after a delay.
    #[default]
    Simulated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TetherSettings {
    pub backend: Backend,
    pub server: ServerSettings,
    pub orchestrator: OrchestratorSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub simulator: SimulatorSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Simulated,
            server: ServerSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
            simulator: SimulatorSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self {
            host: config.host,
            port: config.port,
            max_send_queue: config.max_send_queue,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorSettings {
    pub max_sessions_per_owner: usize,
    pub pairing_timeout_secs: u64,
    pub challenge_timeout_secs: u64,
    pub max_pairing_retries: u32,
    pub health_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub subscriber_queue: usize,
    pub reconnect: ReconnectSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let config = OrchestratorConfig::default();
        Self {
            max_sessions_per_owner: config.max_sessions_per_owner,
            pairing_timeout_secs: config.pairing_timeout.as_secs(),
            challenge_timeout_secs: config.challenge_timeout.as_secs(),
            max_pairing_retries: config.max_pairing_retries,
            health_interval_secs: config.health_interval.as_secs(),
            connect_timeout_secs: config.connect_timeout.as_secs(),
            subscriber_queue: config.subscriber_queue,
            reconnect: ReconnectSettings::from(&config.reconnect),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self::from(&Backoff::default())
    }
}

impl From<&Backoff> for ReconnectSettings {
    fn from(b: &Backoff) -> Self {
        Self {
            max_attempts: b.max_attempts,
            base_delay_ms: b.base_delay.as_millis() as u64,
            max_delay_ms: b.max_delay.as_millis() as u64,
            jitter: b.jitter_factor,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSettings {
    /// SQLite file; `:memory:` keeps everything in memory.
    pub db_path: String,
    /// Vault key sealing identity material at rest.
    pub key_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let dir = tether_dir();
        Self {
            db_path: dir.join("database").join("tether.db").display().to_string(),
            key_path: dir.join("identity.key").display().to_string(),
        }
    }
}

impl StorageSettings {
    pub fn is_in_memory(&self) -> bool {
        self.db_path == ":memory:"
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    /// Per-module levels, e.g. `{"tether_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
    /// Persisted records older than this are pruned. `0` keeps everything.
    pub retention_days: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            modules: BTreeMap::new(),
            log_to_sqlite: true,
            log_db_path: tether_dir()
                .join("database")
                .join("logs.db")
                .display()
                .to_string(),
            retention_days: 14,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatorSettings {
    /// Seconds after a code is issued until the simulated phone "scans" it.
    /// `null` disables automatic pairing.
    pub auto_pair_after_secs: Option<u64>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            auto_pair_after_secs: Some(8),
        }
    }
}

impl TetherSettings {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            max_sessions_per_owner: o.max_sessions_per_owner,
            pairing_timeout: Duration::from_secs(o.pairing_timeout_secs),
            challenge_timeout: Duration::from_secs(o.challenge_timeout_secs),
            max_pairing_retries: o.max_pairing_retries,
            health_interval: Duration::from_secs(o.health_interval_secs),
            connect_timeout: Duration::from_secs(o.connect_timeout_secs),
            reconnect: Backoff {
                max_attempts: o.reconnect.max_attempts,
                base_delay: Duration::from_millis(o.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(o.reconnect.max_delay_ms),
                jitter_factor: o.reconnect.jitter,
            },
            subscriber_queue: o.subscriber_queue,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            max_send_queue: self.server.max_send_queue,
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            log_level: self.logging.level.parse().unwrap_or(defaults.log_level),
            module_levels: self
                .logging
                .modules
                .iter()
                .filter_map(|(module, level)| Some((module.clone(), level.parse().ok()?)))
                .collect(),
            log_to_sqlite: self.logging.log_to_sqlite,
            log_db_path: PathBuf::from(&self.logging.log_db_path),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.max_sessions_per_owner == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestrator.maxSessionsPerOwner must be at least 1".into(),
            ));
        }
        if o.pairing_timeout_secs == 0 || o.challenge_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "pairing and challenge timeouts must be positive".into(),
            ));
        }
        if o.health_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestrator.healthIntervalSecs must be positive".into(),
            ));
        }
        if o.subscriber_queue == 0 || self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue("queue sizes must be positive".into()));
        }
        if !(0.0..=1.0).contains(&o.reconnect.jitter) {
            return Err(SettingsError::InvalidValue(
                "orchestrator.reconnect.jitter must be within 0..=1".into(),
            ));
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

pub fn tether_dir() -> PathBuf {
    home_dir().join(".tether")
}

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    tether_dir().join("settings.json")
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. A file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Invalid values are logged and
/// ignored.
pub fn apply_overrides(settings: &mut TetherSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("TETHER_PORT", |s| parse_range::<u16>(s, 1, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("TETHER_DB") {
        settings.storage.db_path = v;
    }
    if let Some(v) = env.string("TETHER_KEY_PATH") {
        settings.storage.key_path = v;
    }
    if let Some(v) = env.parsed("TETHER_BACKEND", parse_backend) {
        settings.backend = v;
    }
    if let Some(v) = env.parsed("TETHER_MAX_SESSIONS", |s| parse_range::<usize>(s, 1, 10_000)) {
        settings.orchestrator.max_sessions_per_owner = v;
    }
    if let Some(v) = env.parsed("TETHER_PAIRING_TIMEOUT_SECS", |s| parse_range::<u64>(s, 1, 3_600)) {
        settings.orchestrator.pairing_timeout_secs = v;
    }
    if let Some(v) = env.parsed("TETHER_MAX_PAIRING_RETRIES", |s| parse_range::<u32>(s, 1, 100)) {
        settings.orchestrator.max_pairing_retries = v;
    }
    if let Some(v) = env.parsed("TETHER_HEALTH_INTERVAL_SECS", |s| parse_range::<u64>(s, 1, 86_400)) {
        settings.orchestrator.health_interval_secs = v;
    }
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("TETHER_LOG_TO_SQLITE", parse_bool) {
        settings.logging.log_to_sqlite = v;
    }
    if let Some(v) = env.parsed("TETHER_LOG_RETENTION_DAYS", |s| parse_range::<u32>(s, 0, 3_650)) {
        settings.logging.retention_days = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T: std::str::FromStr + PartialOrd>(val: &str, min: T, max: T) -> Option<T> {
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn parse_backend(val: &str) -> Option<Backend> {
    serde_json::from_value(Value::String(val.to_lowercase())).ok()
}
