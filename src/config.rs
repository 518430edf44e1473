//! Engine configuration read from `.fawkes/flow.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so an
//! absent or empty file yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = ".fawkes/flow.db"
//! busy_timeout_ms = 2000
//!
//! [engine]
//! dedup_window_secs = 10
//! wip_lock_shards = 128
//! op_timeout_ms = 5000
//! notify_queue_capacity = 1024
//!
//! [metrics]
//! window_days = 30
//!
//! [policy]
//! table = "default-forward-plus-retry"
//! retry = [{ from = "Testing", to = "Development" }]
//!
//! [sync]
//! enabled = true
//! interval_secs = 300
//! boards = ["b1x9k2"]
//!
//! [focalboard]
//! api_url = "http://mattermost.fawkes.svc:8065/api/v2"
//! token_env = "FOCALBOARD_TOKEN"
//!
//! [column_aliases]
//! "in progress" = "Development"
//!
//! [logging]
//! format = "json"
//! level = "info"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the built-in forward-only policy table.
pub const DEFAULT_POLICY_TABLE: &str = "default-forward-plus-retry";

/// Directory holding the database, config and logs, relative to the working dir.
pub const FLOW_DIR: &str = ".fawkes";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// How long SQLite waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Permissive CORS for local front-end development.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(FLOW_DIR).join("flow.db")
}

fn default_busy_timeout_ms() -> u64 {
    2000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            dev_mode: false,
        }
    }
}

impl ServerSection {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Window within which a repeat of the latest transition is a retry.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Number of mutexes in the per-work-item lock pool.
    #[serde(default = "default_wip_lock_shards")]
    pub wip_lock_shards: usize,
    /// Deadline for a single engine operation (lock wait plus storage).
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// Capacity of the aggregator notification queue.
    #[serde(default = "default_notify_queue_capacity")]
    pub notify_queue_capacity: usize,
}

fn default_dedup_window_secs() -> u64 {
    10
}

fn default_wip_lock_shards() -> usize {
    128
}

fn default_op_timeout_ms() -> u64 {
    5000
}

fn default_notify_queue_capacity() -> usize {
    1024
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            wip_lock_shards: default_wip_lock_shards(),
            op_timeout_ms: default_op_timeout_ms(),
            notify_queue_capacity: default_notify_queue_capacity(),
        }
    }
}

impl EngineSection {
    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    /// Retention of percentile samples, in days.
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    30
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
        }
    }
}

impl MetricsSection {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::days(self.window_days as i64)
    }
}

/// A directed stage pair, by stage name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagePair {
    pub from: String,
    pub to: String,
}

impl StagePair {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Either the named built-in table or an explicit list of allowed pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyTableConfig {
    Named(String),
    Pairs(Vec<StagePair>),
}

impl Default for PolicyTableConfig {
    fn default() -> Self {
        Self::Named(DEFAULT_POLICY_TABLE.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub table: PolicyTableConfig,
    /// Backward moves allowed under the default table (rework, re-test).
    #[serde(default)]
    pub retry: Vec<StagePair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    /// Board ids reconciled on every run.
    #[serde(default)]
    pub boards: Vec<String>,
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    300
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            interval_secs: default_sync_interval_secs(),
            boards: Vec::new(),
        }
    }
}

impl SyncSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocalboardSection {
    #[serde(default = "default_focalboard_url")]
    pub api_url: String,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_focalboard_url() -> String {
    "http://mattermost.fawkes.svc:8065/api/v2".to_string()
}

fn default_token_env() -> String {
    "FOCALBOARD_TOKEN".to_string()
}

impl Default for FocalboardSection {
    fn default() -> Self {
        Self {
            api_url: default_focalboard_url(),
            token_env: default_token_env(),
        }
    }
}

impl FocalboardSection {
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
            dir: None,
        }
    }
}

/// The complete flow.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub focalboard: FocalboardSection,
    /// External column name → stage name. Merged over the built-in aliases.
    #[serde(default)]
    pub column_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FlowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flow.toml")
    }

    /// Load `flow.toml` from `flow_dir`, or the defaults if it does not exist.
    pub fn load_or_default(flow_dir: &Path) -> Result<Self> {
        let config_path = flow_dir.join("flow.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize flow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides (`FLOW_DB_PATH`, `FLOW_PORT`).
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Ok(port) = std::env::var("FLOW_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid FLOW_PORT '{}'", port))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.wip_lock_shards == 0 {
            warnings.push("engine.wip_lock_shards is 0; a single shard will be used".to_string());
        }
        if self.engine.notify_queue_capacity == 0 {
            warnings.push(
                "engine.notify_queue_capacity is 0; a capacity of 1 will be used".to_string(),
            );
        }
        if self.engine.op_timeout_ms == 0 {
            warnings.push("engine.op_timeout_ms is 0; every operation will time out".to_string());
        }
        if self.sync.enabled && self.sync.interval_secs == 0 {
            warnings.push("sync.interval_secs is 0; periodic sync is disabled".to_string());
        }
        if self.metrics.window_days == 0 {
            warnings.push("metrics.window_days is 0; percentile samples are not retained".into());
        }

        match &self.policy.table {
            PolicyTableConfig::Named(name) if name != DEFAULT_POLICY_TABLE => {
                warnings.push(format!(
                    "Unknown policy table '{}'; expected '{}' or a list of pairs",
                    name, DEFAULT_POLICY_TABLE
                ));
            }
            PolicyTableConfig::Pairs(pairs) if pairs.is_empty() => {
                warnings.push("policy.table is an empty list; no transitions are reachable".into());
            }
            PolicyTableConfig::Pairs(_) if !self.policy.retry.is_empty() => {
                warnings.push(
                    "policy.retry is ignored when policy.table is an explicit list".to_string(),
                );
            }
            _ => {}
        }

        for (column, stage) in &self.column_aliases {
            if stage.trim().is_empty() {
                warnings.push(format!("Column alias '{}' maps to an empty stage name", column));
            }
        }

        warnings
    }
}

/// Default config template written by `init`.
pub fn template() -> String {
    format!(
        r#"# Fawkes flow engine configuration.

[server]
host = "127.0.0.1"
port = 8000
db_path = "{}/flow.db"
busy_timeout_ms = 2000

[engine]
dedup_window_secs = 10
wip_lock_shards = 128
op_timeout_ms = 5000

[metrics]
window_days = 30

[policy]
table = "{}"
retry = []

[sync]
enabled = true
interval_secs = 300
boards = []

[column_aliases]
"#,
        FLOW_DIR, DEFAULT_POLICY_TABLE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = FlowToml::parse("").unwrap();
        assert_eq!(config.engine.dedup_window_secs, 10);
        assert_eq!(config.engine.wip_lock_shards, 128);
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.metrics.window_days, 30);
        assert_eq!(config.policy.table, PolicyTableConfig::default());
        assert_eq!(config.server.port, 8000);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_duration_accessors() {
        let config = FlowToml::default();
        assert_eq!(config.engine.dedup_window(), chrono::Duration::seconds(10));
        assert_eq!(config.engine.op_timeout(), Duration::from_secs(5));
        assert_eq!(config.metrics.window(), chrono::Duration::days(30));
        assert_eq!(config.sync.interval(), Duration::from_secs(300));
        assert_eq!(config.server.busy_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_explicit_policy_pairs() {
        let config = FlowToml::parse(
            r#"
            [policy]
            table = [{ from = "Backlog", to = "Development" }, { from = "Production", to = "Development" }]
            "#,
        )
        .unwrap();
        match &config.policy.table {
            PolicyTableConfig::Pairs(pairs) => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[1], StagePair::new("Production", "Development"));
            }
            other => panic!("expected pairs, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_retry_and_aliases() {
        let config = FlowToml::parse(
            r#"
            [policy]
            retry = [{ from = "Testing", to = "Development" }]

            [column_aliases]
            "In Flight" = "Development"
            "#,
        )
        .unwrap();
        assert_eq!(config.policy.retry, vec![StagePair::new("Testing", "Development")]);
        assert_eq!(
            config.column_aliases.get("In Flight").map(String::as_str),
            Some("Development")
        );
    }

    #[test]
    fn test_validate_flags_unknown_named_table() {
        let config = FlowToml::parse(
            r#"
            [policy]
            table = "anything-goes"
            "#,
        )
        .unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("anything-goes"));
    }

    #[test]
    fn test_validate_flags_zero_values() {
        let config = FlowToml::parse(
            r#"
            [engine]
            wip_lock_shards = 0

            [sync]
            interval_secs = 0
            "#,
        )
        .unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("wip_lock_shards")));
        assert!(warnings.iter().any(|w| w.contains("interval_secs")));
    }

    #[test]
    fn test_validate_retry_with_explicit_table() {
        let config = FlowToml::parse(
            r#"
            [policy]
            table = [{ from = "A", to = "B" }]
            retry = [{ from = "B", to = "A" }]
            "#,
        )
        .unwrap();
        assert!(config.validate().iter().any(|w| w.contains("ignored")));
    }

    #[test]
    fn test_template_parses() {
        let config = FlowToml::parse(&template()).unwrap();
        assert_eq!(config.engine.dedup_window_secs, 10);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.toml");
        let mut config = FlowToml::default();
        config.sync.boards = vec!["board-1".into()];
        config.save(&path).unwrap();

        let loaded = FlowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.sync.boards, vec!["board-1".to_string()]);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.server.db_path, PathBuf::from(".fawkes/flow.db"));
    }
}
