use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default)]
    pub worker_threads: usize,
    /// Model id bound; sizes every model-keyed wait category and tracker slot.
    #[serde(default = "default_max_model_count")]
    pub max_model_count: u32,
    #[serde(default = "default_max_notify_count")]
    pub max_notify_count: u32,
    #[serde(default = "default_max_queue_count")]
    pub max_queue_count: u32,
    /// Sleep between scheduler polls when no stream is runnable.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    #[serde(default)]
    pub gather: GatherConfig,
}

fn default_max_model_count() -> u32 { 1024 }
fn default_max_notify_count() -> u32 { 4096 }
fn default_max_queue_count() -> u32 { 8192 }
fn default_idle_backoff_ms() -> u64 { 1 }

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_model_count: default_max_model_count(),
            max_notify_count: default_max_notify_count(),
            max_queue_count: default_max_queue_count(),
            idle_backoff_ms: default_idle_backoff_ms(),
            gather: GatherConfig::default(),
        }
    }
}

impl SchedConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_model_count == 0 {
            return Err(SchedError::Config("max_model_count must be > 0".into()));
        }
        if self.max_notify_count == 0 {
            return Err(SchedError::Config("max_notify_count must be > 0".into()));
        }
        if self.max_queue_count == 0 {
            return Err(SchedError::Config("max_queue_count must be > 0".into()));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config:");
        tracing::info!("  workers:  {}", self.resolved_worker_threads());
        tracing::info!(
            "  bounds:   models={}, notifies={}, queues={}",
            self.max_model_count,
            self.max_notify_count,
            self.max_queue_count
        );
        tracing::info!(
            "  gather:   timeout_ms={}, cache_num={}, policy={:?}",
            self.gather.timeout_ms,
            self.gather.cache_num,
            self.gather.policy
        );
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `STEPD_KEY` overrides a top-level key and
    /// `STEPD_GATHER_KEY` overrides `gather.key`. Unparseable values are
    /// ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("STEPD_WORKER_THREADS") {
            self.worker_threads = v;
        }
        if let Some(v) = env_parse("STEPD_MAX_MODEL_COUNT") {
            self.max_model_count = v;
        }
        if let Some(v) = env_parse("STEPD_MAX_NOTIFY_COUNT") {
            self.max_notify_count = v;
        }
        if let Some(v) = env_parse("STEPD_MAX_QUEUE_COUNT") {
            self.max_queue_count = v;
        }
        if let Some(v) = env_parse("STEPD_IDLE_BACKOFF_MS") {
            self.idle_backoff_ms = v;
        }
        if let Some(v) = env_parse("STEPD_GATHER_TIMEOUT_MS") {
            self.gather.timeout_ms = v;
        }
        if let Some(v) = env_parse("STEPD_GATHER_CACHE_NUM") {
            self.gather.cache_num = v;
        }
        if let Some(v) = env_opt("STEPD_GATHER_POLICY").and_then(|v| MismatchPolicy::parse(&v)) {
            self.gather.policy = v;
        }
    }
}

// ── Gather ────────────────────────────────────────────────────

/// Defaults for gather dequeue steps whose descriptor leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherConfig {
    /// Force out an incomplete set older than this. 0 disables.
    #[serde(default)]
    pub timeout_ms: u64,
    /// Force out the smallest incomplete set once more than this many sets
    /// are pending. 0 disables.
    #[serde(default)]
    pub cache_num: u32,
    #[serde(default)]
    pub policy: MismatchPolicy,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            cache_num: 0,
            policy: MismatchPolicy::Drop,
        }
    }
}

/// What a gather does with a forced-out, incomplete set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Free the partial items and retry.
    #[default]
    Drop,
    /// Fill missing slots with zero-length placeholders and report discard.
    Pad,
}

impl MismatchPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "drop" => Some(MismatchPolicy::Drop),
            "pad" => Some(MismatchPolicy::Pad),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let config = SchedConfig::default();
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.max_model_count, 1024);
        assert_eq!(config.max_notify_count, 4096);
        assert_eq!(config.max_queue_count, 8192);
        assert_eq!(config.gather.policy, MismatchPolicy::Drop);
        assert!(config.resolved_worker_threads() > 0);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
worker_threads = 2
max_model_count = 8
max_notify_count = 16
max_queue_count = 32

[gather]
timeout_ms = 250
cache_num = 4
policy = "pad"
"#;
        let config = SchedConfig::from_toml(toml).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.resolved_worker_threads(), 2);
        assert_eq!(config.max_model_count, 8);
        assert_eq!(config.gather.timeout_ms, 250);
        assert_eq!(config.gather.cache_num, 4);
        assert_eq!(config.gather.policy, MismatchPolicy::Pad);
    }

    #[test]
    fn parse_minimal_toml_uses_defaults() {
        let config = SchedConfig::from_toml("worker_threads = 1\n").unwrap();
        assert_eq!(config.max_queue_count, 8192);
        assert_eq!(config.idle_backoff(), Duration::from_millis(1));
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let err = SchedConfig::from_toml("max_model_count = 0\n").unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = SchedConfig::from_toml("max_model_count = \"many\"\n").unwrap_err();
        assert!(matches!(err, SchedError::ConfigParse(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_notify_count = 64").unwrap();
        let config = SchedConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_notify_count, 64);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = SchedConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, SchedError::ConfigIo(_)));
    }

    #[test]
    fn policy_parse() {
        assert_eq!(MismatchPolicy::parse("PAD"), Some(MismatchPolicy::Pad));
        assert_eq!(MismatchPolicy::parse(" drop "), Some(MismatchPolicy::Drop));
        assert_eq!(MismatchPolicy::parse("keep"), None);
    }
}
