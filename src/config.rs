//! Configuration: TOML file, environment overrides, retry policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// Retry behavior for transient reasoner failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// Computes backoff delays from a `RetryConfig`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Exponential backoff, capped. `attempt` is zero-based.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_multiplier.powi(attempt as i32);
        let delay = (self.config.initial_delay_ms as f64 * factor) as u64;
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }
}

/// Upstream endpoints the tools call. Any of them may be left unset, in
/// which case the tool degrades to a deterministic local result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolEndpoints {
    pub web_search_url: Option<String>,
    pub stats_url: Option<String>,
    pub odds_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Bearer key granting service privilege over the HTTP surface.
    pub service_key: Option<String>,
    pub cors_origins: Vec<String>,
    pub tool_timeout_secs: u64,
    pub retry: RetryConfig,
    pub tools: ToolEndpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            service_key: None,
            cors_origins: Vec::new(),
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            retry: RetryConfig::default(),
            tools: ToolEndpoints::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("parleylock"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("parleylock").join("config.toml"))
}

impl Config {
    /// Load from the given path (or the default location), then apply
    /// environment overrides. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path.map(PathBuf::from).or_else(default_config_path) {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing config {}", p.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PARLEYLOCK_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_SERVICE_KEY") {
            self.service_key = Some(v);
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_MODEL") {
            self.model = v;
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_PORT")
            && let Ok(port) = v.parse()
        {
            self.port = port;
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_SEARCH_URL") {
            self.tools.web_search_url = Some(v);
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_STATS_URL") {
            self.tools.stats_url = Some(v);
        }
        if let Ok(v) = std::env::var("PARLEYLOCK_ODDS_URL") {
            self.tools.odds_url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("base_url must not be empty");
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            bail!("base_url must be an http(s) URL, got '{}'", self.base_url);
        }
        if self.model.is_empty() {
            bail!("model must not be empty");
        }
        if self.tool_timeout_secs == 0 {
            bail!("tool_timeout_secs must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            bail!("retry.backoff_multiplier must be >= 1.0");
        }
        Ok(())
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone())
    }

    #[must_use]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 500,
        });
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn validate_rejects_bad_base_url() {
        let config = Config {
            base_url: "ftp://nope".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn toml_round_trip_keeps_defaults_for_missing_fields() {
        let parsed: Config = toml::from_str("port = 9000\nmodel = \"deepseek-reasoner\"").unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.model, "deepseek-reasoner");
        assert_eq!(parsed.base_url, DEFAULT_BASE_URL);
        assert_eq!(parsed.retry.max_retries, 3);
    }
}
