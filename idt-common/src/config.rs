//! Configuration model, validation and path resolution
//!
//! The CLI (or any other front-end) assembles a [`ProviderConfig`] and a
//! [`RunContext`]; both are validated here before any work starts.

use crate::error::ConfigError;
use crate::models::Stage;
use crate::prompts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the shared geocode cache location
pub const GEOCODE_CACHE_ENV: &str = "IDT_GEOCODE_CACHE";

const GEOCODE_CACHE_FILE: &str = "geocode_cache.json";

/// Hard ceiling on retries; anything above this is almost certainly a typo
const MAX_RETRIES_LIMIT: u32 = 20;

/// Vision backend family
///
/// A closed set: the gateway picks its backend once from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama HTTP service
    Ollama,
    /// OpenAI chat completions API
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API
    Claude,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "http://localhost:11434",
            ProviderKind::OpenAi => "https://api.openai.com",
            ProviderKind::Claude => "https://api.anthropic.com",
        }
    }

    /// Environment variable consulted when the config carries no API key
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Ollama => None,
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Claude => Some("ANTHROPIC_API_KEY"),
        }
    }

    /// Safe number of concurrent requests when the config does not say
    pub fn default_max_in_flight(&self) -> usize {
        match self {
            // A local model server handles one image at a time well; more just queues
            ProviderKind::Ollama => 2,
            ProviderKind::OpenAi | ProviderKind::Claude => 4,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "openai" => Ok(ProviderKind::OpenAi),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            other => Err(ConfigError::invalid(
                "provider",
                format!("unknown provider '{}' (expected ollama, openai or claude)", other),
            )),
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Relative jitter; 0.2 spreads each delay over ±20%
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Un-jittered delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::invalid("backoff.base_delay_ms", "must be > 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "backoff.max_delay_ms",
                format!("must be >= base_delay_ms ({})", self.base_delay_ms),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("backoff.jitter", "must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Provider settings for one run
///
/// Immutable for the lifetime of a run; the run manifest records its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default = "default_prompt_style")]
    pub prompt_style: String,
    /// Per-call timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Concurrent backend calls allowed through this gateway
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// Base URL override
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_prompt_style() -> String {
    prompts::DEFAULT_STYLE.to_string()
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_max_retries() -> u32 {
    3
}

impl ProviderConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            prompt_style: default_prompt_style(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
            max_in_flight: None,
            endpoint: None,
            api_key: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.provider.default_endpoint())
            .trim_end_matches('/')
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
            .unwrap_or_else(|| self.provider.default_max_in_flight())
    }

    /// API key from the config, falling back to the provider's environment variable
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                self.provider
                    .api_key_env()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.trim().is_empty())
            })
    }

    /// Check internal consistency; fails fast before any work starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::missing("provider.model"));
        }
        if prompts::template(&self.prompt_style).is_none() {
            let known: Vec<&str> = prompts::styles().collect();
            return Err(ConfigError::invalid(
                "provider.prompt_style",
                format!("unknown style '{}' (known: {})", self.prompt_style, known.join(", ")),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("provider.timeout_ms", "must be > 0"));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::invalid(
                "provider.max_retries",
                format!("must be <= {}", MAX_RETRIES_LIMIT),
            ));
        }
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::invalid("provider.max_in_flight", "must be >= 1"));
        }
        self.backoff.validate()?;

        if let Some(var) = self.provider.api_key_env() {
            if self.resolved_api_key().is_none() {
                return Err(ConfigError::Missing {
                    key: format!("provider.api_key (or {})", var),
                });
            }
        }
        Ok(())
    }
}

/// Geocoding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// Minimum delay between external lookups
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_true() -> bool {
    true
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    format!("idt/{} (image description toolkit)", env!("CARGO_PKG_VERSION"))
}

impl Default for GeocodeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_path: None,
            min_interval_ms: default_min_interval_ms(),
            endpoint: None,
            user_agent: default_user_agent(),
        }
    }
}

/// Run-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Worker pool size per stage
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
}

fn default_workers() -> usize {
    2
}

fn default_stages() -> Vec<Stage> {
    Stage::DEFAULT_ORDER.to_vec()
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            stages: default_stages(),
        }
    }
}

/// Contents of an `idt.toml` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdtConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub geocode: GeocodeSettings,
    #[serde(default)]
    pub run: RunSettings,
}

/// Load and parse a TOML config file (validation is left to the caller, which may
/// still apply command-line overrides)
pub fn load_config(path: &Path) -> Result<IdtConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Geocode cache location, in priority order:
/// 1. Command-line argument
/// 2. `IDT_GEOCODE_CACHE` environment variable
/// 3. TOML config value
/// 4. OS-dependent data directory
pub fn resolve_geocode_cache_path(cli_arg: Option<&Path>, config_value: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(GEOCODE_CACHE_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = config_value {
        return path.to_path_buf();
    }

    default_data_dir().join(GEOCODE_CACHE_FILE)
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("idt"))
        .unwrap_or_else(|| PathBuf::from("./idt_data"))
}

/// Explicit locations for one run
///
/// Handed to every component constructor; nothing resolves paths relative to the
/// process working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub output_dir: PathBuf,
    pub geocode_cache_path: PathBuf,
}

impl RunContext {
    pub fn new(output_dir: impl Into<PathBuf>, geocode_cache_path: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            geocode_cache_path: geocode_cache_path.into(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join("run.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.output_dir.join("ledger.jsonl")
    }

    pub fn status_path(&self) -> PathBuf {
        self.output_dir.join("status.jsonl")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.output_dir.join("run.lock")
    }

    pub fn records_path(&self) -> PathBuf {
        self.output_dir.join("records.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ollama() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::Ollama, "llava")
    }

    #[test]
    fn test_default_ollama_config_is_valid() {
        assert!(ollama().validate().is_ok());
        assert_eq!(ollama().endpoint(), "http://localhost:11434");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = ollama();
        config.timeout_ms = 0;
        match config.validate() {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "provider.timeout_ms"),
            other => panic!("expected invalid timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_prompt_style_rejected() {
        let mut config = ollama();
        config.prompt_style = "limerick".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds() {
        let mut backoff = BackoffConfig::default();
        backoff.jitter = 1.0;
        assert!(backoff.validate().is_err());

        let backoff = BackoffConfig {
            base_delay_ms: 500,
            max_delay_ms: 100,
            jitter: 0.0,
        };
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_nominal_delay_doubles_and_caps() {
        let backoff = BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.2,
        };
        assert_eq!(backoff.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.nominal_delay(4), Duration::from_millis(1000));
        assert_eq!(backoff.nominal_delay(63), Duration::from_millis(1000));
    }

    #[test]
    fn test_trailing_slash_trimmed_from_endpoint() {
        let mut config = ollama();
        config.endpoint = Some("http://gpu-box:11434/".to_string());
        assert_eq!(config.endpoint(), "http://gpu-box:11434");
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Claude);
        assert!("gemini".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_run_context_layout() {
        let ctx = RunContext::new("/out/run1", "/cache/geo.json");
        assert_eq!(ctx.ledger_path(), PathBuf::from("/out/run1/ledger.jsonl"));
        assert_eq!(ctx.status_path(), PathBuf::from("/out/run1/status.jsonl"));
        assert_eq!(ctx.lock_path(), PathBuf::from("/out/run1/run.lock"));
    }
}
