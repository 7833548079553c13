use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for AtomGraph
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AtomGraphConfig {
    /// Connection weighting and categorisation
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Thresholds for the deep-analysis decision gate
    #[serde(default)]
    pub gates: GateThresholds,

    /// Change-event batching
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    /// Deep analyzer call policy
    #[serde(default)]
    pub deep_analyzer: DeepAnalyzerConfig,

    /// Incremental cache persistence
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AtomGraphConfig {
    /// Runs the same checks as [`ConfigManager::load`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigManager::validate_config(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Base weight per connection type name
    #[serde(default = "default_base_weights")]
    pub base_weights: BTreeMap<String, f64>,

    /// Base weight for types missing from `base_weights`
    #[serde(default = "default_weight")]
    pub default_weight: f64,

    #[serde(default = "default_max_weight")]
    pub max_weight: f64,

    /// Upper bound on the combined lineage multiplier
    #[serde(default = "default_max_boost")]
    pub max_boost: f64,

    /// Vibration score at which lineage survival starts boosting weight
    #[serde(default = "default_high_vibration_threshold")]
    pub high_vibration_threshold: f64,

    #[serde(default = "default_vibration_boost")]
    pub vibration_boost: f64,

    /// Added to the multiplier per ancestry generation
    #[serde(default = "default_generation_boost_step")]
    pub generation_boost_step: f64,

    #[serde(default = "default_max_generation_boost")]
    pub max_generation_boost: f64,

    /// Multiplier applied to broken connections
    #[serde(default = "default_broken_penalty")]
    pub broken_penalty: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    #[serde(default = "default_strong_threshold")]
    pub strong_threshold: f64,

    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            base_weights: default_base_weights(),
            default_weight: default_weight(),
            max_weight: default_max_weight(),
            max_boost: default_max_boost(),
            high_vibration_threshold: default_high_vibration_threshold(),
            vibration_boost: default_vibration_boost(),
            generation_boost_step: default_generation_boost_step(),
            max_generation_boost: default_max_generation_boost(),
            broken_penalty: default_broken_penalty(),
            critical_threshold: default_critical_threshold(),
            strong_threshold: default_strong_threshold(),
            medium_threshold: default_medium_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateThresholds {
    /// Below this share of classified atoms the purpose gates are inconclusive
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,

    #[serde(default = "default_safe_coverage")]
    pub safe_coverage: f64,

    /// Confidence at which a semantic connection counts as resolved
    #[serde(default = "default_semantic_confidence")]
    pub semantic_confidence: f64,

    #[serde(default = "default_high_coverage")]
    pub high_coverage: f64,

    /// Archetype confidence at which an atom counts as a risk signal
    #[serde(default = "default_risk_confidence")]
    pub risk_confidence: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_coverage: default_min_coverage(),
            safe_coverage: default_safe_coverage(),
            semantic_confidence: default_semantic_confidence(),
            high_coverage: default_high_coverage(),
            risk_confidence: default_risk_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_queue_max_batches")]
    pub max_batches: usize,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

impl QueueConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_queue_batch_size(),
            max_batches: default_queue_max_batches(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_analyses: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_analyses: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalyzerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl DeepAnalyzerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_millis(ms.min(self.backoff_max_ms as f64) as u64)
    }
}

impl Default for DeepAnalyzerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory (relative to the project root) holding the snapshot
    #[serde(default = "default_cache_directory")]
    pub directory: String,

    #[serde(default = "default_cache_file_name")]
    pub file_name: String,

    /// Entries older than this are evicted
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

impl CacheConfig {
    pub fn snapshot_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.directory).join(&self.file_name)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            file_name: default_cache_file_name(),
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_transitive_cap")]
    pub transitive_cap: usize,

    #[serde(default = "default_call_site_cap")]
    pub call_site_cap: usize,

    #[serde(default = "default_high_risk_threshold")]
    pub high_risk_threshold: usize,

    #[serde(default = "default_medium_risk_threshold")]
    pub medium_risk_threshold: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            transitive_cap: default_transitive_cap(),
            call_site_cap: default_call_site_cap(),
            high_risk_threshold: default_high_risk_threshold(),
            medium_risk_threshold: default_medium_risk_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_base_weights() -> BTreeMap<String, f64> {
    [
        ("import", 1.0),
        ("call", 1.0),
        ("data-flow-chain", 1.1),
        ("temporal-dependency", 1.2),
        ("inherited", 0.9),
        ("ruptured", 0.6),
        ("shared-state", 1.3),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
fn default_weight() -> f64 {
    0.5
}
fn default_max_weight() -> f64 {
    2.0
}
fn default_max_boost() -> f64 {
    2.0
}
fn default_high_vibration_threshold() -> f64 {
    0.8
}
fn default_vibration_boost() -> f64 {
    0.5
}
fn default_generation_boost_step() -> f64 {
    0.1
}
fn default_max_generation_boost() -> f64 {
    0.5
}
fn default_broken_penalty() -> f64 {
    0.5
}
fn default_critical_threshold() -> f64 {
    1.2
}
fn default_strong_threshold() -> f64 {
    0.9
}
fn default_medium_threshold() -> f64 {
    0.6
}
fn default_min_coverage() -> f64 {
    0.6
}
fn default_safe_coverage() -> f64 {
    0.8
}
fn default_semantic_confidence() -> f64 {
    0.8
}
fn default_high_coverage() -> f64 {
    0.85
}
fn default_risk_confidence() -> f64 {
    0.7
}
fn default_queue_batch_size() -> usize {
    50
}
fn default_queue_max_batches() -> usize {
    8
}
fn default_flush_timeout_ms() -> u64 {
    200
}
fn default_max_concurrent() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_cache_directory() -> String {
    ".atomgraph".to_string()
}
fn default_cache_file_name() -> String {
    "cache-index.json".to_string()
}
fn default_max_age_days() -> i64 {
    30
}
fn default_transitive_cap() -> usize {
    20
}
fn default_call_site_cap() -> usize {
    50
}
fn default_high_risk_threshold() -> usize {
    10
}
fn default_medium_risk_threshold() -> usize {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

pub struct ConfigManager {
    config: AtomGraphConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Loads `<project_root>/.atomgraph.toml`, then `~/.atomgraph/config.toml`,
    /// then defaults; applies `ATOMGRAPH_*` overrides and validates.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        let (config, config_path) = Self::load_config_file(project_root)?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        match config_path {
            Some(ref path) => info!("Configuration loaded from {}", path.display()),
            None => info!("No config file found, using defaults"),
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn from_config(config: AtomGraphConfig) -> Result<Self, ConfigError> {
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: None,
        })
    }

    fn load_config_file(
        project_root: &Path,
    ) -> Result<(AtomGraphConfig, Option<PathBuf>), ConfigError> {
        let local_config = project_root.join(".atomgraph.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(&local_config)?;
            return Ok((config, Some(local_config)));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".atomgraph").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((AtomGraphConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<AtomGraphConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: AtomGraphConfig) -> AtomGraphConfig {
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }
        if let Ok(level) = std::env::var("ATOMGRAPH_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(value) = std::env::var("ATOMGRAPH_MAX_CONCURRENT") {
            match value.parse() {
                Ok(n) => config.workers.max_concurrent_analyses = n,
                Err(_) => warn!("Ignoring ATOMGRAPH_MAX_CONCURRENT={}", value),
            }
        }
        if let Ok(value) = std::env::var("ATOMGRAPH_BATCH_SIZE") {
            match value.parse() {
                Ok(n) => config.queue.batch_size = n,
                Err(_) => warn!("Ignoring ATOMGRAPH_BATCH_SIZE={}", value),
            }
        }
        if let Ok(value) = std::env::var("ATOMGRAPH_DEEP_ANALYZER") {
            config.deep_analyzer.enabled = value.to_lowercase() == "true" || value == "1";
        }
        if let Ok(value) = std::env::var("ATOMGRAPH_DEEP_TIMEOUT_SECS") {
            match value.parse() {
                Ok(n) => config.deep_analyzer.timeout_secs = n,
                Err(_) => warn!("Ignoring ATOMGRAPH_DEEP_TIMEOUT_SECS={}", value),
            }
        }
        if let Ok(value) = std::env::var("ATOMGRAPH_CACHE_MAX_AGE_DAYS") {
            match value.parse() {
                Ok(n) => config.cache.max_age_days = n,
                Err(_) => warn!("Ignoring ATOMGRAPH_CACHE_MAX_AGE_DAYS={}", value),
            }
        }
        config
    }

    fn validate_config(config: &AtomGraphConfig) -> Result<(), ConfigError> {
        let fusion = &config.fusion;
        if !(fusion.medium_threshold <= fusion.strong_threshold
            && fusion.strong_threshold <= fusion.critical_threshold)
        {
            return Err(ConfigError::ValidationError(
                "category thresholds must satisfy medium <= strong <= critical".to_string(),
            ));
        }
        if fusion.max_weight <= 0.0 || fusion.max_boost < 1.0 {
            return Err(ConfigError::ValidationError(
                "max_weight must be positive and max_boost at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&fusion.broken_penalty) {
            return Err(ConfigError::ValidationError(
                "broken_penalty must be within [0, 1]".to_string(),
            ));
        }

        let gates = &config.gates;
        for (name, value) in [
            ("min_coverage", gates.min_coverage),
            ("safe_coverage", gates.safe_coverage),
            ("semantic_confidence", gates.semantic_confidence),
            ("high_coverage", gates.high_coverage),
            ("risk_confidence", gates.risk_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "gates.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if config.queue.batch_size == 0 || config.queue.max_batches == 0 {
            return Err(ConfigError::ValidationError(
                "queue batch_size and max_batches must be non-zero".to_string(),
            ));
        }
        if config.workers.max_concurrent_analyses == 0 {
            return Err(ConfigError::ValidationError(
                "workers.max_concurrent_analyses must be non-zero".to_string(),
            ));
        }
        if config.cache.max_age_days < 0 {
            return Err(ConfigError::ValidationError(format!(
                "cache.max_age_days must not be negative, got {}",
                config.cache.max_age_days
            )));
        }
        if config.deep_analyzer.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "deep_analyzer.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn config(&self) -> &AtomGraphConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn into_config(self) -> AtomGraphConfig {
        self.config
    }
}
