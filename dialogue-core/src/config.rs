//! Builder and state configuration.
//!
//! Configuration is supplied by whatever layer drives the builder. It can be
//! constructed in code with the `with_*` methods, loaded from a JSON file,
//! and overridden from `DIALOGUE_*` environment variables (a `.env` file is
//! honored).

use crate::state::{TimeWindow, DEFAULT_FATIGUE_CAP};
use crate::validator::Thresholds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// State hashing, quantization and bound settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Bucket size for PR/GR during approximate matching.
    pub meter_bucket: i32,

    /// Bucket size (minutes) for the clock during approximate matching.
    pub clock_bucket_minutes: u16,

    /// Only flags with this prefix take part in approximate matching.
    pub key_flag_prefix: String,

    /// How many sorted inventory items take part in approximate matching.
    pub inventory_sample: usize,

    /// A true flag with one of these prefixes marks an ending.
    pub ending_flag_prefixes: Vec<String>,

    /// Upper bound of world fatigue.
    pub fatigue_cap: i32,

    /// Window the clock is confined to.
    pub time_window: TimeWindow,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            meter_bucket: 5,
            clock_bucket_minutes: 10,
            key_flag_prefix: "key_".to_string(),
            inventory_sample: 3,
            ending_flag_prefixes: vec!["结局_".to_string(), "ending_".to_string()],
            fatigue_cap: DEFAULT_FATIGUE_CAP,
            time_window: TimeWindow::default(),
        }
    }
}

/// How the frontier is worked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpansionStrategy {
    /// Plain FIFO breadth-first expansion.
    #[default]
    BreadthFirst,
    /// Breadth-first, but every `trim_every` dequeues the queue is cut down
    /// to the `width` highest-scoring entries.
    Beam { width: usize, trim_every: usize },
}

/// Settings for a tree build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Nodes at this depth are never expanded.
    pub max_depth: usize,

    /// Required number of choices along the longest path.
    pub min_main_path_depth: usize,

    /// Required estimated play time along the longest path.
    pub min_duration_minutes: f64,

    /// Required number of ending nodes.
    pub min_endings: usize,

    /// Children per node when no blueprint says otherwise.
    pub max_branches_per_node: usize,

    /// Concurrent generator requests per expansion step.
    pub worker_pool_width: usize,

    /// Hard ceiling on tree size.
    pub max_nodes: usize,

    /// Extension rounds allowed after the first pass.
    pub max_extension_attempts: u32,

    /// Consecutive non-improving passes that end extension.
    pub plateau_limit: u32,

    /// Estimated reading/decision time per choice.
    pub seconds_per_choice: f64,

    /// Write a checkpoint after this many new nodes.
    pub checkpoint_every: usize,

    /// Where to write checkpoints; no checkpoints when unset.
    pub checkpoint_path: Option<PathBuf>,

    /// Also keep a numbered copy of every checkpoint.
    pub checkpoint_history: bool,

    /// Where to append JSONL progress events; no log when unset.
    pub progress_log_path: Option<PathBuf>,

    /// Upper bound on a single generator call, in milliseconds.
    pub generation_timeout_ms: u64,

    pub strategy: ExpansionStrategy,

    /// Try advancing choices before the others.
    pub prefer_advancing: bool,

    pub state: StateConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_depth: 12,
            min_main_path_depth: 8,
            min_duration_minutes: 2.0,
            min_endings: 2,
            max_branches_per_node: 3,
            worker_pool_width: 4,
            max_nodes: 500,
            max_extension_attempts: 5,
            plateau_limit: 2,
            seconds_per_choice: 15.0,
            checkpoint_every: 10,
            checkpoint_path: None,
            checkpoint_history: false,
            progress_log_path: None,
            generation_timeout_ms: 60_000,
            strategy: ExpansionStrategy::BreadthFirst,
            prefer_advancing: false,
            state: StateConfig::default(),
        }
    }
}

impl BuilderConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// Defaults overridden by `DIALOGUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Recognized keys: `DIALOGUE_MAX_DEPTH`, `DIALOGUE_MIN_DEPTH`,
    /// `DIALOGUE_MIN_DURATION_MINUTES`, `DIALOGUE_MIN_ENDINGS`,
    /// `DIALOGUE_MAX_BRANCHES`, `DIALOGUE_WORKERS`, `DIALOGUE_MAX_NODES`,
    /// `DIALOGUE_EXTENSION_ATTEMPTS`, `DIALOGUE_PLATEAU_LIMIT`,
    /// `DIALOGUE_CHECKPOINT_EVERY`, `DIALOGUE_CHECKPOINT_PATH`,
    /// `DIALOGUE_PROGRESS_LOG`, `DIALOGUE_TIMEOUT_MS`.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                })
        }

        macro_rules! override_field {
            ($key:literal => $field:expr) => {
                if let Some(value) = lookup($key) {
                    $field = parse($key, value)?;
                }
            };
        }

        override_field!("DIALOGUE_MAX_DEPTH" => self.max_depth);
        override_field!("DIALOGUE_MIN_DEPTH" => self.min_main_path_depth);
        override_field!("DIALOGUE_MIN_DURATION_MINUTES" => self.min_duration_minutes);
        override_field!("DIALOGUE_MIN_ENDINGS" => self.min_endings);
        override_field!("DIALOGUE_MAX_BRANCHES" => self.max_branches_per_node);
        override_field!("DIALOGUE_WORKERS" => self.worker_pool_width);
        override_field!("DIALOGUE_MAX_NODES" => self.max_nodes);
        override_field!("DIALOGUE_EXTENSION_ATTEMPTS" => self.max_extension_attempts);
        override_field!("DIALOGUE_PLATEAU_LIMIT" => self.plateau_limit);
        override_field!("DIALOGUE_CHECKPOINT_EVERY" => self.checkpoint_every);
        override_field!("DIALOGUE_TIMEOUT_MS" => self.generation_timeout_ms);

        if let Some(path) = lookup("DIALOGUE_CHECKPOINT_PATH") {
            self.checkpoint_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("DIALOGUE_PROGRESS_LOG") {
            self.progress_log_path = Some(PathBuf::from(path));
        }

        Ok(self)
    }

    /// Reject settings the builder cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_branches_per_node == 0 {
            return Err(ConfigError::Zero("max_branches_per_node"));
        }
        if self.worker_pool_width == 0 {
            return Err(ConfigError::Zero("worker_pool_width"));
        }
        if self.max_nodes == 0 {
            return Err(ConfigError::Zero("max_nodes"));
        }
        if self.checkpoint_every == 0 {
            return Err(ConfigError::Zero("checkpoint_every"));
        }
        if self.generation_timeout_ms == 0 {
            return Err(ConfigError::Zero("generation_timeout_ms"));
        }
        if self.state.meter_bucket < 1 {
            return Err(ConfigError::Zero("state.meter_bucket"));
        }
        if let ExpansionStrategy::Beam { width, trim_every } = self.strategy {
            if width == 0 {
                return Err(ConfigError::Zero("strategy.width"));
            }
            if trim_every == 0 {
                return Err(ConfigError::Zero("strategy.trim_every"));
            }
        }
        Ok(())
    }

    /// Per-call generator timeout.
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    /// Thresholds for strict (non-guided) builds.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            min_depth: self.min_main_path_depth,
            min_duration_minutes: self.min_duration_minutes,
            min_endings: self.min_endings,
        }
    }

    /// Set the maximum depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set the structural thresholds.
    pub fn with_thresholds(mut self, min_depth: usize, min_duration: f64, min_endings: usize) -> Self {
        self.min_main_path_depth = min_depth;
        self.min_duration_minutes = min_duration;
        self.min_endings = min_endings;
        self
    }

    /// Set the default branching factor.
    pub fn with_max_branches(mut self, branches: usize) -> Self {
        self.max_branches_per_node = branches;
        self
    }

    /// Set the worker pool width.
    pub fn with_workers(mut self, width: usize) -> Self {
        self.worker_pool_width = width;
        self
    }

    /// Set the node ceiling.
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    /// Set the extension limits.
    pub fn with_extension_limits(mut self, attempts: u32, plateau_limit: u32) -> Self {
        self.max_extension_attempts = attempts;
        self.plateau_limit = plateau_limit;
        self
    }

    /// Enable checkpointing.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>, every: usize) -> Self {
        self.checkpoint_path = Some(path.into());
        self.checkpoint_every = every;
        self
    }

    /// Keep numbered copies of every checkpoint.
    pub fn with_checkpoint_history(mut self, keep: bool) -> Self {
        self.checkpoint_history = keep;
        self
    }

    /// Enable the JSONL progress log.
    pub fn with_progress_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_log_path = Some(path.into());
        self
    }

    /// Set the per-call generator timeout, kept to the millisecond.
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Set the expansion strategy.
    pub fn with_strategy(mut self, strategy: ExpansionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Prefer advancing choices when selecting children.
    pub fn with_prefer_advancing(mut self, prefer: bool) -> Self {
        self.prefer_advancing = prefer;
        self
    }

    /// Replace the state settings.
    pub fn with_state_config(mut self, state: StateConfig) -> Self {
        self.state = state;
        self
    }
}
