//! Configuration management
//!
//! Configuration is resolved in this order (later wins):
//! 1. built-in defaults
//! 2. `overseer.toml`
//! 3. environment variables
//!
//! `${VAR_NAME}` inside the TOML file is replaced with the value of the
//! environment variable before parsing.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Error;
use crate::router::ExecutionTier;

/// Main configuration for the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub supervisor: SupervisorConfig,
    pub learning: LearningConfig,
    pub patterns: PatternConfig,
    pub router: RouterConfig,
    pub api: ApiConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "data/overseer.db".to_string(),
        }
    }
}

/// Job supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory holding job manifests, logs and worker artifacts
    pub jobs_dir: PathBuf,
    /// Lines kept in each job's in-memory log ring
    pub log_ring_lines: usize,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout_secs: u64,
    /// Upper bound on concurrently running jobs (None = unbounded)
    pub max_concurrent_jobs: Option<usize>,
    /// Interval for re-checking jobs adopted from a previous run
    pub reconcile_interval_secs: u64,
    /// Worker executable per workflow kind
    pub workers: WorkflowExecutables,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("data/jobs"),
            log_ring_lines: 500,
            stop_timeout_secs: 10,
            max_concurrent_jobs: None,
            reconcile_interval_secs: 60,
            workers: WorkflowExecutables::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowExecutables {
    pub repository_edit: Option<PathBuf>,
    pub content_writing: Option<PathBuf>,
    pub research: Option<PathBuf>,
}

/// Decision-engine thresholds. These are tunables, not laws.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub kill_consecutive_failures: u32,
    pub double_down_success_rate: f64,
    pub min_sample_size: u32,
    pub stagnant_success_rate: f64,
    /// Session success rate at or above which a success pattern is registered
    pub session_success_rate: f64,
    /// Session success rate below which a failure pattern is registered
    pub session_failure_rate: f64,
    pub agent_double_down_rate: f64,
    pub agent_investigate_rate: f64,
    pub agent_investigate_min_tasks: u32,
    pub rewards: RewardConfig,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            kill_consecutive_failures: 3,
            double_down_success_rate: 0.90,
            min_sample_size: 5,
            stagnant_success_rate: 0.30,
            session_success_rate: 0.90,
            session_failure_rate: 0.50,
            agent_double_down_rate: 0.90,
            agent_investigate_rate: 0.50,
            agent_investigate_min_tasks: 5,
            rewards: RewardConfig::default(),
        }
    }
}

/// Reward amounts issued by the learning controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub task_completed: i64,
    pub task_failed: i64,
    pub session_completed: i64,
    /// Completed session that produced a pull request
    pub session_merged: i64,
    pub session_blocked: i64,
    pub session_failed: i64,
    pub experiment_killed: i64,
    pub experiment_double_down: i64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            task_completed: 10,
            task_failed: -5,
            session_completed: 50,
            session_merged: 100,
            session_blocked: -10,
            session_failed: -25,
            experiment_killed: -20,
            experiment_double_down: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Trailing window for command repetition analysis
    pub window_days: i64,
    /// Occurrences of one intent needed to propose an automation candidate
    pub min_repetitions: u32,
    pub actionable_min_detections: u32,
    pub success_confidence_floor: f64,
    pub failure_confidence_floor: f64,
    pub initial_confidence: f64,
    pub confidence_step: f64,
    pub candidate_confidence_per_occurrence: f64,
    pub max_sample_commands: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            min_repetitions: 3,
            actionable_min_detections: 3,
            success_confidence_floor: 0.7,
            failure_confidence_floor: 0.6,
            initial_confidence: 0.5,
            confidence_step: 0.1,
            candidate_confidence_per_occurrence: 0.2,
            max_sample_commands: 5,
        }
    }
}

/// Unit prices in currency units per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPricing {
    pub premium: TierPrice,
    pub balanced: TierPrice,
    pub fast: TierPrice,
    pub local: TierPrice,
}

impl TierPricing {
    pub fn price(&self, tier: ExecutionTier) -> TierPrice {
        match tier {
            ExecutionTier::Premium => self.premium,
            ExecutionTier::Balanced => self.balanced,
            ExecutionTier::Fast => self.fast,
            ExecutionTier::Local => self.local,
        }
    }
}

impl Default for TierPricing {
    fn default() -> Self {
        Self {
            premium: TierPrice {
                input_per_million: 15.0,
                output_per_million: 75.0,
            },
            balanced: TierPrice {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
            fast: TierPrice {
                input_per_million: 0.8,
                output_per_million: 4.0,
            },
            local: TierPrice {
                input_per_million: 0.0,
                output_per_million: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBuckets {
    pub low: TokenEstimate,
    pub medium: TokenEstimate,
    pub high: TokenEstimate,
}

impl Default for TokenBuckets {
    fn default() -> Self {
        Self {
            low: TokenEstimate {
                input: 1_000,
                output: 500,
            },
            medium: TokenEstimate {
                input: 4_000,
                output: 2_000,
            },
            high: TokenEstimate {
                input: 16_000,
                output: 8_000,
            },
        }
    }
}

/// Domain routing rule for one team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRoute {
    pub team: String,
    pub keywords: Vec<String>,
    /// Agent used when no specialist matches
    #[serde(default)]
    pub generalist: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub pricing: TierPricing,
    pub token_buckets: TokenBuckets,
    pub teams: Vec<TeamRoute>,
    /// Team used when no domain keyword matches
    pub default_team: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            pricing: TierPricing::default(),
            token_buckets: TokenBuckets::default(),
            teams: vec![
                TeamRoute {
                    team: "engineering".to_string(),
                    keywords: words(&[
                        "code", "bug", "fix", "refactor", "api", "test", "deploy", "build",
                        "database", "frontend", "backend", "repository", "migration", "feature",
                    ]),
                    generalist: Some("engineer".to_string()),
                },
                TeamRoute {
                    team: "marketing".to_string(),
                    keywords: words(&[
                        "campaign", "content", "seo", "social", "lead", "newsletter", "blog",
                        "copy", "brand", "email", "landing",
                    ]),
                    generalist: Some("marketer".to_string()),
                },
                TeamRoute {
                    team: "research".to_string(),
                    keywords: words(&[
                        "research", "investigate", "compare", "survey", "analyze", "analysis",
                        "benchmark", "evaluate", "competitor", "market",
                    ]),
                    generalist: Some("researcher".to_string()),
                },
            ],
            default_team: "engineering".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API key for HTTP API authentication
    pub key: Option<String>,

    /// Port for HTTP API server
    pub port: u16,

    /// Allowed CORS origins. Empty means permissive.
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: None,
            port: 3000,
            allowed_origins: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether background maintenance runs at all
    pub enabled: bool,

    /// Path to the maintenance schedule file
    pub config_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_path: None,
        }
    }
}

impl Config {
    /// Replace `${VAR_NAME}` with the variable's value (empty when unset).
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();

                let mut var_name = String::new();
                while let Some(c) = chars.next() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Parse configuration from TOML text (after env expansion).
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded = Self::expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&content)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `./overseer.toml` when present, otherwise defaults + environment.
    pub fn load() -> crate::Result<Self> {
        if Path::new("overseer.toml").exists() {
            return Self::from_toml_file("overseer.toml");
        }

        Self::from_env()
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> crate::Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("OVERSEER_DB_PATH") {
            if !path.is_empty() {
                self.store.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("OVERSEER_JOBS_DIR") {
            if !dir.is_empty() {
                self.supervisor.jobs_dir = PathBuf::from(dir);
            }
        }
        if let Ok(max) = std::env::var("OVERSEER_MAX_JOBS") {
            if let Ok(n) = max.parse::<usize>() {
                self.supervisor.max_concurrent_jobs = (n > 0).then_some(n);
            }
        }

        let workers = [
            ("OVERSEER_WORKER_REPOSITORY_EDIT", &mut self.supervisor.workers.repository_edit),
            ("OVERSEER_WORKER_CONTENT", &mut self.supervisor.workers.content_writing),
            ("OVERSEER_WORKER_RESEARCH", &mut self.supervisor.workers.research),
        ];
        for (var, slot) in workers {
            if let Ok(path) = std::env::var(var) {
                if !path.is_empty() {
                    *slot = Some(PathBuf::from(path));
                }
            }
        }

        if let Ok(key) = std::env::var("API_KEY") {
            if !key.is_empty() {
                self.api.key = Some(key);
            }
        }
        if let Ok(port) = std::env::var("API_PORT") {
            if let Ok(p) = port.parse() {
                self.api.port = p;
            }
        }
        if let Ok(origins) = std::env::var("API_ALLOWED_ORIGINS") {
            self.api.allowed_origins =
                Some(origins.split(',').map(|s| s.trim().to_string()).collect());
        }

        if let Ok(enabled) = std::env::var("SCHEDULE_ENABLED") {
            self.scheduler.enabled = enabled.to_lowercase() != "false";
        }
        if let Ok(path) = std::env::var("SCHEDULE_CONFIG_PATH") {
            self.scheduler.config_path = Some(path);
        }
    }

    /// Reject values that would make the decision policies meaningless.
    pub fn validate(&self) -> crate::Result<()> {
        let rates = [
            ("learning.double_down_success_rate", self.learning.double_down_success_rate),
            ("learning.stagnant_success_rate", self.learning.stagnant_success_rate),
            ("patterns.success_confidence_floor", self.patterns.success_confidence_floor),
            ("patterns.failure_confidence_floor", self.patterns.failure_confidence_floor),
        ];
        for (name, value) in rates {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if self.learning.kill_consecutive_failures == 0 {
            return Err(Error::Config(
                "learning.kill_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.patterns.min_repetitions == 0 {
            return Err(Error::Config("patterns.min_repetitions must be at least 1".to_string()));
        }
        if self.supervisor.log_ring_lines == 0 {
            return Err(Error::Config("supervisor.log_ring_lines must be at least 1".to_string()));
        }
        Ok(())
    }
}
