//! Layered configuration for the Shipmate kernel.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment variables prefixed `SHIPMATE_`.
//! Every recognized option is an enumerated field; unknown keys in the
//! skills config file produce warnings, never silent acceptance.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShipmateConfig {
    /// Directory holding the database, state sidecars, and audio artifacts.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub owner: OwnerConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// The single operator this bot serves.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OwnerConfig {
    /// Owner user id on the chat platform.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Fallback chat for notifications with no routed destination.
    #[serde(default)]
    pub fallback_chat_id: Option<String>,
}

/// Skill discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directory whose immediate subdirectories each hold one skill.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Companion JSON with `enabled`, `disabled`, and per-skill `config`.
    #[serde(default)]
    pub config_file: Option<PathBuf>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            config_file: None,
        }
    }
}

/// Natural-language router tunables. All live-adjustable at runtime; these
/// are the boot values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Confidence below this flags a classification as ambiguous. [0, 1]
    pub ambiguity_threshold: f64,
    /// Confidence below this triggers clarifying questions. [0, 1]
    pub clarification_threshold: f64,
    /// Classifier deadline in milliseconds. 500–30000.
    pub ai_timeout_ms: u64,
    /// Classification cache entry cap. 10–10000.
    pub cache_max_size: usize,
    /// Classification cache TTL in milliseconds. 0–3600000.
    pub cache_max_age_ms: u64,
    /// Confidence composition weights.
    #[serde(default)]
    pub weights: ConfidenceWeights,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ambiguity_threshold: 0.5,
            clarification_threshold: 0.35,
            ai_timeout_ms: 5_000,
            cache_max_size: 500,
            cache_max_age_ms: 300_000,
            weights: ConfidenceWeights::default(),
        }
    }
}

/// Weights composing the router confidence score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub keyword_match: f64,
    pub context_match: f64,
    pub history_match: f64,
    pub specificity: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            keyword_match: 0.4,
            context_match: 0.3,
            history_match: 0.2,
            specificity: 0.1,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool size for job execution.
    pub pool_size: usize,
    /// Tick interval in seconds.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            tick_secs: 30,
        }
    }
}

/// One whitelisted subprocess command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    /// Execution timeout in seconds.
    pub timeout_secs: u64,
    /// Whether the command needs an explicit confirm before running.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Shown in audit entries and rejections.
    #[serde(default)]
    pub description: String,
}

/// Orchestrator configuration: projects, health checks, whitelist, limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Confirmation TTL in seconds for deploys and rollbacks.
    pub confirmation_ttl_secs: u64,
    /// Max characters of subprocess output delivered to chat.
    pub output_chat_limit: usize,
    /// Max characters of raw output retained in audit extras.
    pub output_audit_limit: usize,
    /// Verify-stage timeout in seconds.
    pub verify_timeout_secs: u64,
    /// Settling delay before probing a freshly extracted preview URL.
    pub preview_settle_secs: u64,
    /// Argv of the test stage, run in the project directory.
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    /// Argv of the deploy stage.
    #[serde(default = "default_deploy_command")]
    pub deploy_command: Vec<String>,
    /// Project name -> absolute working-tree path.
    #[serde(default)]
    pub projects: BTreeMap<String, PathBuf>,
    /// Repo -> health endpoint probed by the verify stage.
    #[serde(default)]
    pub health_urls: BTreeMap<String, String>,
    /// Command head -> whitelist entry. Anything absent is rejected.
    #[serde(default = "default_whitelist")]
    pub whitelist: BTreeMap<String, WhitelistEntry>,
}

fn default_whitelist() -> BTreeMap<String, WhitelistEntry> {
    let mut wl = BTreeMap::new();
    wl.insert(
        "npm".to_string(),
        WhitelistEntry {
            timeout_secs: 180,
            requires_confirmation: false,
            description: "package scripts (test, run, install)".into(),
        },
    );
    wl.insert(
        "git".to_string(),
        WhitelistEntry {
            timeout_secs: 60,
            requires_confirmation: false,
            description: "source control operations".into(),
        },
    );
    wl.insert(
        "vercel".to_string(),
        WhitelistEntry {
            timeout_secs: 180,
            requires_confirmation: true,
            description: "production deploys".into(),
        },
    );
    wl.insert(
        "pm2".to_string(),
        WhitelistEntry {
            timeout_secs: 60,
            requires_confirmation: true,
            description: "service restarts".into(),
        },
    );
    wl
}

fn default_test_command() -> Vec<String> {
    vec!["npm".into(), "test".into()]
}

fn default_deploy_command() -> Vec<String> {
    vec!["npm".into(), "run".into(), "deploy".into()]
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confirmation_ttl_secs: 300,
            output_chat_limit: 3_000,
            output_audit_limit: 20_000,
            verify_timeout_secs: 15,
            preview_settle_secs: 5,
            test_command: default_test_command(),
            deploy_command: default_deploy_command(),
            projects: BTreeMap::new(),
            health_urls: BTreeMap::new(),
            whitelist: default_whitelist(),
        }
    }
}

/// One provider/model pricing row, USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Cost accounting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Monthly budget in USD, if set.
    #[serde(default)]
    pub monthly_budget: Option<f64>,
    /// Ring capacity for cost entries.
    pub ring_capacity: usize,
    /// Providers considered free tier by the optimizer.
    #[serde(default = "default_free_providers")]
    pub free_providers: Vec<String>,
    /// "provider/model" -> rate. Unlisted models record at zero cost.
    #[serde(default = "default_rates")]
    pub rates: BTreeMap<String, CostRate>,
}

fn default_rates() -> BTreeMap<String, CostRate> {
    let mut rates = BTreeMap::new();
    rates.insert(
        "anthropic/claude-sonnet-4-20250514".to_string(),
        CostRate {
            input_per_million: 3.0,
            output_per_million: 15.0,
        },
    );
    rates.insert(
        "anthropic/claude-3-5-haiku-20241022".to_string(),
        CostRate {
            input_per_million: 0.8,
            output_per_million: 4.0,
        },
    );
    rates.insert(
        "groq/llama-3.3-70b-versatile".to_string(),
        CostRate {
            input_per_million: 0.0,
            output_per_million: 0.0,
        },
    );
    rates.insert(
        "groq/whisper-large-v3".to_string(),
        CostRate {
            input_per_million: 0.0,
            output_per_million: 0.0,
        },
    );
    rates
}

fn default_free_providers() -> Vec<String> {
    vec!["groq".to_string()]
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            monthly_budget: None,
            ring_capacity: 1_000,
            free_providers: default_free_providers(),
            rates: default_rates(),
        }
    }
}

/// Inbound webhook verification.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    /// Shared HMAC-SHA256 secret. Unset disables signature verification.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `SHIPMATE_`, `__` section split)
/// 2. Workspace-local config (`.shipmate/config.toml` under `workspace`)
/// 3. User config (`~/.config/shipmate/config.toml`)
/// 4. Built-in defaults
pub fn load_config(workspace: Option<&Path>) -> Result<ShipmateConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ShipmateConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "shipmate", "shipmate") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".shipmate").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("SHIPMATE_").split("__"));

    figment.extract().map_err(Box::new)
}

impl ShipmateConfig {
    /// Resolve the data directory, defaulting to the platform data dir.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "shipmate", "shipmate")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".shipmate"))
    }

    /// Path of the SQLite database file.
    pub fn store_path(&self) -> PathBuf {
        self.resolved_data_dir().join("shipmate.db")
    }

    /// Directory for meeting/voice audio artifacts.
    pub fn audio_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("audio")
    }
}
