use serde::Deserialize;

use crate::tier::{PromotionCriteria, Tier, TierRule};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub tiers: Vec<TierRuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Trailing window for order metrics
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    /// Cancellation rate above which an active provider is suspended
    #[serde(default = "default_suspension_cancel_rate")]
    pub suspension_cancel_rate: f64,
    #[serde(default = "default_suspension_points")]
    pub suspension_points: i32,
    /// Max providers evaluated concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Timeout for each of the two upstream loads (metrics, tier rules)
    #[serde(default = "default_source_timeout")]
    pub source_timeout_secs: u64,
    /// No new providers are dispatched once a run exceeds this
    #[serde(default = "default_run_budget")]
    pub run_budget_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            suspension_cancel_rate: default_suspension_cancel_rate(),
            suspension_points: default_suspension_points(),
            max_concurrency: default_max_concurrency(),
            source_timeout_secs: default_source_timeout(),
            run_budget_secs: default_run_budget(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// false = run once and exit
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    pub orders_path: String,
    pub providers_path: String,
    pub infractions_path: String,
}

/// One row of the `[[tiers]]` table
#[derive(Debug, Deserialize, Clone)]
pub struct TierRuleConfig {
    pub tier: Tier,
    pub min_health_score: f64,
    pub max_late_rate: f64,
    #[serde(default)]
    pub min_days_in_tier: u32,
}

impl From<&TierRuleConfig> for TierRule {
    fn from(c: &TierRuleConfig) -> Self {
        TierRule {
            tier: c.tier,
            promotion_criteria: PromotionCriteria {
                min_health_score: c.min_health_score,
                max_late_rate: c.max_late_rate,
                min_days_in_tier: c.min_days_in_tier,
            },
        }
    }
}

// Default value functions
fn default_window_days() -> u32 { 30 }
fn default_suspension_cancel_rate() -> f64 { 0.20 }
fn default_suspension_points() -> i32 { 25 }
fn default_max_concurrency() -> usize { 8 }
fn default_source_timeout() -> u64 { 60 }
fn default_run_budget() -> u64 { 3600 }
fn default_interval() -> u64 { 86400 }

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.engine.max_concurrency == 0 {
            return Err(anyhow::anyhow!("engine.max_concurrency must be at least 1"));
        }
        Ok(config)
    }
}
