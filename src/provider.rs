use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HealthResult;
use crate::tier::Tier;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Observability fields refreshed on every evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub last_health_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_late_rate: f64,
    #[serde(default)]
    pub last_cancel_rate: f64,
    #[serde(default)]
    pub last_order_sample_size: u32,
    pub last_promotion_at: Option<DateTime<Utc>>,
    pub last_demotion_at: Option<DateTime<Utc>>,
}

/// Provider profile as read from and written back to the provider store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderState {
    pub id: ProviderId,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "default_health_score")]
    pub health_score: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: ProviderStats,
    /// Optimistic concurrency token, bumped by the store on every save
    #[serde(default)]
    pub version: u64,
}

fn default_active() -> bool { true }
fn default_health_score() -> f64 { 100.0 }

impl ProviderState {
    /// Freshly onboarded provider
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ProviderId(id.into()),
            tier: Tier::Bronze,
            is_active: true,
            health_score: default_health_score(),
            created_at,
            stats: ProviderStats::default(),
            version: 0,
        }
    }

    /// Most recent of last promotion, last demotion and creation
    pub fn tier_anchor(&self) -> DateTime<Utc> {
        [self.stats.last_promotion_at, self.stats.last_demotion_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, |acc, t| acc.max(t))
    }

    /// Fractional days spent in the current tier as of `now`
    pub fn days_in_tier(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.tier_anchor()).num_seconds().max(0);
        secs as f64 / 86_400.0
    }
}

/// Provider profile persistence
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Load the given providers; ids unknown to the store are simply absent
    async fn find_by_ids(&self, ids: &[ProviderId]) -> HealthResult<Vec<ProviderState>>;

    /// Persist `state` if the stored version still equals `state.version`.
    ///
    /// Returns the stored state with its bumped version, or
    /// `HealthError::VersionConflict` when someone else wrote first.
    async fn save(&self, state: &ProviderState) -> HealthResult<ProviderState>;
}
