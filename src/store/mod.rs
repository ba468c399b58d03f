//! Collaborator implementations
//!
//! - file:   JSON files on disk, used by the binary
//! - memory: DashMap / RwLock backed, used by tests

use async_trait::async_trait;

use crate::config::TierRuleConfig;
use crate::error::{HealthError, HealthResult};
use crate::provider::ProviderState;
use crate::tier::{TierRule, TierRuleSource};

pub mod file;
#[cfg(test)]
pub mod memory;

/// Fixed rule table, e.g. the `[[tiers]]` section of the config file
pub struct StaticTierRuleSource {
    rules: Vec<TierRule>,
}

impl StaticTierRuleSource {
    pub fn new(rules: Vec<TierRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(tiers: &[TierRuleConfig]) -> Self {
        Self::new(tiers.iter().map(TierRule::from).collect())
    }
}

#[async_trait]
impl TierRuleSource for StaticTierRuleSource {
    async fn list_rules(&self) -> HealthResult<Vec<TierRule>> {
        Ok(self.rules.clone())
    }
}

/// Optimistic concurrency check shared by the provider stores.
///
/// Returns the state to store (with its version bumped) if `incoming` was
/// derived from the currently stored version.
pub(crate) fn next_version(
    stored: Option<&ProviderState>,
    incoming: &ProviderState,
) -> HealthResult<ProviderState> {
    let stored = stored
        .ok_or_else(|| HealthError::Store(format!("unknown provider {}", incoming.id)))?;
    if stored.version != incoming.version {
        return Err(HealthError::VersionConflict {
            provider_id: incoming.id.clone(),
            expected: incoming.version,
            found: stored.version,
        });
    }
    let mut next = incoming.clone();
    next.version += 1;
    Ok(next)
}
