use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HealthError, HealthResult};

/// Provider service tier, ordered BRONZE < SILVER < GOLD < PLATINUM
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    #[default]
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Bronze, Tier::Silver, Tier::Gold, Tier::Platinum];

    pub fn rank(self) -> u8 {
        match self {
            Tier::Bronze => 0,
            Tier::Silver => 1,
            Tier::Gold => 2,
            Tier::Platinum => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Tier> {
        Self::ALL.get(rank as usize).copied()
    }

    /// One rank up, None at the top
    pub fn next(self) -> Option<Tier> {
        Self::from_rank(self.rank() + 1)
    }

    /// One rank down, None at the bottom
    pub fn prev(self) -> Option<Tier> {
        self.rank().checked_sub(1).and_then(Self::from_rank)
    }

    pub fn name(self) -> &'static str {
        match self {
            Tier::Bronze => "BRONZE",
            Tier::Silver => "SILVER",
            Tier::Gold => "GOLD",
            Tier::Platinum => "PLATINUM",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What it takes to enter a tier from the one below it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PromotionCriteria {
    pub min_health_score: f64,
    /// 0.0 - 1.0
    pub max_late_rate: f64,
    pub min_days_in_tier: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub tier: Tier,
    pub promotion_criteria: PromotionCriteria,
}

/// Immutable rule snapshot shared by every evaluation in a run.
///
/// A tier without a rule has transitions into and out of it disabled.
#[derive(Debug, Clone, Default)]
pub struct TierRules {
    rules: BTreeMap<Tier, PromotionCriteria>,
}

impl TierRules {
    pub fn from_rules(rules: Vec<TierRule>) -> HealthResult<Self> {
        let mut map = BTreeMap::new();
        for rule in rules {
            let late = rule.promotion_criteria.max_late_rate;
            if !(0.0..=1.0).contains(&late) {
                return Err(HealthError::InvalidLateRate { tier: rule.tier, value: late });
            }
            if map.insert(rule.tier, rule.promotion_criteria).is_some() {
                return Err(HealthError::DuplicateTierRule(rule.tier));
            }
        }
        Ok(Self { rules: map })
    }

    pub fn get(&self, tier: Tier) -> Option<&PromotionCriteria> {
        self.rules.get(&tier)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Source of the per-tier promotion rules
#[async_trait]
pub trait TierRuleSource: Send + Sync {
    async fn list_rules(&self) -> HealthResult<Vec<TierRule>>;
}

/// The single tier move decided for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Promote { from: Tier, to: Tier },
    Demote { from: Tier, to: Tier },
    Unchanged,
}

impl Transition {
    /// Tier after applying the transition to `current`
    pub fn apply(self, current: Tier) -> Tier {
        match self {
            Transition::Promote { to, .. } | Transition::Demote { to, .. } => to,
            Transition::Unchanged => current,
        }
    }
}

/// Tier state machine
///
/// Demotion is checked first and is immediate: failing the current tier's
/// own entry criteria drops the provider one rank. Promotion additionally
/// requires `min_days_in_tier` so noisy windows don't flap the tier.
pub fn decide_transition(
    current: Tier,
    score: f64,
    late_rate: f64,
    days_in_tier: f64,
    rules: &TierRules,
) -> Transition {
    if let (Some(lower), Some(rule)) = (current.prev(), rules.get(current)) {
        if score < rule.min_health_score || late_rate > rule.max_late_rate {
            return Transition::Demote { from: current, to: lower };
        }
    }

    if let Some(upper) = current.next() {
        if let Some(rule) = rules.get(upper) {
            if score >= rule.min_health_score
                && late_rate <= rule.max_late_rate
                && days_in_tier >= rule.min_days_in_tier as f64
            {
                return Transition::Promote { from: current, to: upper };
            }
        }
    }

    Transition::Unchanged
}
