use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::HealthResult;
use crate::infraction::InfractionRecord;
use crate::metrics::ProviderMetric;
use crate::provider::ProviderState;
use crate::scorer::health_score;
use crate::tier::{decide_transition, TierRules, Transition};

/// Auto-suspension (auto-ban) parameters
#[derive(Debug, Clone)]
pub struct SuspensionPolicy {
    /// Strictly above this cancellation rate an active provider is suspended
    pub cancel_rate_threshold: f64,
    pub points_deducted: i32,
    /// Only used for the infraction note
    pub window_days: u32,
}

impl Default for SuspensionPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SuspensionPolicy {
    fn from(c: &EngineConfig) -> Self {
        Self {
            cancel_rate_threshold: c.suspension_cancel_rate,
            points_deducted: c.suspension_points,
            window_days: c.window_days,
        }
    }
}

/// Outcome of evaluating one provider against its window
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub provider: ProviderState,
    pub infraction: Option<InfractionRecord>,
    pub transition: Transition,
    pub suspended: bool,
    /// Any persisted field differs from the input profile
    pub changed: bool,
}

/// Enforcement Engine - プロバイダ1件分の判定
///
/// Pure: computes the updated profile and the infraction to emit, leaving
/// persistence to the caller. Returns `Ok(None)` for a window with no orders.
pub fn evaluate(
    provider: &ProviderState,
    metric: &ProviderMetric,
    rules: &TierRules,
    policy: &SuspensionPolicy,
    now: DateTime<Utc>,
) -> HealthResult<Option<Evaluation>> {
    if !metric.has_signal() {
        return Ok(None);
    }
    metric.validate()?;

    let (late_rate, cancel_rate) = metric.rates();
    let score = health_score(late_rate, cancel_rate);

    let mut updated = provider.clone();
    updated.health_score = score;
    updated.stats.last_health_check_at = Some(now);
    updated.stats.last_late_rate = late_rate;
    updated.stats.last_cancel_rate = cancel_rate;
    updated.stats.last_order_sample_size = metric.total_orders;

    // Auto-suspension runs before and independently of the tier decision
    let mut infraction = None;
    let suspended = cancel_rate > policy.cancel_rate_threshold && updated.is_active;
    if suspended {
        updated.is_active = false;
        updated.stats.last_demotion_at = Some(now);
        warn!(
            "🚫 Suspending {}: cancellation rate {:.1}% over {} orders",
            updated.id,
            cancel_rate * 100.0,
            metric.total_orders
        );
        infraction = Some(InfractionRecord::cancellation_suspension(
            updated.id.clone(),
            cancel_rate,
            policy.window_days,
            policy.points_deducted,
            now,
        ));
    }

    let days_in_tier = updated.days_in_tier(now);
    let transition = decide_transition(updated.tier, score, late_rate, days_in_tier, rules);
    match transition {
        Transition::Promote { from, to } => {
            updated.stats.last_promotion_at = Some(now);
            info!("⬆️ {} promoted {} -> {} (score {:.1}, {:.1} days in tier)", updated.id, from, to, score, days_in_tier);
        }
        Transition::Demote { from, to } => {
            updated.stats.last_demotion_at = Some(now);
            info!("⬇️ {} demoted {} -> {} (score {:.1}, late {:.1}%)", updated.id, from, to, score, late_rate * 100.0);
        }
        Transition::Unchanged => {}
    }
    updated.tier = transition.apply(updated.tier);

    debug!(
        "Health for {}: score {:.1} (late {:.3}, cancel {:.3}, n={})",
        updated.id, score, late_rate, cancel_rate, metric.total_orders
    );

    let changed = updated != *provider;
    Ok(Some(Evaluation {
        provider: updated,
        infraction,
        transition,
        suspended,
        changed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HealthError;
    use crate::infraction::InfractionKind;
    use crate::provider::ProviderId;
    use crate::tier::{PromotionCriteria, Tier, TierRule};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 30, 0, 0, 0).unwrap()
    }

    fn rules() -> TierRules {
        let rule = |tier, min_health_score, max_late_rate, min_days_in_tier| TierRule {
            tier,
            promotion_criteria: PromotionCriteria { min_health_score, max_late_rate, min_days_in_tier },
        };
        TierRules::from_rules(vec![
            rule(Tier::Silver, 70.0, 0.2, 7),
            rule(Tier::Gold, 85.0, 0.1, 14),
            rule(Tier::Platinum, 95.0, 0.02, 30),
        ])
        .unwrap()
    }

    fn provider(tier: Tier, days_in_tier: i64) -> ProviderState {
        let mut p = ProviderState::new("p-1", now() - Duration::days(365));
        p.tier = tier;
        p.stats.last_promotion_at = Some(now() - Duration::days(days_in_tier));
        p
    }

    fn metric(total: u32, late: u32, cancel: u32) -> ProviderMetric {
        ProviderMetric {
            provider_id: ProviderId::from("p-1"),
            total_orders: total,
            late_orders: late,
            cancel_orders: cancel,
        }
    }

    fn run(p: &ProviderState, m: &ProviderMetric) -> Evaluation {
        evaluate(p, m, &rules(), &SuspensionPolicy::default(), now()).unwrap().unwrap()
    }

    #[test]
    fn test_silver_promoted_to_gold() {
        let eval = run(&provider(Tier::Silver, 20), &metric(20, 1, 0));
        assert!((eval.provider.health_score - 90.0).abs() < 1e-9);
        assert_eq!(eval.transition, Transition::Promote { from: Tier::Silver, to: Tier::Gold });
        assert_eq!(eval.provider.tier, Tier::Gold);
        assert_eq!(eval.provider.stats.last_promotion_at, Some(now()));
        assert!(eval.infraction.is_none());
        assert!(eval.changed);
    }

    #[test]
    fn test_gold_with_heavy_cancellations_is_suspended() {
        let eval = run(&provider(Tier::Gold, 100), &metric(20, 0, 6));
        assert!(eval.suspended);
        assert!(!eval.provider.is_active);
        assert_eq!(eval.provider.stats.last_demotion_at, Some(now()));
        let infraction = eval.infraction.expect("infraction");
        assert_eq!(infraction.points_deducted, 25);
        assert_eq!(infraction.kind, InfractionKind::ProviderCancellation);
        assert!(infraction.notes.contains("30%"));
        // score 10 < 85: also demoted in the same run
        assert_eq!(eval.provider.tier, Tier::Silver);
    }

    #[test]
    fn test_suspension_independent_of_tier_outcome() {
        // BRONZE has no rule and cannot promote with score 25 -> no transition
        let eval = run(&provider(Tier::Bronze, 100), &metric(20, 0, 5));
        assert_eq!(eval.transition, Transition::Unchanged);
        assert!(eval.suspended);
        assert!(!eval.provider.is_active);
        assert!(eval.infraction.is_some());
    }

    #[test]
    fn test_threshold_is_strict() {
        let eval = run(&provider(Tier::Bronze, 100), &metric(20, 0, 4));
        assert!(!eval.suspended);
        assert!(eval.provider.is_active);
        assert!(eval.infraction.is_none());
    }

    #[test]
    fn test_already_inactive_provider_not_suspended_again() {
        let mut p = provider(Tier::Bronze, 100);
        p.is_active = false;
        let eval = run(&p, &metric(10, 0, 10));
        assert!(!eval.suspended);
        assert!(eval.infraction.is_none());
    }

    #[test]
    fn test_suspension_resets_promotion_clock() {
        // Would qualify for SILVER on score alone, but suspension stamps the demotion time
        let mut p = provider(Tier::Bronze, 100);
        p.stats.last_promotion_at = None;
        let rules = TierRules::from_rules(vec![TierRule {
            tier: Tier::Silver,
            promotion_criteria: PromotionCriteria { min_health_score: 0.0, max_late_rate: 1.0, min_days_in_tier: 1 },
        }])
        .unwrap();
        let eval = evaluate(&p, &metric(10, 0, 3), &rules, &SuspensionPolicy::default(), now())
            .unwrap()
            .unwrap();
        assert!(eval.suspended);
        assert_eq!(eval.provider.tier, Tier::Bronze);
    }

    #[test]
    fn test_stats_refreshed_without_transition() {
        let eval = run(&provider(Tier::Silver, 2), &metric(40, 2, 0));
        assert_eq!(eval.transition, Transition::Unchanged);
        assert_eq!(eval.provider.stats.last_health_check_at, Some(now()));
        assert_eq!(eval.provider.stats.last_order_sample_size, 40);
        assert!((eval.provider.stats.last_late_rate - 0.05).abs() < 1e-9);
        assert_eq!(eval.provider.stats.last_cancel_rate, 0.0);
        assert!(eval.changed);
    }

    #[test]
    fn test_reevaluation_with_same_inputs_is_unchanged() {
        let first = run(&provider(Tier::Silver, 2), &metric(40, 2, 0));
        let second = run(&first.provider, &metric(40, 2, 0));
        assert!(!second.changed);
    }

    #[test]
    fn test_zero_orders_skipped() {
        let p = provider(Tier::Gold, 10);
        let out = evaluate(&p, &metric(0, 0, 0), &rules(), &SuspensionPolicy::default(), now()).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_malformed_metric_is_error() {
        let p = provider(Tier::Gold, 10);
        let out = evaluate(&p, &metric(5, 0, 6), &rules(), &SuspensionPolicy::default(), now());
        assert!(matches!(out, Err(HealthError::MalformedMetric { .. })));
    }
}
