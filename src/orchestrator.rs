use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::enforcement::{evaluate, Evaluation, SuspensionPolicy};
use crate::error::{HealthError, HealthResult};
use crate::infraction::InfractionSink;
use crate::metrics::{MetricsSource, ProviderMetric};
use crate::provider::{ProviderId, ProviderState, ProviderStore};
use crate::tier::{TierRuleSource, TierRules, Transition};

/// Statistics reported to the scheduler after a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub updated_count: u32,
    pub suspended_count: u32,
    pub skipped_count: u32,
    pub promoted_count: u32,
    pub demoted_count: u32,
    pub errored_provider_ids: Vec<ProviderId>,
    /// Cancellation or the run budget stopped dispatch before every provider ran
    pub stopped_early: bool,
}

#[derive(Debug)]
enum ProviderOutcome {
    Skipped,
    Unchanged,
    Persisted { transition: Transition, suspended: bool },
}

struct ProviderReport {
    id: ProviderId,
    outcome: HealthResult<ProviderOutcome>,
    /// Set when the provider update went through but the infraction write did not
    infraction_error: Option<HealthError>,
}

/// Accumulates worker reports; errored ids stay sorted and unique until `finish`
#[derive(Default)]
struct RunTally {
    stats: RunStats,
    errored: BTreeSet<ProviderId>,
}

impl RunTally {
    fn absorb(&mut self, report: ProviderReport) {
        let stats = &mut self.stats;
        match report.outcome {
            Ok(ProviderOutcome::Skipped) => stats.skipped_count += 1,
            Ok(ProviderOutcome::Unchanged) => {}
            Ok(ProviderOutcome::Persisted { transition, suspended }) => {
                stats.updated_count += 1;
                if suspended {
                    stats.suspended_count += 1;
                }
                match transition {
                    Transition::Promote { .. } => stats.promoted_count += 1,
                    Transition::Demote { .. } => stats.demoted_count += 1,
                    Transition::Unchanged => {}
                }
            }
            Err(e) => {
                warn!("Health check failed for {}: {}", report.id, e);
                self.errored.insert(report.id.clone());
            }
        }
        if let Some(e) = report.infraction_error {
            warn!("Infraction for {} not recorded: {}", report.id, e);
            self.errored.insert(report.id);
        }
    }

    fn finish(self) -> RunStats {
        RunStats {
            errored_provider_ids: self.errored.into_iter().collect(),
            ..self.stats
        }
    }
}

/// Everything a per-provider task needs, shared read-only across the run
struct RunContext {
    providers: Arc<dyn ProviderStore>,
    infractions: Arc<dyn InfractionSink>,
    rules: TierRules,
    policy: SuspensionPolicy,
    locks: Arc<DashMap<ProviderId, Arc<Mutex<()>>>>,
    now: DateTime<Utc>,
}

/// Run Orchestrator - 全プロバイダのヘルスチェックを1バッチで回す
///
/// Collaborators are injected; the runner itself holds no data besides the
/// per-provider advisory locks, which are shared by every run started from
/// the same runner.
pub struct HealthCheckRunner {
    metrics: Arc<dyn MetricsSource>,
    rules: Arc<dyn TierRuleSource>,
    providers: Arc<dyn ProviderStore>,
    infractions: Arc<dyn InfractionSink>,
    config: EngineConfig,
    locks: Arc<DashMap<ProviderId, Arc<Mutex<()>>>>,
}

impl HealthCheckRunner {
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        rules: Arc<dyn TierRuleSource>,
        providers: Arc<dyn ProviderStore>,
        infractions: Arc<dyn InfractionSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            metrics,
            rules,
            providers,
            infractions,
            config,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Run one health check now, without a cancellation signal
    pub async fn run_health_check(&self) -> HealthResult<RunStats> {
        let (_tx, cancel) = watch::channel(false);
        self.run_health_check_at(Utc::now(), cancel).await
    }

    /// Run one health check as of `now`.
    ///
    /// Once `cancel` reads `true` (or the run budget elapses) no new providers
    /// are dispatched; evaluations already in flight finish and persist.
    pub async fn run_health_check_at(
        &self,
        now: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> HealthResult<RunStats> {
        let started = tokio::time::Instant::now();
        let deadline = started + Duration::from_secs(self.config.run_budget_secs);
        let timeout = Duration::from_secs(self.config.source_timeout_secs);

        let (metrics, rules) = tokio::try_join!(
            with_timeout("metrics source", timeout, async {
                self.metrics
                    .fetch_window(self.config.window_days, now)
                    .await
                    .map_err(|e| match e {
                        HealthError::MetricsUnavailable(_) => e,
                        other => HealthError::MetricsUnavailable(other.to_string()),
                    })
            }),
            with_timeout("tier rule source", timeout, async {
                self.rules.list_rules().await.map_err(|e| match e {
                    HealthError::RulesUnavailable(_) => e,
                    other => HealthError::RulesUnavailable(other.to_string()),
                })
            }),
        )?;
        let rules = TierRules::from_rules(rules)?;

        if metrics.is_empty() {
            info!("No provider metrics in the last {} days, nothing to do", self.config.window_days);
            return Ok(RunStats::default());
        }
        info!(
            "🩺 Health check started: {} metric rows, {} tier rules, window {} days",
            metrics.len(),
            rules.len(),
            self.config.window_days
        );

        let mut tally = RunTally::default();
        let mut by_id: HashMap<ProviderId, ProviderMetric> = HashMap::new();
        for metric in metrics {
            if !metric.has_signal() {
                tally.stats.skipped_count += 1;
                continue;
            }
            if by_id.contains_key(&metric.provider_id) {
                tally.absorb(ProviderReport {
                    id: metric.provider_id.clone(),
                    outcome: Err(HealthError::MalformedMetric {
                        provider_id: metric.provider_id,
                        reason: "duplicate metric row".to_string(),
                    }),
                    infraction_error: None,
                });
                continue;
            }
            by_id.insert(metric.provider_id.clone(), metric);
        }
        // A provider with a duplicate row is not evaluated at all
        for id in &tally.errored {
            by_id.remove(id);
        }

        let mut ids: Vec<ProviderId> = by_id.keys().cloned().collect();
        ids.sort();
        let mut providers = self.providers.find_by_ids(&ids).await.map_err(|e| match e {
            HealthError::ProvidersUnavailable(_) => e,
            other => HealthError::ProvidersUnavailable(other.to_string()),
        })?;
        providers.sort_by(|a, b| a.id.cmp(&b.id));

        let found: HashSet<&ProviderId> = providers.iter().map(|p| &p.id).collect();
        let missing = ids.iter().filter(|id| !found.contains(id)).count();
        if missing > 0 {
            info!("{} providers with metrics no longer exist, skipping", missing);
            tally.stats.skipped_count += missing as u32;
        }

        let ctx = Arc::new(RunContext {
            providers: self.providers.clone(),
            infractions: self.infractions.clone(),
            rules,
            policy: SuspensionPolicy::from(&self.config),
            locks: self.locks.clone(),
            now,
        });
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut join_set: JoinSet<ProviderReport> = JoinSet::new();
        let total = providers.len();
        let mut dispatched: Vec<ProviderId> = Vec::with_capacity(total);

        for provider in providers {
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            if *cancel.borrow() || tokio::time::Instant::now() >= deadline {
                warn!("Stopping dispatch after {} of {} providers", dispatched.len(), total);
                tally.stats.stopped_early = true;
                break;
            }
            let Some(metric) = by_id.remove(&provider.id) else {
                continue;
            };

            dispatched.push(provider.id.clone());
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let _permit = permit;
                evaluate_provider(ctx, provider, metric).await
            });
        }

        let mut reported: HashSet<ProviderId> = HashSet::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(report) => {
                    reported.insert(report.id.clone());
                    tally.absorb(report);
                }
                Err(e) => error!("Health check worker failed: {}", e),
            }
        }
        // A worker that panicked never reported back
        for id in dispatched.into_iter().filter(|id| !reported.contains(id)) {
            tally.absorb(ProviderReport {
                outcome: Err(HealthError::Worker(format!("evaluation of {} aborted", id))),
                id,
                infraction_error: None,
            });
        }
        self.prune_locks();

        let stats = tally.finish();
        info!(
            "🩺 Health check finished in {:?}: updated={} suspended={} promoted={} demoted={} skipped={} errored={}",
            started.elapsed(),
            stats.updated_count,
            stats.suspended_count,
            stats.promoted_count,
            stats.demoted_count,
            stats.skipped_count,
            stats.errored_provider_ids.len()
        );
        Ok(stats)
    }

    /// Drops per-provider locks that no task of any run still holds
    fn prune_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

async fn with_timeout<T>(
    source_name: &'static str,
    timeout: Duration,
    fut: impl Future<Output = HealthResult<T>>,
) -> HealthResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| HealthError::SourceTimeout { source_name, timeout })?
}

/// Per-provider critical section: lock, evaluate, save, then record the infraction
async fn evaluate_provider(
    ctx: Arc<RunContext>,
    provider: ProviderState,
    metric: ProviderMetric,
) -> ProviderReport {
    let id = provider.id.clone();
    let lock = ctx.locks.entry(id.clone()).or_default().value().clone();
    let _guard = lock.lock().await;

    let mut report = ProviderReport {
        id,
        outcome: Ok(ProviderOutcome::Unchanged),
        infraction_error: None,
    };

    let evaluation = match persist_with_retry(&ctx, provider, &metric).await {
        Ok(Some(evaluation)) => evaluation,
        Ok(None) => {
            report.outcome = Ok(ProviderOutcome::Skipped);
            return report;
        }
        Err(e) => {
            report.outcome = Err(e);
            return report;
        }
    };

    if !evaluation.changed {
        return report;
    }
    report.outcome = Ok(ProviderOutcome::Persisted {
        transition: evaluation.transition,
        suspended: evaluation.suspended,
    });

    if let Some(infraction) = evaluation.infraction {
        if let Err(e) = ctx.infractions.record(infraction).await {
            report.infraction_error = Some(e);
        }
    }
    report
}

/// Evaluate and save, re-reading and retrying once on a version conflict.
///
/// `Ok(None)` means there was nothing to evaluate (no orders, or the provider
/// disappeared between the bulk load and the retry).
async fn persist_with_retry(
    ctx: &RunContext,
    provider: ProviderState,
    metric: &ProviderMetric,
) -> HealthResult<Option<Evaluation>> {
    let mut current = provider;
    let mut retried = false;
    loop {
        let Some(evaluation) = evaluate(&current, metric, &ctx.rules, &ctx.policy, ctx.now)? else {
            return Ok(None);
        };
        if !evaluation.changed {
            return Ok(Some(evaluation));
        }
        match ctx.providers.save(&evaluation.provider).await {
            Ok(_) => return Ok(Some(evaluation)),
            Err(HealthError::VersionConflict { .. }) if !retried => {
                warn!("Version conflict saving {}, reloading and retrying once", current.id);
                retried = true;
                let reloaded = ctx.providers.find_by_ids(std::slice::from_ref(&current.id)).await?;
                match reloaded.into_iter().next() {
                    Some(fresh) => current = fresh,
                    None => return Ok(None),
                }
            }
            Err(e) => return Err(e),
        }
    }
}
