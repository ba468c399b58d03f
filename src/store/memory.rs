use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::HealthResult;
use crate::infraction::{InfractionRecord, InfractionSink};
use crate::metrics::{MetricsSource, ProviderMetric};
use crate::provider::{ProviderId, ProviderState, ProviderStore};

/// Pre-aggregated metric rows, returned as-is for any window
pub struct MemoryMetricsSource {
    rows: Vec<ProviderMetric>,
}

impl MemoryMetricsSource {
    pub fn new(rows: Vec<ProviderMetric>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl MetricsSource for MemoryMetricsSource {
    async fn fetch_window(&self, _window_days: u32, _now: DateTime<Utc>) -> HealthResult<Vec<ProviderMetric>> {
        Ok(self.rows.clone())
    }
}

#[derive(Default)]
pub struct MemoryProviderStore {
    entries: DashMap<ProviderId, ProviderState>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a provider, bypassing the version check
    pub fn insert(&self, state: ProviderState) {
        self.entries.insert(state.id.clone(), state);
    }

    pub fn get(&self, id: &ProviderId) -> Option<ProviderState> {
        self.entries.get(id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl ProviderStore for MemoryProviderStore {
    async fn find_by_ids(&self, ids: &[ProviderId]) -> HealthResult<Vec<ProviderState>> {
        Ok(ids.iter().filter_map(|id| self.get(id)).collect())
    }

    async fn save(&self, state: &ProviderState) -> HealthResult<ProviderState> {
        // get_mut holds the shard lock across check and write
        let mut entry = self.entries.get_mut(&state.id);
        let next = super::next_version(entry.as_deref(), state)?;
        if let Some(stored) = entry.as_deref_mut() {
            *stored = next.clone();
        }
        Ok(next)
    }
}

#[derive(Default)]
pub struct MemoryInfractionSink {
    records: RwLock<Vec<InfractionRecord>>,
}

impl MemoryInfractionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InfractionRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl InfractionSink for MemoryInfractionSink {
    async fn record(&self, infraction: InfractionRecord) -> HealthResult<()> {
        self.records.write().push(infraction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HealthError;
    use chrono::TimeZone;

    fn provider(id: &str) -> ProviderState {
        ProviderState::new(id, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let store = MemoryProviderStore::new();
        store.insert(provider("p-1"));
        let mut p = store.get(&ProviderId::from("p-1")).unwrap();
        p.health_score = 80.0;
        let saved = store.save(&p).await.unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(store.get(&p.id).unwrap().health_score, 80.0);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = MemoryProviderStore::new();
        store.insert(provider("p-1"));
        let stale = store.get(&ProviderId::from("p-1")).unwrap();
        store.save(&stale).await.unwrap();
        let err = store.save(&stale).await.unwrap_err();
        assert!(matches!(err, HealthError::VersionConflict { expected: 0, found: 1, .. }));
    }

    #[tokio::test]
    async fn test_find_by_ids_skips_unknown() {
        let store = MemoryProviderStore::new();
        store.insert(provider("p-1"));
        let found = store
            .find_by_ids(&[ProviderId::from("p-1"), ProviderId::from("ghost")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
