use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{HealthError, HealthResult};
use crate::infraction::{InfractionRecord, InfractionSink};
use crate::metrics::{aggregate_orders, MetricsSource, OrderRecord, ProviderMetric};
use crate::provider::{ProviderId, ProviderState, ProviderStore};

/// Aggregates a JSON array of order records on every fetch
pub struct FileMetricsSource {
    path: PathBuf,
}

impl FileMetricsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetricsSource for FileMetricsSource {
    async fn fetch_window(&self, window_days: u32, now: DateTime<Utc>) -> HealthResult<Vec<ProviderMetric>> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            HealthError::MetricsUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let orders: Vec<OrderRecord> = serde_json::from_slice(&raw).map_err(|e| {
            HealthError::MetricsUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let metrics = aggregate_orders(&orders, window_days, now);
        debug!("Aggregated {} orders into {} provider rows", orders.len(), metrics.len());
        Ok(metrics)
    }
}

/// Provider profiles kept in a JSON array file.
///
/// Reads always go to disk. A save takes an exclusive lock on the sidecar
/// `<file>.lock`, re-reads the file, checks the version of the stored row,
/// replaces only that row and renames a fresh snapshot over the original.
/// Any process writing the same file has to take the same lock.
pub struct FileProviderStore {
    path: PathBuf,
    lock_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileProviderStore {
    pub async fn open(path: impl Into<PathBuf>) -> HealthResult<Self> {
        let path = path.into();
        let providers = read_providers(&path).await?;
        info!("Opened provider store {} ({} providers)", path.display(), providers.len());

        let lock_path = path.with_extension("json.lock");
        Ok(Self {
            path,
            lock_path,
            write_lock: Mutex::new(()),
        })
    }
}

async fn read_providers(path: &Path) -> HealthResult<Vec<ProviderState>> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Check-and-write under the file lock. Blocking, run it off the runtime.
fn save_locked(path: &Path, lock_path: &Path, state: &ProviderState) -> HealthResult<ProviderState> {
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    // released when `lock` is dropped
    FileExt::lock_exclusive(&lock)?;

    let mut all: Vec<ProviderState> = serde_json::from_slice(&std::fs::read(path)?)?;
    let slot = all.iter().position(|p| p.id == state.id);
    let next = super::next_version(slot.map(|i| &all[i]), state)?;
    if let Some(i) = slot {
        all[i] = next.clone();
    }

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&all)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(next)
}

#[async_trait]
impl ProviderStore for FileProviderStore {
    async fn find_by_ids(&self, ids: &[ProviderId]) -> HealthResult<Vec<ProviderState>> {
        let mut by_id: HashMap<ProviderId, ProviderState> = read_providers(&self.path)
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn save(&self, state: &ProviderState) -> HealthResult<ProviderState> {
        // keeps this store's saves from queueing up on blocking threads
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let state = state.clone();
        let saved = tokio::task::spawn_blocking(move || save_locked(&path, &lock_path, &state))
            .await
            .map_err(|e| HealthError::Store(format!("save task failed: {}", e)))??;
        debug!("Saved {} at v{}", saved.id, saved.version);
        Ok(saved)
    }
}

/// Appends one JSON line per infraction
pub struct FileInfractionSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileInfractionSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl InfractionSink for FileInfractionSink {
    async fn record(&self, infraction: InfractionRecord) -> HealthResult<()> {
        let mut line = serde_json::to_vec(&infraction)
            .map_err(|e| HealthError::InfractionSink(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| HealthError::InfractionSink(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| HealthError::InfractionSink(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| HealthError::InfractionSink(e.to_string()))?;
        Ok(())
    }
}
