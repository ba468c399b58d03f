//! Metrics Aggregator
//!
//! 注文イベントを直近ウィンドウで絞り込み、プロバイダごとに
//! {total, late, cancel} へ畳み込む。
//!
//! Only completed or cancelled orders carry signal. Soft-deleted orders and
//! orders whose timestamp falls outside `[now - window, now]` are ignored.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HealthError, HealthResult};
use crate::provider::ProviderId;

/// Per-provider aggregate for one run's window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetric {
    pub provider_id: ProviderId,
    pub total_orders: u32,
    pub late_orders: u32,
    pub cancel_orders: u32,
}

impl ProviderMetric {
    pub fn has_signal(&self) -> bool {
        self.total_orders > 0
    }

    pub fn validate(&self) -> HealthResult<()> {
        let reason = if self.late_orders > self.total_orders {
            format!("late_orders {} exceeds total_orders {}", self.late_orders, self.total_orders)
        } else if self.cancel_orders > self.total_orders {
            format!("cancel_orders {} exceeds total_orders {}", self.cancel_orders, self.total_orders)
        } else {
            return Ok(());
        };
        Err(HealthError::MalformedMetric {
            provider_id: self.provider_id.clone(),
            reason,
        })
    }

    /// (late_rate, cancel_rate); callers check `has_signal` first
    pub fn rates(&self) -> (f64, f64) {
        let total = self.total_orders as f64;
        (self.late_orders as f64 / total, self.cancel_orders as f64 / total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

/// Raw order event as exported by the order store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub provider_id: ProviderId,
    pub status: OrderStatus,
    #[serde(default)]
    pub late: bool,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

/// Reduce order events into one metric row per provider with orders in the window
pub fn aggregate_orders(
    orders: &[OrderRecord],
    window_days: u32,
    now: DateTime<Utc>,
) -> Vec<ProviderMetric> {
    let since = now - Duration::days(window_days as i64);
    let mut by_provider: BTreeMap<&ProviderId, ProviderMetric> = BTreeMap::new();

    for order in orders {
        if order.deleted || order.updated_at < since || order.updated_at > now {
            continue;
        }
        let cancelled = match order.status {
            OrderStatus::Completed => false,
            OrderStatus::Cancelled => true,
            OrderStatus::Pending | OrderStatus::InProgress => continue,
        };

        let metric = by_provider
            .entry(&order.provider_id)
            .or_insert_with(|| ProviderMetric {
                provider_id: order.provider_id.clone(),
                total_orders: 0,
                late_orders: 0,
                cancel_orders: 0,
            });
        metric.total_orders += 1;
        if order.late {
            metric.late_orders += 1;
        }
        if cancelled {
            metric.cancel_orders += 1;
        }
    }

    by_provider.into_values().collect()
}

/// Source of windowed provider metrics
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_window(&self, window_days: u32, now: DateTime<Utc>) -> HealthResult<Vec<ProviderMetric>>;
}
