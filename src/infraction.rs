use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HealthResult;
use crate::provider::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfractionKind {
    /// Auto-suspension for excess cancellations
    ProviderCancellation,
}

/// Append-only infraction ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfractionRecord {
    pub provider_id: ProviderId,
    #[serde(rename = "type")]
    pub kind: InfractionKind,
    pub points_deducted: i32,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

impl InfractionRecord {
    pub fn cancellation_suspension(
        provider_id: ProviderId,
        cancel_rate: f64,
        window_days: u32,
        points: i32,
        now: DateTime<Utc>,
    ) -> Self {
        let percent = (cancel_rate * 100.0).round() as i64;
        Self {
            provider_id,
            kind: InfractionKind::ProviderCancellation,
            points_deducted: points,
            notes: format!(
                "Auto-suspended: cancellation rate {}% over the last {} days",
                percent, window_days
            ),
            created_at: now,
        }
    }
}

/// Infraction ledger. Advisory: a failed write never undoes a provider update.
#[async_trait]
pub trait InfractionSink: Send + Sync {
    async fn record(&self, infraction: InfractionRecord) -> HealthResult<()>;
}
