use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderId;
use crate::tier::Tier;

pub type HealthResult<T> = Result<T, HealthError>;

/// Errors raised by the health check engine and its collaborators.
///
/// The first group aborts a whole run; everything else is confined to a
/// single provider and ends up in `RunStats::errored_provider_ids`.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("metrics source unavailable: {0}")]
    MetricsUnavailable(String),

    #[error("tier rule source unavailable: {0}")]
    RulesUnavailable(String),

    #[error("provider store unavailable: {0}")]
    ProvidersUnavailable(String),

    #[error("{source_name} did not respond within {timeout:?}")]
    SourceTimeout {
        source_name: &'static str,
        timeout: Duration,
    },

    #[error("duplicate tier rule for {0}")]
    DuplicateTierRule(Tier),

    #[error("tier rule for {tier} has max_late_rate {value} outside [0, 1]")]
    InvalidLateRate { tier: Tier, value: f64 },

    #[error("malformed metric for {provider_id}: {reason}")]
    MalformedMetric {
        provider_id: ProviderId,
        reason: String,
    },

    #[error("version conflict saving {provider_id} (expected v{expected}, found v{found})")]
    VersionConflict {
        provider_id: ProviderId,
        expected: u64,
        found: u64,
    },

    #[error("provider store error: {0}")]
    Store(String),

    #[error("infraction sink error: {0}")]
    InfractionSink(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl HealthError {
    /// Whether the error aborts the whole run instead of a single provider
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MetricsUnavailable(_)
                | Self::RulesUnavailable(_)
                | Self::ProvidersUnavailable(_)
                | Self::SourceTimeout { .. }
                | Self::DuplicateTierRule(_)
                | Self::InvalidLateRate { .. }
        )
    }
}

impl From<std::io::Error> for HealthError {
    fn from(e: std::io::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<serde_json::Error> for HealthError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(HealthError::MetricsUnavailable("down".into()).is_fatal());
        assert!(HealthError::SourceTimeout {
            source_name: "tier rules",
            timeout: Duration::from_secs(1),
        }
        .is_fatal());
        assert!(HealthError::DuplicateTierRule(Tier::Gold).is_fatal());
        assert!(HealthError::ProvidersUnavailable("providers.json: not found".into()).is_fatal());

        let conflict = HealthError::VersionConflict {
            provider_id: ProviderId::from("p-1"),
            expected: 1,
            found: 2,
        };
        assert!(!conflict.is_fatal());
        assert!(!HealthError::InfractionSink("disk full".into()).is_fatal());
        assert!(!HealthError::Store("unknown provider p-9".into()).is_fatal());
    }
}
