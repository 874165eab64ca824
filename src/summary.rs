use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::latency::{LatencyDistribution, LatencySettings};
use crate::rate_limiter::RateLimitBehavior;

/// The effective test parameters, written next to the summary so a load test
/// run can be matched to the server behavior it ran against. Settings that do
/// not apply to the selected behavior are left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameters {
    pub latency_distribution: LatencyDistribution,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub latency_distribution_normal_mean: Option<Duration>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub latency_distribution_normal_standard_deviation: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_distribution_expression_mean_ms: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_distribution_expression_standard_deviation_ms: Option<String>,

    pub rate_limit_behavior: RateLimitBehavior,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub rate_limit_bucket_fill_interval: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_bucket_capacity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_bucket_quantum: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_hard_status_code: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_expression: Option<String>,
}

impl From<&ServerConfig> for Parameters {
    fn from(config: &ServerConfig) -> Self {
        let (normal_mean, normal_stddev, expression_mean, expression_stddev) = match &config.latency {
            LatencySettings::Normal { mean, stddev } => (Some(*mean), Some(*stddev), None, None),
            LatencySettings::Expression { mean_ms, stddev_ms } => {
                (None, None, Some(mean_ms.clone()), Some(stddev_ms.clone()))
            }
        };

        let rate_limit = &config.rate_limit;
        let bucket = rate_limit.bucket;
        let hard_status_code = (rate_limit.behavior == RateLimitBehavior::Hard)
            .then(|| rate_limit.hard_status_code.as_u16());

        Self {
            latency_distribution: config.latency.distribution(),
            latency_distribution_normal_mean: normal_mean,
            latency_distribution_normal_standard_deviation: normal_stddev,
            latency_distribution_expression_mean_ms: expression_mean,
            latency_distribution_expression_standard_deviation_ms: expression_stddev,
            rate_limit_behavior: rate_limit.behavior,
            rate_limit_bucket_fill_interval: bucket.map(|b| b.fill_interval),
            rate_limit_bucket_capacity: bucket.map(|b| b.capacity),
            rate_limit_bucket_quantum: bucket.map(|b| b.quantum),
            rate_limit_hard_status_code: hard_status_code,
            error_expression: config.error_expression.clone(),
        }
    }
}

/// Writes `value` as indented JSON, replacing whatever is at `path`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    std::fs::write(path, json)?;
    Ok(())
}

/// Removes a summary left behind by an earlier run so a crash can't be
/// mistaken for a completed run.
pub fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale summary");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
