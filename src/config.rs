use axum::http::StatusCode;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::latency::{LatencyDistribution, LatencySettings};
use crate::rate_limiter::{BucketSettings, RateLimitBehavior, RateLimitSettings};

/// Command line flags. Every flag can also be set through an `HTTP_TEST_*`
/// environment variable.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "http-test-server",
    version,
    about = "A simple HTTP server useful for testing.",
    long_about = "Accepts ingest requests while injecting latency, rate limiting and errors, \
                  and records what it received so load tests can be checked afterwards."
)]
pub struct Config {
    /// Address to bind to
    #[arg(short = 'a', long, env = "HTTP_TEST_ADDRESS", default_value = "0.0.0.0:8080")]
    pub address: SocketAddr,

    /// Distribution of artificial latency
    #[arg(short = 'l', long, env = "HTTP_TEST_LATENCY_DISTRIBUTION", value_enum, default_value = "NORMAL")]
    pub latency_distribution: LatencyDistribution,

    /// Mean artificial latency; only applies when the distribution is NORMAL
    #[arg(short = 'm', long, env = "HTTP_TEST_LATENCY_NORMAL_MEAN", value_parser = humantime::parse_duration, default_value = "0s")]
    pub latency_normal_mean: Duration,

    /// Standard deviation of artificial latency; only applies when the distribution is NORMAL
    #[arg(short = 'S', long, env = "HTTP_TEST_LATENCY_NORMAL_STDDEV", value_parser = humantime::parse_duration, default_value = "0s")]
    pub latency_normal_stddev: Duration,

    /// Expression for the mean latency in ms; variables: active_requests, t, pi.
    /// Only applies when the distribution is EXPRESSION
    #[arg(long, env = "HTTP_TEST_LATENCY_EXPRESSION_MEAN_MS", default_value = "0")]
    pub latency_expression_mean_ms: String,

    /// Expression for the latency standard deviation in ms. Only applies when the
    /// distribution is EXPRESSION
    #[arg(long, env = "HTTP_TEST_LATENCY_EXPRESSION_STDDEV_MS", default_value = "0")]
    pub latency_expression_stddev_ms: String,

    /// Expression deciding per request whether to fail it: false passes, true
    /// responds 500, a number responds with that status, 'CLOSE' drops the connection
    #[arg(short = 'e', long, env = "HTTP_TEST_ERROR_EXPRESSION")]
    pub error_expression: Option<String>,

    /// Behavior of the rate limiter
    #[arg(short = 'b', long, env = "HTTP_TEST_RATE_LIMIT_BEHAVIOR", value_enum, default_value = "NONE")]
    pub rate_limit_behavior: RateLimitBehavior,

    /// Rate limit token bucket capacity (max tokens)
    #[arg(short = 'c', long, env = "HTTP_TEST_RATE_LIMIT_BUCKET_CAPACITY")]
    pub rate_limit_bucket_capacity: Option<u64>,

    /// Rate limit token bucket quantum (tokens added per interval)
    #[arg(short = 'q', long, env = "HTTP_TEST_RATE_LIMIT_BUCKET_QUANTUM")]
    pub rate_limit_bucket_quantum: Option<u64>,

    /// Interval at which the bucket is refilled with quantum tokens
    #[arg(short = 'd', long, env = "HTTP_TEST_RATE_LIMIT_BUCKET_FILL_INTERVAL", value_parser = humantime::parse_duration)]
    pub rate_limit_bucket_fill_interval: Option<Duration>,

    /// Status code returned when the limit is hit; only applies if the behavior is HARD
    #[arg(long, env = "HTTP_TEST_RATE_LIMIT_HARD_STATUS_CODE", default_value_t = 429)]
    pub rate_limit_hard_status_code: u16,

    /// File to write the statistics summary to on shutdown
    #[arg(short = 's', long, env = "HTTP_TEST_SUMMARY_PATH", default_value = "/tmp/http_test_server_summary.json")]
    pub summary_path: PathBuf,

    /// File to write the effective test parameters to on startup
    #[arg(short = 'p', long, env = "HTTP_TEST_PARAMETERS_PATH")]
    pub parameters_path: Option<PathBuf>,

    /// How long to wait for in-flight requests on shutdown
    #[arg(long, env = "HTTP_TEST_SHUTDOWN_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    pub shutdown_timeout: Duration,

    /// How often to log the running totals
    #[arg(long, env = "HTTP_TEST_REPORT_INTERVAL", value_parser = humantime::parse_duration, default_value = "5s")]
    pub report_interval: Duration,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "HTTP_TEST_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated, immutable server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub rate_limit: RateLimitSettings,
    pub latency: LatencySettings,
    pub error_expression: Option<String>,
    pub report_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            rate_limit: RateLimitSettings::default(),
            latency: LatencySettings::default(),
            error_expression: None,
            report_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn server_config(&self) -> Result<ServerConfig> {
        if self.report_interval.is_zero() {
            return Err(Error::configuration("--report-interval must be > 0"));
        }

        let latency = match self.latency_distribution {
            LatencyDistribution::Normal => LatencySettings::Normal {
                mean: self.latency_normal_mean,
                stddev: self.latency_normal_stddev,
            },
            LatencyDistribution::Expression => LatencySettings::Expression {
                mean_ms: self.latency_expression_mean_ms.clone(),
                stddev_ms: self.latency_expression_stddev_ms.clone(),
            },
        };

        let error_expression = self
            .error_expression
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);

        Ok(ServerConfig {
            address: self.address,
            rate_limit: self.rate_limit_settings()?,
            latency,
            error_expression,
            report_interval: self.report_interval,
        })
    }

    fn rate_limit_settings(&self) -> Result<RateLimitSettings> {
        let hard_status_code = StatusCode::from_u16(self.rate_limit_hard_status_code).map_err(|_| {
            Error::configuration(format!(
                "--rate-limit-hard-status-code {} is not a valid HTTP status code",
                self.rate_limit_hard_status_code
            ))
        })?;

        if self.rate_limit_behavior == RateLimitBehavior::None {
            return Ok(RateLimitSettings {
                behavior: RateLimitBehavior::None,
                bucket: None,
                hard_status_code,
            });
        }

        let fill_interval = self.rate_limit_bucket_fill_interval.unwrap_or_default();
        let capacity = self.rate_limit_bucket_capacity.unwrap_or_default();
        let quantum = self.rate_limit_bucket_quantum.unwrap_or_default();

        if fill_interval.is_zero() {
            return Err(Error::configuration(
                "--rate-limit-bucket-fill-interval must be > 0 if --rate-limit-behavior is not NONE",
            ));
        }
        if capacity == 0 {
            return Err(Error::configuration(
                "--rate-limit-bucket-capacity must be > 0 if --rate-limit-behavior is not NONE",
            ));
        }
        if quantum == 0 {
            return Err(Error::configuration(
                "--rate-limit-bucket-quantum must be > 0 if --rate-limit-behavior is not NONE",
            ));
        }

        Ok(RateLimitSettings {
            behavior: self.rate_limit_behavior,
            bucket: Some(BucketSettings {
                fill_interval,
                capacity,
                quantum,
            }),
            hard_status_code,
        })
    }
}
