use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::connection;
use crate::error::{Error, Result};
use crate::response::status_text;
use crate::token_bucket::TokenBucket;

/// What happens to a request that finds the bucket empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateLimitBehavior {
    /// No rate limit.
    #[value(name = "NONE")]
    None,
    /// Respond with the configured status code (429 by default).
    #[value(name = "HARD")]
    Hard,
    /// Hold the request until a token is refilled.
    #[value(name = "QUEUE")]
    Queue,
    /// Close the connection without responding.
    #[value(name = "CLOSE")]
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSettings {
    pub fill_interval: Duration,
    pub capacity: u64,
    pub quantum: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub behavior: RateLimitBehavior,
    pub bucket: Option<BucketSettings>,
    pub hard_status_code: StatusCode,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            behavior: RateLimitBehavior::None,
            bucket: None,
            hard_status_code: StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// Outcome of asking the limiter whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject(StatusCode),
    Drop,
}

#[derive(Debug)]
pub enum RateLimiter {
    None,
    Hard { bucket: TokenBucket, status: StatusCode },
    Queue { bucket: TokenBucket },
    Close { bucket: TokenBucket },
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Result<Self> {
        if settings.behavior == RateLimitBehavior::None {
            return Ok(RateLimiter::None);
        }

        let bucket = settings.bucket.ok_or_else(|| {
            Error::configuration(
                "rate limit bucket fill interval, capacity and quantum are required unless the behavior is NONE",
            )
        })?;
        let bucket = TokenBucket::new(bucket.fill_interval, bucket.capacity, bucket.quantum)?;

        Ok(match settings.behavior {
            RateLimitBehavior::None => RateLimiter::None,
            RateLimitBehavior::Hard => RateLimiter::Hard {
                bucket,
                status: settings.hard_status_code,
            },
            RateLimitBehavior::Queue => RateLimiter::Queue { bucket },
            RateLimitBehavior::Close => RateLimiter::Close { bucket },
        })
    }

    pub fn behavior(&self) -> RateLimitBehavior {
        match self {
            RateLimiter::None => RateLimitBehavior::None,
            RateLimiter::Hard { .. } => RateLimitBehavior::Hard,
            RateLimiter::Queue { .. } => RateLimitBehavior::Queue,
            RateLimiter::Close { .. } => RateLimitBehavior::Close,
        }
    }

    pub fn bucket(&self) -> Option<&TokenBucket> {
        match self {
            RateLimiter::None => None,
            RateLimiter::Hard { bucket, .. } | RateLimiter::Queue { bucket } | RateLimiter::Close { bucket } => {
                Some(bucket)
            }
        }
    }

    pub async fn admit(&self) -> Admission {
        match self {
            RateLimiter::None => Admission::Admit,
            RateLimiter::Hard { bucket, status } => {
                if bucket.try_take() {
                    Admission::Admit
                } else {
                    Admission::Reject(*status)
                }
            }
            RateLimiter::Queue { bucket } => {
                bucket.wait().await;
                Admission::Admit
            }
            RateLimiter::Close { bucket } => {
                if bucket.try_take() {
                    Admission::Admit
                } else {
                    Admission::Drop
                }
            }
        }
    }
}

/// Rate limiting middleware.
pub async fn enforce(State(limiter): State<Arc<RateLimiter>>, request: Request, next: Next) -> Response {
    match limiter.admit().await {
        Admission::Admit => next.run(request).await,
        Admission::Reject(status) => {
            debug!(status = %status, "rate limit exceeded, rejecting request");
            status_text(status)
        }
        Admission::Drop => {
            debug!("rate limit exceeded, closing connection");
            match connection::drop_connection(request.extensions()).await {
                Ok(never) => match never {},
                Err(err) => err.into_response(),
            }
        }
    }
}
