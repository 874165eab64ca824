use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use clap::ValueEnum;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::expression::{ContextSource, EvalContext, EvalError, Expression, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum LatencyDistribution {
    /// Fixed mean and standard deviation.
    #[value(name = "NORMAL")]
    Normal,
    /// Mean and standard deviation in milliseconds computed per request.
    #[value(name = "EXPRESSION")]
    Expression,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatencySettings {
    Normal { mean: Duration, stddev: Duration },
    Expression { mean_ms: String, stddev_ms: String },
}

impl Default for LatencySettings {
    fn default() -> Self {
        LatencySettings::Normal {
            mean: Duration::ZERO,
            stddev: Duration::ZERO,
        }
    }
}

impl LatencySettings {
    pub fn distribution(&self) -> LatencyDistribution {
        match self {
            LatencySettings::Normal { .. } => LatencyDistribution::Normal,
            LatencySettings::Expression { .. } => LatencyDistribution::Expression,
        }
    }
}

/// Delays each request by a normally distributed amount before passing it on.
#[derive(Debug)]
pub enum LatencyInjector {
    Normal {
        mean: Duration,
        stddev: Duration,
    },
    Expression {
        mean: Expression,
        stddev: Expression,
        context: ContextSource,
    },
}

impl LatencyInjector {
    pub fn new(settings: &LatencySettings, started: Instant) -> Result<Self> {
        Ok(match settings {
            LatencySettings::Normal { mean, stddev } => LatencyInjector::Normal {
                mean: *mean,
                stddev: *stddev,
            },
            LatencySettings::Expression { mean_ms, stddev_ms } => LatencyInjector::Expression {
                mean: Expression::compile(mean_ms).map_err(|source| Error::ExpressionCompile {
                    component: "latency mean",
                    source,
                })?,
                stddev: Expression::compile(stddev_ms).map_err(|source| Error::ExpressionCompile {
                    component: "latency stddev",
                    source,
                })?,
                context: ContextSource::new(started),
            },
        })
    }

    pub fn context_source(&self) -> Option<&ContextSource> {
        match self {
            LatencyInjector::Normal { .. } => None,
            LatencyInjector::Expression { context, .. } => Some(context),
        }
    }

    /// Evaluates the delay for one request in the given context.
    pub fn delay(&self, context: &EvalContext) -> Result<Duration> {
        let z: f64 = rand::thread_rng().sample(StandardNormal);
        match self {
            LatencyInjector::Normal { mean, stddev } => {
                Ok(normal_delay(as_millis_f64(*mean), as_millis_f64(*stddev), z))
            }
            LatencyInjector::Expression { mean, stddev, .. } => {
                let mean_ms = evaluate_millis(mean, context, "latency mean")?;
                let stddev_ms = evaluate_millis(stddev, context, "latency stddev")?;
                Ok(normal_delay(mean_ms, stddev_ms, z))
            }
        }
    }
}

fn evaluate_millis(expression: &Expression, context: &EvalContext, component: &'static str) -> Result<f64> {
    match expression.evaluate(context) {
        Ok(Value::Number(ms)) => Ok(ms),
        Ok(other) => Err(Error::ExpressionEval {
            component,
            source: EvalError::UnexpectedResult(format!(
                "expected a number of milliseconds, got {} '{}'",
                other.type_name(),
                other
            )),
        }),
        Err(source) => Err(Error::ExpressionEval { component, source }),
    }
}

/// `mean + z * stddev` milliseconds; negative or non-finite draws mean no delay.
fn normal_delay(mean_ms: f64, stddev_ms: f64, z: f64) -> Duration {
    let nanos = ((mean_ms + z * stddev_ms) * 1_000_000.0).round();
    if nanos.is_finite() && nanos > 0.0 {
        Duration::from_nanos(nanos as u64)
    } else {
        Duration::ZERO
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Latency injection middleware.
pub async fn inject(State(latency): State<Arc<LatencyInjector>>, request: Request, next: Next) -> Response {
    let (_active, context) = match latency.context_source() {
        Some(source) => {
            let (guard, context) = source.enter();
            (Some(guard), context)
        }
        None => (None, EvalContext::new(Duration::ZERO, 0)),
    };

    match latency.delay(&context) {
        Ok(delay) => {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}
