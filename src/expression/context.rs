use std::f64::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Value;

/// Read-only view of live server state handed to a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalContext {
    pub elapsed: Duration,
    pub active_requests: u32,
}

impl EvalContext {
    pub fn new(elapsed: Duration, active_requests: u32) -> Self {
        Self { elapsed, active_requests }
    }

    pub(crate) fn variable(&self, name: &str) -> Option<Value> {
        match name {
            "active_requests" => Some(Value::Number(self.active_requests as f64)),
            "t" => Some(Value::Number(self.elapsed.as_secs() as f64)),
            "pi" => Some(Value::Number(PI)),
            _ => None,
        }
    }
}

/// Counter of requests currently inside a middleware layer.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequests(Arc<AtomicU32>);

impl ActiveRequests {
    pub fn enter(&self) -> ActiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.0.clone())
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decrements the owning [`ActiveRequests`] when dropped.
#[derive(Debug)]
pub struct ActiveGuard(Arc<AtomicU32>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Produces evaluation contexts for one middleware layer: tracks its in-flight
/// requests and the instant the server started.
#[derive(Debug, Clone)]
pub struct ContextSource {
    started: Instant,
    active: ActiveRequests,
}

impl ContextSource {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            active: ActiveRequests::default(),
        }
    }

    /// Registers the calling request as in flight and snapshots the context.
    /// The request stays counted until the guard is dropped.
    pub fn enter(&self) -> (ActiveGuard, EvalContext) {
        let guard = self.active.enter();
        let context = EvalContext::new(self.started.elapsed(), self.active.current());
        (guard, context)
    }

    pub fn active_requests(&self) -> u32 {
        self.active.current()
    }
}
