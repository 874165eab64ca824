use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Token bucket refilled in discrete steps: every `fill_interval`, `quantum`
/// tokens are added, never exceeding `capacity`. The bucket starts full.
///
/// Ticks are counted from the bucket's creation, so refills happen at fixed
/// instants regardless of when tokens were taken.
#[derive(Debug)]
pub struct TokenBucket {
    start: Instant,
    fill_interval: Duration,
    capacity: i64,
    quantum: i64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Negative when waiters have reserved tokens that are not yet refilled.
    tokens: i64,
    latest_tick: u64,
}

impl TokenBucket {
    pub fn new(fill_interval: Duration, capacity: u64, quantum: u64) -> Result<Self> {
        Self::new_at(Instant::now(), fill_interval, capacity, quantum)
    }

    fn new_at(start: Instant, fill_interval: Duration, capacity: u64, quantum: u64) -> Result<Self> {
        if fill_interval.is_zero() {
            return Err(Error::configuration("token bucket fill interval must be > 0"));
        }
        if capacity == 0 {
            return Err(Error::configuration("token bucket capacity must be > 0"));
        }
        if quantum == 0 {
            return Err(Error::configuration("token bucket quantum must be > 0"));
        }
        let capacity = i64::try_from(capacity)
            .map_err(|_| Error::configuration("token bucket capacity is too large"))?;
        let quantum = i64::try_from(quantum)
            .map_err(|_| Error::configuration("token bucket quantum is too large"))?;

        Ok(Self {
            start,
            fill_interval,
            capacity,
            quantum,
            state: Mutex::new(BucketState {
                tokens: capacity,
                latest_tick: 0,
            }),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    pub fn quantum(&self) -> u64 {
        self.quantum as u64
    }

    pub fn fill_interval(&self) -> Duration {
        self.fill_interval
    }

    /// Takes one token if one is available right now.
    pub fn try_take(&self) -> bool {
        self.try_take_at(Instant::now())
    }

    /// Tokens that could be taken right now without waiting.
    pub fn available(&self) -> u64 {
        self.available_at(Instant::now())
    }

    /// Reserves one token and waits until the refill schedule covers it.
    pub async fn wait(&self) {
        let delay = self.reserve_at(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn try_take_at(&self, now: Instant) -> bool {
        let tick = self.tick_at(now);
        let mut state = self.state.lock();
        self.refill(&mut state, tick);
        if state.tokens <= 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }

    fn available_at(&self, now: Instant) -> u64 {
        let tick = self.tick_at(now);
        let mut state = self.state.lock();
        self.refill(&mut state, tick);
        state.tokens.max(0) as u64
    }

    /// Takes one token unconditionally, returning how long the caller must
    /// wait before the token it took has actually been refilled.
    fn reserve_at(&self, now: Instant) -> Duration {
        let tick = self.tick_at(now);
        let mut state = self.state.lock();
        self.refill(&mut state, tick);
        state.tokens -= 1;
        if state.tokens >= 0 {
            return Duration::ZERO;
        }

        let deficit = (-state.tokens) as u64;
        let ticks_needed = deficit.div_ceil(self.quantum as u64);
        let ready_at = self.start + self.interval_times(tick.saturating_add(ticks_needed));
        ready_at.saturating_duration_since(now)
    }

    fn refill(&self, state: &mut BucketState, tick: u64) {
        if tick <= state.latest_tick {
            return;
        }
        if state.tokens < self.capacity {
            let elapsed = i64::try_from(tick - state.latest_tick).unwrap_or(i64::MAX);
            state.tokens = state
                .tokens
                .saturating_add(elapsed.saturating_mul(self.quantum))
                .min(self.capacity);
        }
        state.latest_tick = tick;
    }

    fn tick_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.start).as_nanos();
        u64::try_from(elapsed / self.fill_interval.as_nanos()).unwrap_or(u64::MAX)
    }

    fn interval_times(&self, ticks: u64) -> Duration {
        let nanos = self.fill_interval.as_nanos().saturating_mul(ticks as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}
