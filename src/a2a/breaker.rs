//! Per-agent circuit breakers.
//!
//! Only transport failures and timeouts are recorded as failures. Once
//! `failure_threshold` of them land inside the rolling window the breaker
//! opens; each consecutive trip doubles the open period up to `open_max_ms`.
//! After the open period a single trial call is let through (half-open):
//! success closes the breaker, failure re-opens it.

use crate::config::BreakerConfig;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    /// Failure timestamps inside the rolling window.
    failures: VecDeque<Instant>,
    /// Consecutive trips without an intervening success.
    trips: u32,
    last_failure: Option<Instant>,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            trips: 0,
            last_failure: None,
            open_until: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn open_until(&self) -> Option<Instant> {
        self.open_until
    }

    /// Ask permission for one call. `Err` carries how long until the
    /// breaker will let a call through.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let until = self.open_until.unwrap_or(now);
                if now >= until {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(until - now)
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    Err(Duration::from_millis(self.config.open_base_ms))
                } else {
                    self.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.trips = 0;
        self.open_until = None;
        self.trial_in_flight = false;
        self.state = BreakerState::Closed;
    }

    /// Record a transport failure or timeout. Returns true if this call
    /// tripped the breaker open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.last_failure = Some(now);
        let window = Duration::from_millis(self.config.window_ms);
        self.failures.push_back(now);
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        match self.state {
            BreakerState::HalfOpen => {
                self.trip(now);
                true
            }
            BreakerState::Closed
                if self.failures.len() >= self.config.failure_threshold as usize =>
            {
                self.trip(now);
                true
            }
            _ => false,
        }
    }

    /// End a call that neither succeeded nor failed at the transport level
    /// (agent-reported failure, protocol error, cancellation).
    pub fn release(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    fn trip(&mut self, now: Instant) {
        self.trips = self.trips.saturating_add(1);
        let exp = (self.trips - 1).min(31);
        let open_ms = self
            .config
            .open_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.open_max_ms.max(self.config.open_base_ms));
        self.open_until = Some(now + Duration::from_millis(open_ms));
        self.state = BreakerState::Open;
        self.failures.clear();
        self.trial_in_flight = false;
    }
}

/// Breakers for every agent seen so far, one lock per agent.
#[derive(Debug, Default)]
pub struct BreakerBoard {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn breaker(&self, agent: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
        {
            return b.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.config.clone()))))
            .clone()
    }

    fn with<R>(&self, agent: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let breaker = self.breaker(agent);
        let mut guard = breaker.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn state(&self, agent: &str) -> BreakerState {
        self.with(agent, |b| b.state())
    }

    pub fn try_acquire(&self, agent: &str) -> Result<(), Duration> {
        self.with(agent, |b| b.try_acquire(Instant::now()))
    }

    pub fn record_success(&self, agent: &str) {
        self.with(agent, |b| {
            if b.state() != BreakerState::Closed {
                tracing::info!(agent, "Circuit breaker closed");
            }
            b.record_success();
        });
    }

    pub fn record_failure(&self, agent: &str) {
        self.with(agent, |b| {
            if b.record_failure(Instant::now()) {
                let open_ms = b
                    .open_until()
                    .map(|u| u.saturating_duration_since(Instant::now()).as_millis())
                    .unwrap_or_default();
                tracing::warn!(agent, open_ms = open_ms as u64, "Circuit breaker opened");
            }
        });
    }

    pub fn release(&self, agent: &str) {
        self.with(agent, CircuitBreaker::release);
    }

    /// Like `try_acquire`, but the permission is held by the returned guard.
    /// A guard dropped without an outcome (the call was abandoned) frees a
    /// half-open trial slot instead of holding it forever.
    pub fn acquire(self: &Arc<Self>, agent: &str) -> Result<BreakerPermit, Duration> {
        self.try_acquire(agent)?;
        Ok(BreakerPermit {
            board: Arc::clone(self),
            agent: agent.to_string(),
            settled: false,
        })
    }
}

/// One granted call against an agent's breaker.
#[derive(Debug)]
pub struct BreakerPermit {
    board: Arc<BreakerBoard>,
    agent: String,
    settled: bool,
}

impl BreakerPermit {
    pub fn succeeded(mut self) {
        self.settled = true;
        self.board.record_success(&self.agent);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.board.record_failure(&self.agent);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.board.release(&self.agent);
        }
    }
}
