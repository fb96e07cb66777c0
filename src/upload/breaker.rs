//! Circuit breaker for upload targets
//!
//! closed -> open after `failure_threshold` consecutive failures;
//! open -> half-open once `cooldown` has elapsed; half-open admits exactly
//! one probe, which closes the breaker on success or reopens it on failure.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call while closed
    Closed,
    /// The single half-open probe
    Probe,
}

/// Call refused without touching the dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time until a probe may be attempted
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose cooldown has elapsed reports
    /// half-open.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Ask to make a call
    pub fn try_acquire(&self) -> Result<Admission, Rejected> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            BreakerState::Closed => Ok(Admission::Closed),
            BreakerState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                tracing::info!("Circuit {} half-open, admitting probe", self.name);
                Ok(Admission::Probe)
            }
            BreakerState::HalfOpen => Err(Rejected {
                retry_after: Duration::ZERO,
            }),
            BreakerState::Open => Err(Rejected {
                retry_after: self.remaining_cooldown(&inner),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!("Circuit {} closed", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                "Circuit {} opened after {} consecutive failures (cooldown {}ms)",
                self.name,
                inner.consecutive_failures,
                self.cooldown.as_millis()
            );
        }
    }

    /// A call ended without telling us anything about the dependency's
    /// health (cancelled, rejected credentials). Frees the probe slot.
    pub fn record_neutral(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.inner.lock().probe_in_flight = false;
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open && self.remaining_cooldown(inner).is_zero() {
            inner.state = BreakerState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }

    fn remaining_cooldown(&self, inner: &Inner) -> Duration {
        inner
            .opened_at
            .map(|at| self.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

/// One breaker per upload target for the life of the process
#[derive(Debug)]
pub struct BreakerRegistry {
    failure_threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(target, self.failure_threshold, self.cooldown))
            })
            .clone()
    }
}
