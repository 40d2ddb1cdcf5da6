//! Count-based sliding-window circuit breaker.
//!
//! The breaker keeps the outcomes of the last `window_size` calls. Once at
//! least `minimum_calls` outcomes are recorded and the failure rate strictly
//! exceeds the threshold it opens and rejects calls for `cooldown`. It then
//! lets exactly one trial call through (half-open): success closes it,
//! failure reopens it with a fresh cooldown.

use serde::Serialize;
use utoipa::ToSchema;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub window_size: usize,
    pub minimum_calls: usize,
    /// Failure rate in `(0, 1]` above which the breaker opens.
    pub failure_rate_threshold: f64,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            minimum_calls: 10,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// `true` marks a failed call.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Inner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_rate: f64,
    pub calls_in_window: usize,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission to make one call through the breaker. Dropping it without
/// recording an outcome releases a half-open trial slot.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record(mut self, success: bool) {
        self.recorded = true;
        self.breaker.record(success, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded && self.trial {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves `Inner` consistent, so a poisoned
        // lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooldown_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .map_or(true, |opened| opened.elapsed() >= self.config.cooldown)
    }

    /// Current state. An open breaker whose cooldown has elapsed reports
    /// `HalfOpen`.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open if self.cooldown_elapsed(&inner) => BreakerState::HalfOpen,
            state => state,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_rate: inner.failure_rate(),
            calls_in_window: inner.window.len(),
        }
    }

    /// Asks to make a call. Returns `None` if the breaker rejects it.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(breaker = %self.name, "Circuit breaker half-open, allowing trial call");
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            recorded: false,
        })
    }

    fn record(&self, success: bool, trial: bool) {
        let mut inner = self.lock();

        if trial {
            inner.trial_in_flight = false;
            if success {
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                tracing::info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            } else {
                self.open(&mut inner);
            }
            return;
        }

        // Late outcome of a call admitted before the breaker tripped.
        if inner.state != BreakerState::Closed {
            return;
        }

        inner.window.push_back(!success);
        while inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }

        if inner.window.len() >= self.config.minimum_calls
            && inner.failure_rate() > self.config.failure_rate_threshold
        {
            self.open(&mut inner);
        }
    }

    fn open(&self, inner: &mut Inner) {
        let failure_rate = inner.failure_rate();
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.window.clear();
        inner.trial_in_flight = false;
        tracing::warn!(
            breaker = %self.name,
            failure_rate,
            cooldown = ?self.config.cooldown,
            "Circuit breaker opened"
        );
    }

    /// Awaits `fut` if the breaker admits the call and records its outcome.
    /// A rejected call never polls `fut`.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, PolicyError<E>>
    where
        F: Future<Output = Result<T, PolicyError<E>>>,
    {
        let permit = match self.try_acquire() {
            Some(permit) => permit,
            None => return Err(PolicyError::Rejected(self.name.clone())),
        };

        let result = fut.await;
        permit.record(result.is_ok());
        result
    }
}

/// Process-wide breakers keyed by call site.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return existing.clone();
        }

        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
