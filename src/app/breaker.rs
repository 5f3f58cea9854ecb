use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_rate_threshold: f32,
    pub window_size: usize,
    pub minimum_calls: usize,
    pub open_cooldown: Duration,
    pub half_open_trials: usize,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_rate_threshold: config.failure_rate_threshold,
            window_size: config.window_size.max(1),
            minimum_calls: config.minimum_calls.max(1),
            open_cooldown: Duration::from_secs(config.open_cooldown_secs),
            half_open_trials: config.half_open_trials.max(1),
        }
    }
}

#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected without running
    Open,
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Outcomes of recent calls while closed; `true` is a failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials_started: usize,
    trial_successes: usize,
    /// Bumped on every transition so late results from an earlier state are dropped
    generation: u64,
}

/// Rolling-window circuit breaker around calls to the search engine.
///
/// Closed: calls pass and outcomes are recorded. Once `minimum_calls` are in
/// the window and the failure ratio reaches the threshold, the circuit opens
/// and calls are rejected without running. After the cooldown a limited
/// number of trial calls pass; all succeeding closes the circuit, any failure
/// opens it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

struct Permit {
    generation: u64,
}

impl CircuitBreaker {
    pub fn new(name: &str, settings: BreakerSettings) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(settings.window_size),
                opened_at: None,
                trials_started: 0,
                trial_successes: 0,
                generation: 0,
            }),
            settings,
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.expire_open(&mut inner, Instant::now());
        inner.state
    }

    /// Run `op` if the circuit allows it, counting every error as a failure.
    #[cfg(test)]
    pub fn call<T, E>(&self, op: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerError<E>> {
        self.call_with(op, |_| true)
    }

    /// Run `op` if the circuit allows it. Errors for which `is_failure`
    /// returns false are recorded as successful calls.
    pub fn call_with<T, E>(
        &self,
        op: impl FnOnce() -> Result<T, E>,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>> {
        let permit = self.acquire().ok_or(BreakerError::Open)?;

        let result = op();
        let failed = match &result {
            Ok(_) => false,
            Err(e) => is_failure(e),
        };
        self.record(permit, failed);

        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire_open(&self, inner: &mut Inner, now: Instant) {
        if inner.state != BreakerState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map(|at| now.duration_since(at) >= self.settings.open_cooldown)
            .unwrap_or(true);

        if cooled {
            log::info!("circuit {}: open -> half-open", self.name);
            self.transition(inner, BreakerState::HalfOpen);
        }
    }

    fn acquire(&self) -> Option<Permit> {
        let mut inner = self.lock();
        self.expire_open(&mut inner, Instant::now());

        match inner.state {
            BreakerState::Closed => {}
            BreakerState::Open => return None,
            BreakerState::HalfOpen => {
                if inner.trials_started >= self.settings.half_open_trials {
                    return None;
                }
                inner.trials_started += 1;
            }
        }

        Some(Permit {
            generation: inner.generation,
        })
    }

    fn record(&self, permit: Permit, failed: bool) {
        let mut inner = self.lock();
        if inner.generation != permit.generation {
            return;
        }

        match inner.state {
            BreakerState::Closed => {
                if inner.window.len() == self.settings.window_size {
                    inner.window.pop_front();
                }
                inner.window.push_back(failed);

                let calls = inner.window.len();
                if calls < self.settings.minimum_calls {
                    return;
                }
                let failures = inner.window.iter().filter(|f| **f).count();
                let rate = failures as f32 / calls as f32;
                if rate >= self.settings.failure_rate_threshold {
                    log::warn!(
                        "circuit {}: closed -> open ({failures}/{calls} calls failed)",
                        self.name
                    );
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                if failed {
                    log::warn!("circuit {}: trial call failed, half-open -> open", self.name);
                    self.transition(&mut inner, BreakerState::Open);
                    return;
                }
                inner.trial_successes += 1;
                if inner.trial_successes >= self.settings.half_open_trials {
                    log::info!("circuit {}: half-open -> closed", self.name);
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            // permits are never handed out while open
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, state: BreakerState) {
        inner.state = state;
        inner.generation += 1;
        inner.window.clear();
        inner.trials_started = 0;
        inner.trial_successes = 0;
        inner.opened_at = match state {
            BreakerState::Open => Some(Instant::now()),
            _ => None,
        };
    }
}
