//! Per-tier circuit breaker fronting the speed layer's policy and expert
//! tiers (SPEC_FULL.md §4.4). Closed lets calls through; a window of
//! failures above `error_rate_threshold` opens the breaker; after
//! `open_duration` it moves to half-open and lets one trial call through.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Window {
    successes: u32,
    failures: u32,
}

struct Inner {
    state: State,
    window: Window,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    error_rate_threshold: f64,
    min_samples: u32,
    open_duration: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(error_rate_threshold: f64, min_samples: u32, open_duration: Duration) -> Self {
        Self {
            error_rate_threshold,
            min_samples,
            open_duration,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: Window {
                    successes: 0,
                    failures: 0,
                },
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> State {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Returns `true` if a call is allowed to proceed right now.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        !matches!(inner.state, State::Open)
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.window.successes += 1;
        if inner.state == State::HalfOpen {
            inner.state = State::Closed;
            inner.window = Window {
                successes: 0,
                failures: 0,
            };
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.window.failures += 1;

        if inner.state == State::HalfOpen {
            self.open(&mut inner);
            return;
        }

        let total = inner.window.successes + inner.window.failures;
        if total >= self.min_samples {
            let rate = inner.window.failures as f64 / total as f64;
            if rate >= self.error_rate_threshold {
                self.open(&mut inner);
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == State::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.open_duration {
                    inner.state = State::HalfOpen;
                    inner.window = Window {
                        successes: 0,
                        failures: 0,
                    };
                }
            }
        }
    }
}
