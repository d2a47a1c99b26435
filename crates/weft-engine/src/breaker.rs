//! Circuit breakers keyed by executor target.
//!
//! Each external collaborator gets its own breaker. Repeated transient
//! failures open the circuit; while open, every call is short-circuited
//! without reaching the collaborator. After a cooldown the breaker admits
//! a limited number of trial calls (half-open): a success closes it, a
//! failure re-opens it for another cooldown.

use std::time::{Duration, Instant};

use dashmap::DashMap;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting trials.
    pub cooldown: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_trials: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Single circuit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum CircuitState {
    /// Normal operation, tracking consecutive failures.
    Closed { consecutive_failures: u32 },
    /// Short-circuiting all calls until the cooldown elapses.
    Open { opened_at: Instant },
    /// Admitting a bounded number of trial calls.
    HalfOpen { trials_remaining: u32 },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
        }
    }

    /// Whether a call may proceed right now. Transitions Open -> HalfOpen
    /// when the cooldown has elapsed, and consumes a trial slot while
    /// half-open.
    pub fn try_acquire(&mut self) -> bool {
        match &mut self.state {
            CircuitState::Closed { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.cooldown {
                    let trials = self.config.half_open_trials.max(1);
                    self.state = CircuitState::HalfOpen {
                        trials_remaining: trials - 1,
                    };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { trials_remaining } => {
                if *trials_remaining > 0 {
                    *trials_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&mut self) {
        match &mut self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One breaker per target, created lazily on first use.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Whether a call to `target` may proceed.
    pub fn allow(&self, target: &str) -> bool {
        let mut entry = self
            .breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        let admitted = entry.try_acquire();
        if !admitted {
            tracing::warn!(target, state = entry.state_name(), "circuit rejecting call");
        }
        admitted
    }

    pub fn record_success(&self, target: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(target) {
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, target: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(target) {
            let before = breaker.state_name();
            breaker.record_failure();
            let after = breaker.state_name();
            if before != after {
                tracing::warn!(target, state = after, "circuit state changed");
            }
        }
    }

    pub fn state_of(&self, target: &str) -> Option<&'static str> {
        self.breakers.get(target).map(|b| b.state_name())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
