//! Circuit breaker for provider fallback chains.
//!
//! Tracks consecutive failures per provider. Past the configured threshold
//! the breaker opens and the adapter skips the provider without attempting
//! it, moving straight to the next fallback. After the cool-down one probe
//! request is allowed through; success closes the breaker.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
}

/// Per-provider failure tracker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a request may be attempted right now. An open breaker past
    /// its cool-down allows one probe; the outcome of that probe decides
    /// whether it closes again.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match &*state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    debug!(provider = %self.name, "circuit breaker allowing probe after cooldown");
                    // Restart the window so a failing probe doesn't hammer
                    *state = BreakerState::Open {
                        since: Instant::now(),
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if matches!(&*state, BreakerState::Open { .. }) {
            debug!(provider = %self.name, "circuit breaker closed after successful probe");
        }
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        provider = %self.name,
                        failures = *consecutive_failures,
                        "circuit breaker opened"
                    );
                    *state = BreakerState::Open {
                        since: Instant::now(),
                    };
                }
            }
            BreakerState::Open { .. } => {
                // Failed probe; window was already restarted in allow()
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.state.lock(), BreakerState::Open { .. })
    }
}
