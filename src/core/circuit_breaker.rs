//! Per-service circuit breaking for downstream calls.
//!
//! Every remote invocation the dispatcher makes runs under a breaker keyed
//! by service name. The state machine:
//!
//! ```text
//! Closed → Open: error rate over the rolling window exceeds the threshold
//!                (once at least `request_volume_threshold` calls are seen)
//! Open → Half-Open: after `sleep_window`
//! Half-Open → Closed: the single probe request succeeds
//! Half-Open → Open: the probe fails
//! ```
//!
//! While open, calls short-circuit to the fallback without touching the
//! downstream service. Each call is additionally bounded by a wall-clock
//! timeout independent of any network-level timeout.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use thiserror::Error;

/// Error surfaced to the fallback when an operation does not complete.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BreakerError<E> {
    /// The breaker was open and the operation was never started.
    #[error("circuit open, request short-circuited")]
    Open,

    /// The operation ran longer than the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed.
    #[error(transparent)]
    Operation(E),
}

/// Tunables for one breaker. Shared defaults live in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Wall-clock bound for a single guarded operation.
    pub timeout: Duration,
    /// Minimum number of calls in the window before the breaker may trip.
    pub request_volume_threshold: u32,
    /// Error percentage (0-100) at which the breaker opens.
    pub error_percent_threshold: u8,
    /// How long the breaker stays open before admitting a probe.
    pub sleep_window: Duration,
    /// Length of the rolling statistics window.
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            request_volume_threshold: 20,
            error_percent_threshold: 50,
            sleep_window: Duration::from_millis(5000),
            window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Stats {
    state: State,
    // (completion time, success) outcomes inside the rolling window.
    outcomes: VecDeque<(Instant, bool)>,
}

/// Failure-tracking wrapper around remote invocations for one service name.
pub struct CircuitBreaker {
    config: BreakerConfig,
    stats: Mutex<Stats>,
}

enum Admission {
    Pass,
    Probe,
}

/// Releases the half-open probe slot if the guarded future never completes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        let mut stats = self.breaker.lock_stats();
        if matches!(stats.state, State::HalfOpen { .. }) {
            stats.state = State::HalfOpen {
                probe_in_flight: false,
            };
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(Stats {
                state: State::Closed,
                outcomes: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` under the breaker, producing the fallback's value on
    /// open, timeout or operation error. Success and failure are recorded
    /// against the rolling window either way.
    pub async fn execute<T, E, F, FB>(&self, operation: F, fallback: FB) -> T
    where
        F: Future<Output = Result<T, E>>,
        FB: FnOnce(BreakerError<E>) -> T,
    {
        let admission = match self.admit() {
            Some(admission) => admission,
            None => return fallback(BreakerError::Open),
        };
        let probing = matches!(admission, Admission::Probe);
        // If the caller drops us mid-probe (client disconnect), free the
        // probe slot so the breaker is not wedged half-open.
        let mut probe_guard = probing.then(|| ProbeGuard { breaker: self });

        let outcome = tokio::time::timeout(self.config.timeout, operation).await;
        if let Some(guard) = probe_guard.take() {
            std::mem::forget(guard);
        }

        match outcome {
            Ok(Ok(value)) => {
                self.record(true, probing);
                value
            }
            Ok(Err(err)) => {
                self.record(false, probing);
                fallback(BreakerError::Operation(err))
            }
            Err(_elapsed) => {
                self.record(false, probing);
                fallback(BreakerError::Timeout(self.config.timeout))
            }
        }
    }

    /// Current state as a coarse label, for logs and diagnostics.
    pub fn is_open(&self) -> bool {
        let stats = self.lock_stats();
        matches!(stats.state, State::Open { .. })
    }

    fn admit(&self) -> Option<Admission> {
        let mut stats = self.lock_stats();
        match stats.state {
            State::Closed => Some(Admission::Pass),
            State::Open { since } => {
                if since.elapsed() >= self.config.sleep_window {
                    stats.state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    Some(Admission::Probe)
                } else {
                    None
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    None
                } else {
                    stats.state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn record(&self, success: bool, probing: bool) {
        let now = Instant::now();
        let mut stats = self.lock_stats();

        if probing {
            if success {
                stats.state = State::Closed;
                stats.outcomes.clear();
            } else {
                stats.state = State::Open { since: now };
            }
            return;
        }

        stats.outcomes.push_back((now, success));
        if let Some(horizon) = now.checked_sub(self.config.window) {
            while let Some(&(at, _)) = stats.outcomes.front() {
                if at < horizon {
                    stats.outcomes.pop_front();
                } else {
                    break;
                }
            }
        }

        if !success && matches!(stats.state, State::Closed) {
            let total = stats.outcomes.len() as u32;
            if total >= self.config.request_volume_threshold {
                let failures = stats.outcomes.iter().filter(|(_, ok)| !ok).count() as u32;
                let error_percent = failures * 100 / total;
                if error_percent >= u32::from(self.config.error_percent_threshold) {
                    stats.state = State::Open { since: now };
                }
            }
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, Stats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-wide set of breakers keyed by service name.
///
/// Registration is lazy and idempotent: the first request for a name creates
/// its breaker from the shared defaults, later requests reuse it regardless
/// of how many tasks race on the first sight of the name.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: scc::HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: scc::HashMap::new(),
        }
    }

    /// Fetch the breaker for `service`, registering it on first sight.
    pub async fn prepare(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read_async(service, |_, breaker| breaker.clone())
            .await
        {
            return existing;
        }
        self.breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.defaults.clone())))
            .get()
            .clone()
    }

    /// Number of registered service names.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
