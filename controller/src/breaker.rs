//! Breaker holds the per-source circuit breaker.
//!
//! Repeated reconcile failures for one key open its circuit; while open,
//! reconciles short-circuit instead of hammering the API. After
//! `reset_timeout` a single probe is allowed through (half-open); enough
//! consecutive probe successes close the circuit again.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Config is the breaker thresholds.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing a probe.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes before the circuit closes.
    pub half_open_success_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_success_threshold: 2,
        }
    }
}

/// State is the observable condition of one circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Requests flow normally.
    Closed,
    /// Requests are refused.
    Open,
    /// A probe is permitted.
    HalfOpen,
}

#[derive(Debug)]
struct Entry {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_error: Option<String>,
}

impl Entry {
    fn new() -> Entry {
        Entry {
            state: State::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_error: None,
        }
    }

    fn cooled_down(&self, reset: Duration) -> bool {
        self.last_failure
            .is_none_or(|t| t.elapsed() >= reset)
    }
}

/// Stats is a point-in-time snapshot of one circuit, for introspection.
#[derive(Clone, Debug)]
pub struct Stats {
    /// Reported state, reset-timeout aging applied.
    pub state: State,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
    /// Current consecutive half-open success count.
    pub consecutive_successes: u32,
    /// The most recent failure message.
    pub last_error: Option<String>,
}

/// CircuitBreaker tracks circuits per `namespace/name/kind` key.
///
/// The outer map supports concurrent lookup; mutation locks only the entry's
/// shard.
pub struct CircuitBreaker {
    cfg: Config,
    entries: DashMap<String, Entry>,
}

/// Key builds the breaker key for an object.
pub fn key(namespace: &str, name: &str, kind: &str) -> String {
    format!("{namespace}/{name}/{kind}")
}

impl CircuitBreaker {
    /// New builds a breaker with the provided thresholds.
    pub fn new(cfg: Config) -> CircuitBreaker {
        CircuitBreaker {
            cfg,
            entries: DashMap::new(),
        }
    }

    /// Allow_request reports whether a reconcile for `key` may proceed,
    /// moving an aged-out open circuit to half-open.
    pub fn allow_request(&self, key: &str) -> bool {
        let Some(mut e) = self.entries.get_mut(key) else {
            return true;
        };
        match e.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                if e.cooled_down(self.cfg.reset_timeout) {
                    e.state = State::HalfOpen;
                    e.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record_success notes a successful reconcile for `key`.
    pub fn record_success(&self, key: &str) {
        let Some(mut e) = self.entries.get_mut(key) else {
            return;
        };
        match e.state {
            State::Closed => {
                e.consecutive_failures = 0;
                e.last_error = None;
            }
            State::HalfOpen => {
                e.consecutive_successes = e.consecutive_successes.saturating_add(1);
                if e.consecutive_successes >= self.cfg.half_open_success_threshold {
                    *e = Entry::new();
                }
            }
            // A success while open means the caller raced a state change;
            // leave the cooldown running.
            State::Open => (),
        }
    }

    /// Record_failure notes a failed reconcile for `key`. Returns true when
    /// this failure just opened the circuit.
    pub fn record_failure(&self, key: &str, error: &str) -> bool {
        let mut e = self.entries.entry(key.to_string()).or_insert_with(Entry::new);
        e.last_failure = Some(Instant::now());
        e.last_error = Some(error.to_string());
        e.consecutive_successes = 0;
        match e.state {
            State::Closed => {
                e.consecutive_failures = e.consecutive_failures.saturating_add(1);
                if e.consecutive_failures >= self.cfg.failure_threshold {
                    e.state = State::Open;
                    return true;
                }
                false
            }
            State::HalfOpen => {
                e.state = State::Open;
                false
            }
            State::Open => false,
        }
    }

    /// State reports the circuit for `key`, aging an open circuit to
    /// half-open without mutating the record.
    pub fn state(&self, key: &str) -> State {
        let Some(e) = self.entries.get(key) else {
            return State::Closed;
        };
        match e.state {
            State::Open if e.cooled_down(self.cfg.reset_timeout) => State::HalfOpen,
            s => s,
        }
    }

    /// Consecutive_failures reports the current failure streak for `key`.
    /// The error-policy uses this to scale its backoff.
    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.entries
            .get(key)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Reset_timeout is the configured cooldown, for requeue scheduling.
    pub fn reset_timeout(&self) -> Duration {
        self.cfg.reset_timeout
    }

    /// Open_circuits lists the keys whose circuit is currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|kv| {
                kv.value().state == State::Open
                    && !kv.value().cooled_down(self.cfg.reset_timeout)
            })
            .map(|kv| kv.key().clone())
            .collect()
    }

    /// Stats snapshots every circuit.
    pub fn stats(&self) -> Vec<(String, Stats)> {
        self.entries
            .iter()
            .map(|kv| {
                let e = kv.value();
                let state = match e.state {
                    State::Open if e.cooled_down(self.cfg.reset_timeout) => State::HalfOpen,
                    s => s,
                };
                (
                    kv.key().clone(),
                    Stats {
                        state,
                        consecutive_failures: e.consecutive_failures,
                        consecutive_successes: e.consecutive_successes,
                        last_error: e.last_error.clone(),
                    },
                )
            })
            .collect()
    }
}
