use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass; consecutive failures are counted.
    Closed,
    /// Requests are denied until the reset timeout elapses.
    Open,
    /// Probe traffic is admitted; successes close, any failure reopens.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible state of one breaker, for the inspection endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service_name: String,
    pub state: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_open_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: String,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Monotonic instant of the last Closed/HalfOpen -> Open transition,
    /// used for the reset-timeout decision.
    opened_at: Option<Instant>,
    /// Wall-clock counterpart, reported by the inspection endpoint.
    opened_at_utc: Option<DateTime<Utc>>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            opened_at_utc: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = Some(now);
        self.opened_at_utc = Some(Utc::now());
    }
}

/// Per-service three-state circuit breakers behind a shared registry.
/// Breakers are created lazily on the first `check_circuit` for a service.
pub struct CircuitBreakerService {
    breakers: RwLock<HashMap<String, Arc<Mutex<Breaker>>>>,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerService {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            reset_timeout = ?config.reset_timeout,
            "circuit breaker service initialized"
        );
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            reset_timeout: config.reset_timeout,
        }
    }

    /// Whether a request for `service` may proceed. The Open -> HalfOpen
    /// probe decision happens here, under the per-breaker lock, so at most
    /// one transition is observed per timer expiry.
    pub fn check_circuit(&self, service: &str) -> bool {
        self.check_at(service, Instant::now())
    }

    fn check_at(&self, service: &str, now: Instant) -> bool {
        let breaker = self.get_or_create(service);
        let mut breaker = breaker.lock();

        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = match breaker.opened_at {
                    Some(at) => at,
                    // Open always records an instant; treat a missing one as
                    // an expired timer rather than denying forever.
                    None => return true,
                };
                if now.duration_since(opened_at) > self.reset_timeout {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.failure_count = 0;
                    breaker.success_count = 0;
                    info!(service, old_state = "open", new_state = "half-open",
                        "circuit breaker state transition");
                    true
                } else {
                    debug!(service, "circuit breaker is open, request rejected");
                    false
                }
            }
        }
    }

    /// Record the outcome of a completed upstream request. Invoked by the
    /// proxy after the response status is known.
    pub fn record_result(&self, service: &str, success: bool) {
        self.record_at(service, success, Instant::now());
    }

    fn record_at(&self, service: &str, success: bool, now: Instant) {
        let breaker = match self.get(service) {
            Some(breaker) => breaker,
            None => {
                warn!(service, "result for a service without a circuit breaker, ignoring");
                return;
            }
        };
        let mut breaker = breaker.lock();

        if success {
            breaker.success_count += 1;
            breaker.failure_count = 0;

            if breaker.state == CircuitState::HalfOpen
                && breaker.success_count >= self.success_threshold
            {
                breaker.state = CircuitState::Closed;
                breaker.failure_count = 0;
                breaker.success_count = 0;
                info!(service, old_state = "half-open", new_state = "closed",
                    "circuit breaker state transition");
            }
        } else {
            breaker.failure_count += 1;
            breaker.success_count = 0;

            match breaker.state {
                CircuitState::Closed if breaker.failure_count >= self.failure_threshold => {
                    breaker.open(now);
                    warn!(service, old_state = "closed", new_state = "open",
                        failure_threshold = self.failure_threshold,
                        "circuit breaker state transition");
                }
                CircuitState::HalfOpen => {
                    breaker.open(now);
                    warn!(service, old_state = "half-open", new_state = "open",
                        "circuit breaker state transition");
                }
                _ => {}
            }
        }
    }

    /// Administrative reset back to Closed with cleared counters.
    pub fn reset(&self, service: &str) -> Result<()> {
        let breaker = self
            .get(service)
            .ok_or_else(|| GatewayError::ServiceNotConfigured(service.to_string()))?;

        let mut breaker = breaker.lock();
        breaker.state = CircuitState::Closed;
        breaker.failure_count = 0;
        breaker.success_count = 0;
        breaker.opened_at = None;
        breaker.opened_at_utc = None;

        info!(service, "circuit breaker reset");
        Ok(())
    }

    pub fn state(&self, service: &str) -> Option<CircuitState> {
        self.get(service).map(|breaker| breaker.lock().state)
    }

    pub fn all_states(&self) -> HashMap<String, CircuitSnapshot> {
        let breakers = self.breakers.read();
        breakers
            .iter()
            .map(|(service, breaker)| {
                let breaker = breaker.lock();
                let snapshot = CircuitSnapshot {
                    service_name: service.clone(),
                    state: breaker.state.as_str().to_string(),
                    failure_count: breaker.failure_count,
                    success_count: breaker.success_count,
                    last_open_time: breaker.opened_at_utc,
                    failure_threshold: self.failure_threshold,
                    success_threshold: self.success_threshold,
                    reset_timeout: format!("{}s", self.reset_timeout.as_secs()),
                };
                (service.clone(), snapshot)
            })
            .collect()
    }

    fn get(&self, service: &str) -> Option<Arc<Mutex<Breaker>>> {
        self.breakers.read().get(service).cloned()
    }

    fn get_or_create(&self, service: &str) -> Arc<Mutex<Breaker>> {
        if let Some(breaker) = self.get(service) {
            return breaker;
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service, "initialized circuit breaker");
                Arc::new(Mutex::new(Breaker::new()))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> CircuitBreakerService {
        CircuitBreakerService::new(&CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout,
        })
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let svc = service(3, 2, Duration::from_secs(60));
        let now = Instant::now();

        assert!(svc.check_at("svc", now));
        svc.record_at("svc", false, now);
        svc.record_at("svc", false, now);
        assert_eq!(svc.state("svc"), Some(CircuitState::Closed));

        svc.record_at("svc", false, now);
        assert_eq!(svc.state("svc"), Some(CircuitState::Open));
        assert!(!svc.check_at("svc", now));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let svc = service(3, 2, Duration::from_secs(60));
        let now = Instant::now();
        svc.check_at("svc", now);

        svc.record_at("svc", false, now);
        svc.record_at("svc", false, now);
        svc.record_at("svc", true, now);
        svc.record_at("svc", false, now);
        svc.record_at("svc", false, now);
        assert_eq!(svc.state("svc"), Some(CircuitState::Closed));

        svc.record_at("svc", false, now);
        assert_eq!(svc.state("svc"), Some(CircuitState::Open));
    }

    #[test]
    fn single_failure_opens_with_threshold_one() {
        let svc = service(1, 1, Duration::from_secs(60));
        let now = Instant::now();
        svc.check_at("svc", now);

        svc.record_at("svc", false, now);
        assert_eq!(svc.state("svc"), Some(CircuitState::Open));
    }

    #[test]
    fn probe_admitted_only_after_reset_timeout() {
        let svc = service(1, 2, Duration::from_secs(5));
        let start = Instant::now();
        svc.check_at("svc", start);
        svc.record_at("svc", false, start);

        // Within the timeout the circuit stays open.
        assert!(!svc.check_at("svc", start + Duration::from_secs(4)));
        assert_eq!(svc.state("svc"), Some(CircuitState::Open));

        // Strictly past the timeout one probe is admitted.
        assert!(svc.check_at("svc", start + Duration::from_secs(6)));
        assert_eq!(svc.state("svc"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let svc = service(1, 2, Duration::from_secs(1));
        let start = Instant::now();
        svc.check_at("svc", start);
        svc.record_at("svc", false, start);
        assert!(svc.check_at("svc", start + Duration::from_secs(2)));

        svc.record_at("svc", true, start + Duration::from_secs(2));
        assert_eq!(svc.state("svc"), Some(CircuitState::HalfOpen));

        svc.record_at("svc", true, start + Duration::from_secs(2));
        assert_eq!(svc.state("svc"), Some(CircuitState::Closed));
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let svc = service(1, 2, Duration::from_secs(1));
        let start = Instant::now();
        svc.check_at("svc", start);
        svc.record_at("svc", false, start);
        assert!(svc.check_at("svc", start + Duration::from_secs(2)));

        let reopened = start + Duration::from_secs(2);
        svc.record_at("svc", false, reopened);
        assert_eq!(svc.state("svc"), Some(CircuitState::Open));

        // The open timer restarts from the half-open failure.
        assert!(!svc.check_at("svc", reopened + Duration::from_millis(500)));
        assert!(svc.check_at("svc", reopened + Duration::from_secs(2)));
    }

    #[test]
    fn reset_allows_requests_regardless_of_prior_state() {
        let svc = service(1, 2, Duration::from_secs(60));
        let now = Instant::now();
        svc.check_at("svc", now);
        svc.record_at("svc", false, now);
        assert!(!svc.check_at("svc", now));

        svc.reset("svc").unwrap();
        assert!(svc.check_at("svc", now));
        assert_eq!(svc.state("svc"), Some(CircuitState::Closed));
    }

    #[test]
    fn reset_of_unknown_service_is_an_error() {
        let svc = service(1, 2, Duration::from_secs(60));
        assert!(svc.reset("nope").is_err());
    }

    #[test]
    fn result_for_unknown_service_is_ignored() {
        let svc = service(1, 2, Duration::from_secs(60));
        svc.record_result("nope", false);
        assert!(svc.state("nope").is_none());
    }

    #[test]
    fn snapshot_reflects_counters_and_thresholds() {
        let svc = service(5, 2, Duration::from_secs(60));
        let now = Instant::now();
        svc.check_at("svc", now);
        svc.record_at("svc", false, now);
        svc.record_at("svc", false, now);

        let states = svc.all_states();
        let snapshot = &states["svc"];
        assert_eq!(snapshot.state, "closed");
        assert_eq!(snapshot.failure_count, 2);
        assert_eq!(snapshot.failure_threshold, 5);
        assert_eq!(snapshot.reset_timeout, "60s");
        assert!(snapshot.last_open_time.is_none());
    }
}
