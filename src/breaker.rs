use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use http::{Method, StatusCode, Uri};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, circuit_open_error};
use crate::util::{default_port, lock_unpoisoned, path_segments};

const SIGNATURE_PATH_SEGMENTS: usize = 3;
const SIGNATURE_PATH_MAX_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    failure_threshold: usize,
    cool_down: Duration,
    counts_too_many_requests: bool,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            failure_threshold: 25,
            cool_down: Duration::from_secs(7),
            counts_too_many_requests: true,
        }
    }

    pub const fn failure_threshold(mut self, failure_threshold: usize) -> Self {
        self.failure_threshold = if failure_threshold == 0 {
            1
        } else {
            failure_threshold
        };
        self
    }

    pub const fn cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    pub const fn counts_too_many_requests(mut self, counts: bool) -> Self {
        self.counts_too_many_requests = counts;
        self
    }

    pub const fn configured_failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub const fn configured_cool_down(&self) -> Duration {
        self.cool_down
    }

    pub fn is_failure_status(&self, status: StatusCode) -> bool {
        match status.as_u16() {
            500 | 502 | 503 | 504 => true,
            429 => self.counts_too_many_requests,
            _ => false,
        }
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BreakerOutcome {
    Success,
    Failure,
    Neutral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitAttemptKind {
    Closed,
    HalfOpen,
}

#[derive(Debug)]
enum CircuitState {
    Closed {
        consecutive_failures: usize,
    },
    Open {
        opened_at: std::time::Instant,
        failure_streak: usize,
    },
    HalfOpen {
        probe_in_flight: bool,
        failure_streak: usize,
    },
}

/// Failure state for one endpoint signature.
///
/// The breaker holds no policy of its own: every admission carries the calling client's
/// [`CircuitBreakerPolicy`], so clients sharing a registry keep their own thresholds and
/// cool-downs while counting failures against the same endpoint.
pub struct CircuitBreaker {
    signature: String,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitBreaker")
            .field("signature", &self.signature)
            .field("state", &self.state)
            .finish()
    }
}

impl CircuitBreaker {
    pub(crate) fn new(signature: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            signature,
            clock,
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn state(&self) -> BreakerState {
        match &*lock_unpoisoned(&self.state) {
            CircuitState::Closed { .. } => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        match &*lock_unpoisoned(&self.state) {
            CircuitState::Closed {
                consecutive_failures,
            } => *consecutive_failures,
            CircuitState::Open { failure_streak, .. }
            | CircuitState::HalfOpen { failure_streak, .. } => *failure_streak,
        }
    }

    pub(crate) fn begin(
        self: &Arc<Self>,
        policy: &CircuitBreakerPolicy,
    ) -> Result<CircuitAttempt, Error> {
        let mut state = lock_unpoisoned(&self.state);
        let now = self.clock.now();
        let kind = match &mut *state {
            CircuitState::Closed { .. } => CircuitAttemptKind::Closed,
            CircuitState::Open {
                opened_at,
                failure_streak,
            } => {
                let elapsed = now.saturating_duration_since(*opened_at);
                if elapsed < policy.cool_down {
                    return Err(circuit_open_error(
                        &self.signature,
                        *failure_streak,
                        policy.cool_down,
                        policy.cool_down - elapsed,
                    ));
                }
                *state = CircuitState::HalfOpen {
                    probe_in_flight: true,
                    failure_streak: *failure_streak,
                };
                CircuitAttemptKind::HalfOpen
            }
            CircuitState::HalfOpen {
                probe_in_flight,
                failure_streak,
            } => {
                if *probe_in_flight {
                    return Err(circuit_open_error(
                        &self.signature,
                        *failure_streak,
                        policy.cool_down,
                        Duration::ZERO,
                    ));
                }
                *probe_in_flight = true;
                CircuitAttemptKind::HalfOpen
            }
        };
        Ok(CircuitAttempt {
            breaker: Arc::clone(self),
            policy: *policy,
            kind,
            completed: false,
        })
    }

    fn record_success(&self, kind: CircuitAttemptKind) {
        let mut state = lock_unpoisoned(&self.state);
        match (&mut *state, kind) {
            (
                CircuitState::Closed {
                    consecutive_failures,
                },
                CircuitAttemptKind::Closed,
            ) => {
                *consecutive_failures = 0;
            }
            (CircuitState::HalfOpen { .. }, CircuitAttemptKind::HalfOpen) => {
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            _ => {}
        }
    }

    /// Returns `true` when this failure opened the circuit.
    fn record_failure(&self, kind: CircuitAttemptKind, failure_threshold: usize) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        let now = self.clock.now();
        match (&mut *state, kind) {
            (
                CircuitState::Closed {
                    consecutive_failures,
                },
                CircuitAttemptKind::Closed,
            ) => {
                *consecutive_failures = consecutive_failures.saturating_add(1);
                if *consecutive_failures >= failure_threshold {
                    let failure_streak = *consecutive_failures;
                    *state = CircuitState::Open {
                        opened_at: now,
                        failure_streak,
                    };
                    return true;
                }
                false
            }
            (CircuitState::HalfOpen { failure_streak, .. }, CircuitAttemptKind::HalfOpen) => {
                let failure_streak = failure_streak.saturating_add(1);
                *state = CircuitState::Open {
                    opened_at: now,
                    failure_streak,
                };
                true
            }
            _ => false,
        }
    }

    fn release(&self, kind: CircuitAttemptKind) {
        if kind != CircuitAttemptKind::HalfOpen {
            return;
        }
        let mut state = lock_unpoisoned(&self.state);
        if let CircuitState::HalfOpen {
            probe_in_flight, ..
        } = &mut *state
        {
            *probe_in_flight = false;
        }
    }
}

/// One unit of work admitted by a breaker.
///
/// Dropping an attempt without completing it counts neither for nor against the endpoint.
pub(crate) struct CircuitAttempt {
    breaker: Arc<CircuitBreaker>,
    policy: CircuitBreakerPolicy,
    kind: CircuitAttemptKind,
    completed: bool,
}

impl CircuitAttempt {
    /// Returns `true` when the outcome tripped the breaker open.
    pub(crate) fn complete(mut self, outcome: BreakerOutcome) -> bool {
        self.completed = true;
        match outcome {
            BreakerOutcome::Success => {
                self.breaker.record_success(self.kind);
                false
            }
            BreakerOutcome::Failure => self
                .breaker
                .record_failure(self.kind, self.policy.failure_threshold),
            BreakerOutcome::Neutral => {
                self.breaker.release(self.kind);
                false
            }
        }
    }
}

impl Drop for CircuitAttempt {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.release(self.kind);
            self.completed = true;
        }
    }
}

/// Process-wide map of breakers, one per endpoint signature, created on first use.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BreakerRegistry")
            .field("breakers", &self.breakers.len())
            .finish()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            clock,
        }
    }

    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<BreakerRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(BreakerRegistry::new())))
    }

    pub fn get_or_create(&self, signature: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(signature) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(signature.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    signature.to_owned(),
                    Arc::clone(&self.clock),
                ))
            });
        Arc::clone(breaker.value())
    }

    pub fn get(&self, signature: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(signature)
            .map(|breaker| Arc::clone(breaker.value()))
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalized key for breaker and metrics purposes: different logical endpoints on the same
/// host get different signatures, while ids deep in the path collapse onto one.
pub fn endpoint_signature(method: &Method, uri: &Uri, caller_authenticated: bool) -> String {
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
    let host = uri.host().unwrap_or_default().to_ascii_lowercase();
    let port = default_port(uri).unwrap_or_default();

    let mut path = String::new();
    for segment in path_segments(uri).take(SIGNATURE_PATH_SEGMENTS) {
        path.push('/');
        path.push_str(&segment.to_ascii_lowercase());
    }
    if path.is_empty() {
        path.push('/');
    }
    if path.chars().count() > SIGNATURE_PATH_MAX_LEN {
        path = path.chars().take(SIGNATURE_PATH_MAX_LEN).collect();
    }

    let auth = if caller_authenticated { "auth" } else { "anon" };
    format!("{method} {scheme}://{host}:{port}{path} {auth}")
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use http::{Method, StatusCode, Uri};

    use super::{
        BreakerOutcome, BreakerRegistry, BreakerState, CircuitBreaker, CircuitBreakerPolicy,
        endpoint_signature,
    };
    use crate::clock::Clock;
    use crate::error::Error;

    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        fn advance(&self, by: Duration) {
            let mut offset = self.offset.lock().expect("clock lock");
            *offset += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().expect("clock lock")
        }
    }

    fn policy(threshold: usize) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::standard()
            .failure_threshold(threshold)
            .cool_down(Duration::from_secs(7))
    }

    fn breaker(clock: Arc<ManualClock>) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "GET https://api.example.com:443/v1 anon".to_owned(),
            clock,
        ))
    }

    #[test]
    fn opens_after_threshold_and_rejects_until_cool_down() {
        let clock = ManualClock::new();
        let policy = policy(3);
        let breaker = breaker(Arc::clone(&clock));

        for _ in 0..2 {
            let attempt = breaker.begin(&policy).expect("closed breaker admits calls");
            assert!(!attempt.complete(BreakerOutcome::Failure));
        }
        let attempt = breaker.begin(&policy).expect("closed breaker admits calls");
        assert!(attempt.complete(BreakerOutcome::Failure), "third failure trips");
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(Duration::from_secs(2));
        match breaker.begin(&policy) {
            Err(Error::CircuitOpen {
                failure_streak,
                cool_down_ms,
                retry_after_ms,
                ..
            }) => {
                assert_eq!(failure_streak, 3);
                assert_eq!(cool_down_ms, 7_000);
                assert_eq!(retry_after_ms, 5_000);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open breaker must reject"),
        }

        clock.advance(Duration::from_secs(5));
        let probe = breaker.begin(&policy).expect("cool-down elapsed, probe allowed");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.begin(&policy).is_err(), "only one probe at a time");
        assert!(!probe.complete(BreakerOutcome::Success));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn failed_probe_reopens_for_another_cool_down() {
        let clock = ManualClock::new();
        let policy = policy(1);
        let breaker = breaker(Arc::clone(&clock));

        let attempt = breaker.begin(&policy).expect("closed breaker admits calls");
        assert!(attempt.complete(BreakerOutcome::Failure));
        clock.advance(Duration::from_secs(7));

        let probe = breaker.begin(&policy).expect("probe allowed");
        assert!(probe.complete(BreakerOutcome::Failure));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.begin(&policy).is_err());

        clock.advance(Duration::from_secs(7));
        assert!(breaker.begin(&policy).is_ok());
    }

    #[test]
    fn success_resets_the_streak() {
        let clock = ManualClock::new();
        let policy = policy(2);
        let breaker = breaker(clock);

        let attempt = breaker.begin(&policy).expect("admitted");
        attempt.complete(BreakerOutcome::Failure);
        let attempt = breaker.begin(&policy).expect("admitted");
        attempt.complete(BreakerOutcome::Success);
        let attempt = breaker.begin(&policy).expect("admitted");
        assert!(!attempt.complete(BreakerOutcome::Failure));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn abandoned_probe_frees_the_slot() {
        let clock = ManualClock::new();
        let policy = policy(1);
        let breaker = breaker(Arc::clone(&clock));

        breaker
            .begin(&policy)
            .expect("admitted")
            .complete(BreakerOutcome::Failure);
        clock.advance(Duration::from_secs(8));

        drop(breaker.begin(&policy).expect("probe allowed"));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.begin(&policy).is_ok(), "dropped probe must not block the next one");
    }

    #[test]
    fn each_admission_applies_its_callers_policy() {
        let clock = ManualClock::new();
        let breaker = breaker(Arc::clone(&clock));
        let lenient = policy(25);
        let strict = policy(2).cool_down(Duration::from_secs(3));

        let attempt = breaker.begin(&lenient).expect("admitted");
        assert!(!attempt.complete(BreakerOutcome::Failure));
        let attempt = breaker.begin(&strict).expect("admitted");
        assert!(
            attempt.complete(BreakerOutcome::Failure),
            "shared streak reaches the strict threshold"
        );

        match breaker.begin(&strict) {
            Err(Error::CircuitOpen {
                failure_streak,
                cool_down_ms,
                ..
            }) => {
                assert_eq!(failure_streak, 2);
                assert_eq!(cool_down_ms, 3_000);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open breaker must reject"),
        }

        clock.advance(Duration::from_secs(3));
        assert!(breaker.begin(&lenient).is_err(), "lenient cool-down still running");
        assert!(breaker.begin(&strict).is_ok(), "strict cool-down elapsed");
    }

    #[test]
    fn registry_returns_one_breaker_per_signature() {
        let registry = BreakerRegistry::new();
        let first = registry.get_or_create("a");
        let again = registry.get_or_create("a");
        let other = registry.get_or_create("b");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn failure_statuses_make_too_many_requests_configurable() {
        let policy = CircuitBreakerPolicy::standard();
        assert!(policy.is_failure_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(policy.is_failure_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!policy.is_failure_status(StatusCode::NOT_FOUND));

        let lenient = policy.counts_too_many_requests(false);
        assert!(!lenient.is_failure_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn signature_separates_endpoints_and_truncates_paths() {
        let items: Uri = "https://API.example.com/v1/items/42/details?x=1"
            .parse()
            .expect("uri should parse");
        let orders: Uri = "https://api.example.com/v1/orders"
            .parse()
            .expect("uri should parse");

        assert_eq!(
            endpoint_signature(&Method::GET, &items, false),
            "GET https://api.example.com:443/v1/items/42 anon"
        );
        assert_ne!(
            endpoint_signature(&Method::GET, &items, false),
            endpoint_signature(&Method::GET, &orders, false)
        );
        assert_ne!(
            endpoint_signature(&Method::GET, &orders, false),
            endpoint_signature(&Method::GET, &orders, true)
        );
        assert_ne!(
            endpoint_signature(&Method::GET, &orders, false),
            endpoint_signature(&Method::POST, &orders, false)
        );

        let long_segment = "a".repeat(200);
        let long: Uri = format!("http://api.example.com/{long_segment}")
            .parse()
            .expect("uri should parse");
        let signature = endpoint_signature(&Method::GET, &long, false);
        assert!(signature.len() < 120);
    }
}
