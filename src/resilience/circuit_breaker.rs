use crate::errors::{FabricError, FabricResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive dependency failures required to trip the breaker
    pub failure_threshold: u32,
    /// How long an open breaker waits before admitting a probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, testing if the dependency recovered
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name, used in health and metrics exports
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    forced_open: bool,
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive dependency failures observed while closed
    pub consecutive_failures: u32,
    /// Whether a half-open probe is currently in flight
    pub probe_in_flight: bool,
    /// Time until an open breaker admits a probe (None unless open)
    pub retry_in: Option<Duration>,
}

/// Per-operation circuit breaker.
///
/// Admission goes through [`try_acquire`](Self::try_acquire), which hands
/// out a [`CallPermit`]. The permit must be consumed with
/// [`success`](CallPermit::success) or [`failure`](CallPermit::failure);
/// dropping it unconsumed (caller cancellation) frees any probe slot
/// without touching the failure counters. At most one half-open probe is
/// in flight at any time; the admission test-and-set runs under the
/// per-breaker lock, so racing callers cannot both win.
pub struct CircuitBreaker {
    operation: String,
    config: CircuitBreakerConfig,
    shared: Mutex<Shared>,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker guarding the given operation key
    pub fn new(operation: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            shared: Mutex::new(Shared {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                forced_open: false,
            }),
            hook: None,
        }
    }

    /// Add a hook for circuit breaker state changes
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Operation key this breaker guards
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Request admission for one call.
    ///
    /// Closed admits freely; Open fails fast with
    /// [`FabricError::CircuitOpen`] until the reset timeout has elapsed,
    /// after which exactly one caller is admitted as the half-open probe.
    pub fn try_acquire(&self) -> FabricResult<CallPermit<'_>> {
        let mut transition = None;
        let result = {
            let mut shared = self.shared.lock();
            match shared.state {
                CircuitState::Closed => Ok(CallPermit {
                    breaker: self,
                    probe: false,
                    consumed: false,
                }),
                CircuitState::Open => {
                    if !shared.forced_open && self.reset_elapsed(&shared) {
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        shared.state = CircuitState::HalfOpen;
                        shared.probe_in_flight = true;
                        Ok(CallPermit {
                            breaker: self,
                            probe: true,
                            consumed: false,
                        })
                    } else {
                        Err(FabricError::CircuitOpen {
                            operation: self.operation.clone(),
                            retry_after: self.remaining_cooldown(&shared),
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    if shared.probe_in_flight {
                        Err(FabricError::CircuitOpen {
                            operation: self.operation.clone(),
                            retry_after: None,
                        })
                    } else {
                        shared.probe_in_flight = true;
                        Ok(CallPermit {
                            breaker: self,
                            probe: true,
                            consumed: false,
                        })
                    }
                }
            }
        };
        self.notify(transition);
        result
    }

    /// Check if the circuit breaker is currently blocking calls.
    ///
    /// An open breaker whose reset timeout has elapsed flips to half-open
    /// here (without claiming the probe slot) and reports unblocked.
    pub fn is_open(&self) -> bool {
        let mut transition = None;
        let blocked = {
            let mut shared = self.shared.lock();
            match shared.state {
                CircuitState::Closed | CircuitState::HalfOpen => false,
                CircuitState::Open => {
                    if !shared.forced_open && self.reset_elapsed(&shared) {
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        shared.state = CircuitState::HalfOpen;
                        false
                    } else {
                        true
                    }
                }
            }
        };
        self.notify(transition);
        blocked
    }

    /// Get the time until the circuit transitions to half-open
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let shared = self.shared.lock();
        if shared.state != CircuitState::Open || shared.forced_open {
            return None;
        }
        Some(self.remaining_cooldown(&shared).unwrap_or(Duration::ZERO))
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.shared.lock().state
    }

    /// Point-in-time snapshot for health reporting
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let shared = self.shared.lock();
        CircuitBreakerSnapshot {
            state: shared.state,
            consecutive_failures: shared.consecutive_failures,
            probe_in_flight: shared.probe_in_flight,
            retry_in: if shared.state == CircuitState::Open {
                self.remaining_cooldown(&shared)
            } else {
                None
            },
        }
    }

    /// Trip the breaker manually; it stays open until
    /// [`force_close`](Self::force_close) or [`reset`](Self::reset).
    /// Idempotent.
    pub fn force_open(&self) {
        let mut transition = None;
        {
            let mut shared = self.shared.lock();
            shared.forced_open = true;
            if shared.state != CircuitState::Open {
                transition = Some((shared.state, CircuitState::Open));
                shared.state = CircuitState::Open;
                shared.opened_at = Some(Instant::now());
                shared.probe_in_flight = false;
            }
        }
        self.notify(transition);
    }

    /// Close the breaker manually, clearing the failure count. Idempotent.
    pub fn force_close(&self) {
        self.clear(CircuitState::Closed);
    }

    /// Reset the breaker to its initial state. Idempotent; a no-op on a
    /// breaker that has seen no traffic.
    pub fn reset(&self) {
        self.clear(CircuitState::Closed);
    }

    fn clear(&self, target: CircuitState) {
        let mut transition = None;
        {
            let mut shared = self.shared.lock();
            shared.forced_open = false;
            shared.consecutive_failures = 0;
            shared.probe_in_flight = false;
            shared.opened_at = None;
            if shared.state != target {
                transition = Some((shared.state, target));
                shared.state = target;
            }
        }
        self.notify(transition);
    }

    fn on_success(&self, probe: bool) {
        let mut transition = None;
        {
            let mut shared = self.shared.lock();
            if probe {
                shared.probe_in_flight = false;
                if shared.state == CircuitState::HalfOpen {
                    transition = Some((shared.state, CircuitState::Closed));
                    shared.state = CircuitState::Closed;
                    shared.consecutive_failures = 0;
                    shared.opened_at = None;
                }
            } else if shared.state == CircuitState::Closed {
                shared.consecutive_failures = shared.consecutive_failures.saturating_sub(1);
            }
        }
        self.notify(transition);
    }

    fn on_failure(&self, probe: bool) {
        let mut transition = None;
        {
            let mut shared = self.shared.lock();
            if probe {
                shared.probe_in_flight = false;
                if shared.state == CircuitState::HalfOpen {
                    transition = Some((shared.state, CircuitState::Open));
                    shared.state = CircuitState::Open;
                    shared.opened_at = Some(Instant::now());
                }
            } else if shared.state == CircuitState::Closed {
                shared.consecutive_failures += 1;
                if shared.consecutive_failures >= self.config.failure_threshold {
                    transition = Some((shared.state, CircuitState::Open));
                    shared.state = CircuitState::Open;
                    shared.opened_at = Some(Instant::now());
                }
            }
        }
        self.notify(transition);
    }

    fn release_probe(&self) {
        let mut shared = self.shared.lock();
        shared.probe_in_flight = false;
    }

    fn reset_elapsed(&self, shared: &Shared) -> bool {
        match shared.opened_at {
            Some(at) => at.elapsed() >= self.config.reset_timeout,
            None => true,
        }
    }

    fn remaining_cooldown(&self, shared: &Shared) -> Option<Duration> {
        if shared.forced_open {
            return None;
        }
        shared
            .opened_at
            .map(|at| self.config.reset_timeout.saturating_sub(at.elapsed()))
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let (Some(hook), Some((old, new))) = (&self.hook, transition) {
            hook.on_state_change(old, new);
        }
    }
}

/// Admission permit handed out by [`CircuitBreaker::try_acquire`].
///
/// Must be consumed by exactly one of [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it unconsumed releases a probe
/// slot without recording anything.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    consumed: bool,
}

impl CallPermit<'_> {
    /// Record a successful call (closes the breaker from half-open)
    pub fn success(mut self) {
        self.consumed = true;
        self.breaker.on_success(self.probe);
    }

    /// Record a dependency failure (trips the breaker at the threshold,
    /// or reopens it from half-open)
    pub fn failure(mut self) {
        self.consumed = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.consumed && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Hook for circuit breaker state changes
pub trait CircuitBreakerHook: Send + Sync {
    /// Called after each state transition, outside the breaker's lock
    fn on_state_change(&self, old_state: CircuitState, new_state: CircuitState);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test.op",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    fn fail_once(cb: &CircuitBreaker) {
        cb.try_acquire().expect("admission").failure();
    }

    #[test]
    fn test_starts_closed() {
        let cb = breaker(3, 100);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 10_000);

        fail_once(&cb);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_success_decays_failure_count() {
        let cb = breaker(3, 10_000);

        fail_once(&cb);
        fail_once(&cb);
        cb.try_acquire().expect("admission").success();
        fail_once(&cb);
        // 2 failures, one success decay, one failure: count is 2 of 3.
        assert_eq!(cb.state(), CircuitState::Closed);

        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_blocks_underlying_call() {
        let cb = breaker(1, 10_000);
        let calls = AtomicU32::new(0);

        let mut invoke = || {
            if let Ok(permit) = cb.try_acquire() {
                calls.fetch_add(1, Ordering::SeqCst);
                permit.failure();
            }
        };
        invoke();
        assert_eq!(cb.state(), CircuitState::Open);
        invoke();
        invoke();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_probe_after_reset_timeout() {
        let cb = breaker(1, 10);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        let first = cb.try_acquire();
        let second = cb.try_acquire();
        assert!(first.is_ok());
        assert!(matches!(second, Err(FabricError::CircuitOpen { .. })));

        first.expect("probe").success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_cooldown() {
        let cb = breaker(1, 10);
        fail_once(&cb);
        std::thread::sleep(Duration::from_millis(20));

        cb.try_acquire().expect("probe").failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Cooldown restarted: no immediate re-probe.
        assert!(cb.try_acquire().is_err());
        assert!(cb.time_until_half_open().expect("open") > Duration::ZERO);
    }

    #[test]
    fn test_cancelled_probe_releases_slot() {
        let cb = breaker(1, 10);
        fail_once(&cb);
        std::thread::sleep(Duration::from_millis(20));

        let probe = cb.try_acquire().expect("probe");
        drop(probe);

        // Slot freed, state untouched, nothing counted as failure.
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_force_open_holds_past_reset_timeout() {
        let cb = breaker(5, 10);
        cb.force_open();
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.is_open());
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.time_until_half_open(), None);

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let cb = breaker(1, 10_000);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);

        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_time_until_half_open() {
        let cb = breaker(1, 100);
        assert_eq!(cb.time_until_half_open(), None);

        fail_once(&cb);
        let remaining = cb.time_until_half_open().expect("open");
        assert!(remaining <= Duration::from_millis(100));
    }

    struct TransitionCounter {
        opened: AtomicU32,
        closed: AtomicU32,
    }

    impl CircuitBreakerHook for TransitionCounter {
        fn on_state_change(&self, _old: CircuitState, new: CircuitState) {
            match new {
                CircuitState::Open => {
                    self.opened.fetch_add(1, Ordering::SeqCst);
                }
                CircuitState::Closed => {
                    self.closed.fetch_add(1, Ordering::SeqCst);
                }
                CircuitState::HalfOpen => {}
            }
        }
    }

    #[test]
    fn test_hook_sees_transitions() {
        let hook = Arc::new(TransitionCounter {
            opened: AtomicU32::new(0),
            closed: AtomicU32::new(0),
        });
        let cb = breaker(1, 10).with_hook(hook.clone());

        fail_once(&cb);
        assert_eq!(hook.opened.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(20));
        cb.try_acquire().expect("probe").success();
        assert_eq!(hook.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let cb = breaker(2, 10_000);
        fail_once(&cb);

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 1);
        assert!(!snap.probe_in_flight);
        assert_eq!(snap.retry_in, None);

        fail_once(&cb);
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.retry_in.expect("cooldown") > Duration::ZERO);
    }
}
