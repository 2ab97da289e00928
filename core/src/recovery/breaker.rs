use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker around one named operation. Fails fast while Open,
/// probes with HalfOpen after `timeout`, closes again after
/// `success_threshold` consecutive probe successes.
///
/// Both counters reset on every state transition.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    success_threshold: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, timeout: Duration, success_threshold: u32) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            timeout,
            success_threshold,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Defaults from the recovery design: 5 failures, 60 s timeout,
    /// 2 probe successes.
    pub fn with_defaults(name: &str) -> Self {
        Self::new(name, 5, Duration::from_secs(60), 2)
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::transition(&mut inner, CircuitState::Closed);
        inner.last_failure = None;
    }

    fn transition(inner: &mut BreakerInner, to: CircuitState) {
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    /// Run `f` through the breaker. While Open, `f` is not invoked at all.
    /// A panic inside `f` counts as a failure and is reported as an error
    /// rather than unwinding further.
    pub fn call<T>(&self, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.timeout {
                    Self::transition(&mut inner, CircuitState::HalfOpen);
                } else {
                    return Err(CoreError::CircuitOpen(self.name.clone()));
                }
            }
        }

        let outcome = catch_unwind(AssertUnwindSafe(f));
        match outcome {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(e)
            }
            Err(panic) => {
                self.on_failure();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic".to_string());
                log::error!("operation {} panicked: {message}", self.name);
                Err(CoreError::StorageIo(format!(
                    "operation {} panicked: {message}",
                    self.name
                )))
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    Self::transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                Self::transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    Self::transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Bounded retries with exponential backoff: `base * 2^attempt`, capped
/// at `max_delay`. Runs on scheduler threads only; never under the chain
/// writer lock.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(20));
        exp.min(self.max_delay)
    }

    pub fn execute<T>(&self, mut f: impl FnMut() -> CoreResult<T>) -> CoreResult<T> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < self.max_retries {
                        std::thread::sleep(self.delay_for_attempt(attempt));
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 2, Duration::from_millis(20), 2)
    }

    fn failing() -> CoreResult<()> {
        Err(CoreError::StorageIo("nope".into()))
    }

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = fast_breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);

        // While open the closure is not even invoked.
        let mut ran = false;
        let result = breaker.call(|| {
            ran = true;
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::CircuitOpen(_))));
        assert!(!ran);
    }

    #[test]
    fn half_open_probe_closes_after_successes() {
        let breaker = fast_breaker();
        let _ = breaker.call(failing);
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(25));

        breaker.call(|| Ok(())).unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.call(|| Ok(())).unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = fast_breaker();
        let _ = breaker.call(failing);
        let _ = breaker.call(failing);
        std::thread::sleep(Duration::from_millis(25));

        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn counters_reset_on_every_transition() {
        let breaker = fast_breaker();
        let _ = breaker.call(failing);
        let _ = breaker.call(failing);
        std::thread::sleep(Duration::from_millis(25));
        // One probe success, then reopen on failure: the success counter
        // must not survive into the next half-open round.
        breaker.call(|| Ok(())).unwrap();
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(25));
        breaker.call(|| Ok(())).unwrap();
        // Still half-open: needs two fresh successes.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.call(|| Ok(())).unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn panic_counts_as_failure() {
        let breaker = fast_breaker();
        let result: CoreResult<()> = breaker.call(|| panic!("boom"));
        assert!(result.is_err());
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn manual_reset_closes() {
        let breaker = fast_breaker();
        let _ = breaker.call(failing);
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let mut attempts = 0;
        let result = policy.execute(|| {
            attempts += 1;
            if attempts < 3 {
                Err(CoreError::StorageIo("transient".into()))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn retry_exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let result: CoreResult<()> = policy.execute(failing);
        assert!(matches!(result, Err(CoreError::StorageIo(_))));
    }
}
