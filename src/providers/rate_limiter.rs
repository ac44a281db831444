use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{GenerationOptions, ProviderClient, UsageStats};
use crate::clock::Clock;
use crate::error::ProviderError;

/// Wall-clock pacing around a single client.
///
/// Each call waits until `60 / requests_per_minute` seconds have passed since
/// the previous call *completed*. The lock is held across the wait and the
/// call, so concurrent callers sharing one limiter are serialized.
pub struct RateLimiter<C> {
    inner: C,
    min_interval: Duration,
    clock: Arc<dyn Clock>,
    last_completed: Mutex<Option<Instant>>,
}

impl<C: ProviderClient> RateLimiter<C> {
    pub fn with_clock(inner: C, requests_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        let min_interval = Duration::from_secs_f64(60.0 / f64::from(requests_per_minute.max(1)));
        Self {
            inner,
            min_interval,
            clock,
            last_completed: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: ProviderClient> ProviderClient for RateLimiter<C> {
    fn generate_response(&self, prompt: &str, options: &GenerationOptions) -> Result<String, ProviderError> {
        let mut last_completed = self.last_completed.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(previous) = *last_completed {
            let elapsed = self.clock.now().saturating_duration_since(previous);
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "Rate limiter pacing");
                self.clock.sleep(wait);
            }
        }

        let result = self.inner.generate_response(prompt, options);
        // failed calls count too: the upstream still saw the request
        *last_completed = Some(self.clock.now());
        result
    }

    fn stats(&self) -> UsageStats {
        self.inner.stats()
    }

    fn reset_stats(&self) {
        self.inner.reset_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::providers::UsageCounter;

    /// Records the clock reading at which each request fires.
    struct StampingClient {
        clock: Arc<ManualClock>,
        fired_at: Mutex<Vec<Instant>>,
        call_cost: Duration,
        usage: UsageCounter,
    }

    impl StampingClient {
        fn new(clock: Arc<ManualClock>, call_cost: Duration) -> Self {
            Self {
                clock,
                fired_at: Mutex::new(Vec::new()),
                call_cost,
                usage: UsageCounter::new("stamp"),
            }
        }
    }

    impl ProviderClient for StampingClient {
        fn generate_response(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String, ProviderError> {
            self.fired_at.lock().unwrap().push(self.clock.now());
            self.clock.advance(self.call_cost);
            self.usage.record(1);
            Ok("4".into())
        }

        fn stats(&self) -> UsageStats {
            self.usage.snapshot()
        }

        fn reset_stats(&self) {
            self.usage.reset()
        }
    }

    #[test]
    fn second_immediate_call_waits_one_interval() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(
            StampingClient::new(clock.clone(), Duration::ZERO),
            60,
            clock.clone(),
        );
        let options = GenerationOptions::default();

        limiter.generate_response("a", &options).unwrap();
        limiter.generate_response("b", &options).unwrap();

        let fired = limiter.inner().fired_at.lock().unwrap().clone();
        assert_eq!(fired[1] - fired[0], Duration::from_secs(1));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn interval_counts_from_completion_not_start() {
        let clock = Arc::new(ManualClock::new());
        // each call takes 400ms upstream
        let limiter = RateLimiter::with_clock(
            StampingClient::new(clock.clone(), Duration::from_millis(400)),
            60,
            clock.clone(),
        );
        let options = GenerationOptions::default();

        limiter.generate_response("a", &options).unwrap();
        limiter.generate_response("b", &options).unwrap();

        let fired = limiter.inner().fired_at.lock().unwrap().clone();
        assert_eq!(fired[1] - fired[0], Duration::from_millis(1400));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn no_wait_when_interval_already_elapsed() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(
            StampingClient::new(clock.clone(), Duration::ZERO),
            30,
            clock.clone(),
        );
        assert_eq!(limiter.min_interval(), Duration::from_secs(2));
        let options = GenerationOptions::default();

        limiter.generate_response("a", &options).unwrap();
        clock.advance(Duration::from_secs(5));
        limiter.generate_response("b", &options).unwrap();
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn threads_sharing_one_limiter_are_paced() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(
            StampingClient::new(clock.clone(), Duration::from_millis(250)),
            60,
            clock.clone(),
        );
        let options = GenerationOptions::default();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..3 {
                        limiter.generate_response("q", &options).unwrap();
                    }
                });
            }
        });

        let fired = limiter.inner().fired_at.lock().unwrap().clone();
        assert_eq!(fired.len(), 12);
        for pair in fired.windows(2) {
            // previous call's 250ms upstream time plus the full interval
            assert!(pair[1] - pair[0] >= Duration::from_millis(1250), "gap {:?}", pair[1] - pair[0]);
        }
        assert_eq!(limiter.stats().request_count, 12);
    }

    #[test]
    fn stats_are_delegated() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(
            StampingClient::new(clock.clone(), Duration::ZERO),
            600,
            clock,
        );
        limiter.generate_response("a", &GenerationOptions::default()).unwrap();
        assert_eq!(limiter.stats().request_count, 1);
        limiter.reset_stats();
        assert_eq!(limiter.stats().request_count, 0);
    }
}
