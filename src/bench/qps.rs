//! Rate limiting via a leaky token bucket.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Modulates the rate of some repeated operation: callers invoke
/// [`QpsController::wait`] before each operation and are stalled enough
/// to hold the configured rate.
pub trait QpsController: Send + Sync {
    fn wait(&self);
}

/// Time source for the bucket, swappable so tests can drive it by hand.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock's epoch.
    fn now(&self) -> Duration;
}

/// The real, monotonic clock.
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

struct BucketState {
    tokens: i64,
    last_refill: Duration,
}

/// A leaky token bucket capping throughput at `max_qps`.
///
/// The bucket starts full. Each elapsed whole second since the last
/// refill deposits `max_qps` tokens, capped at `max_qps`; `wait` takes
/// one token or spins until a deposit arrives.
pub struct LeakyTokenBucket<C: Clock = SystemClock> {
    max_qps: i64,
    clock: C,
    state: Mutex<BucketState>,
}

impl LeakyTokenBucket<SystemClock> {
    pub fn new(max_qps: i64) -> Self {
        Self::with_clock(max_qps, SystemClock::default())
    }
}

impl<C: Clock> LeakyTokenBucket<C> {
    pub fn with_clock(max_qps: i64, clock: C) -> Self {
        assert!(max_qps > 0, "a bucket needs a positive rate");
        let last_refill = clock.now();
        Self {
            max_qps,
            clock,
            state: Mutex::new(BucketState {
                tokens: max_qps,
                last_refill,
            }),
        }
    }

    fn try_refresh_tokens(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed_secs = now.saturating_sub(state.last_refill).as_secs() as i64;
        let deposit = elapsed_secs * self.max_qps;
        if deposit > 0 {
            state.tokens = (state.tokens + deposit).min(self.max_qps);
            state.last_refill = now;
        }
    }
}

impl<C: Clock> QpsController for LeakyTokenBucket<C> {
    fn wait(&self) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                self.try_refresh_tokens(&mut state);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Manually advanced clock.
    #[derive(Default)]
    struct FakeClock {
        nanos: Arc<AtomicU64>,
    }

    impl FakeClock {
        fn handle(&self) -> Arc<AtomicU64> {
            Arc::clone(&self.nanos)
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Duration {
            Duration::from_nanos(self.nanos.load(Ordering::Acquire))
        }
    }

    fn advance(handle: &AtomicU64, d: Duration) {
        handle.fetch_add(d.as_nanos() as u64, Ordering::Release);
    }

    #[test]
    fn bucket_starts_full() {
        let bucket = LeakyTokenBucket::with_clock(100, FakeClock::default());
        for _ in 0..100 {
            bucket.wait();
        }
        assert_eq!(bucket.state.lock().unwrap().tokens, 0);
    }

    #[test]
    fn refill_is_per_whole_second_and_capped() {
        let clock = FakeClock::default();
        let handle = clock.handle();
        let bucket = LeakyTokenBucket::with_clock(100, clock);

        for _ in 0..100 {
            bucket.wait();
        }

        // 999 ms deposits nothing.
        advance(&handle, Duration::from_millis(999));
        {
            let mut state = bucket.state.lock().unwrap();
            bucket.try_refresh_tokens(&mut state);
            assert_eq!(state.tokens, 0);
        }

        // Crossing the second deposits max_qps, never more.
        advance(&handle, Duration::from_millis(3001));
        {
            let mut state = bucket.state.lock().unwrap();
            bucket.try_refresh_tokens(&mut state);
            assert_eq!(state.tokens, 100);
        }
    }

    #[test]
    fn three_hundred_waits_take_two_simulated_seconds() {
        let clock = FakeClock::default();
        let handle = clock.handle();
        let bucket = LeakyTokenBucket::with_clock(100, clock);

        let mut simulated = Duration::ZERO;
        let mut served = 0;
        while served < 300 {
            {
                let mut state = bucket.state.lock().unwrap();
                bucket.try_refresh_tokens(&mut state);
                if state.tokens == 0 {
                    drop(state);
                    advance(&handle, Duration::from_secs(1));
                    simulated += Duration::from_secs(1);
                    continue;
                }
            }
            bucket.wait();
            served += 1;
        }
        assert_eq!(simulated, Duration::from_secs(2));
    }

    #[test]
    fn blocked_waiter_resumes_after_a_deposit() {
        let clock = FakeClock::default();
        let handle = clock.handle();
        let bucket = Arc::new(LeakyTokenBucket::with_clock(1, clock));
        bucket.wait(); // Drain the single token.

        let waiter = {
            let bucket = Arc::clone(&bucket);
            std::thread::spawn(move || bucket.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        advance(&handle, Duration::from_secs(1));
        waiter.join().unwrap();
    }
}
