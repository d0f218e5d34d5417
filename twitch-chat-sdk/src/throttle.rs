//! Outbound send budget over a rolling window.

use std::time::{Duration, Instant};

/// Source of "now" for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Allows `cap` sends per `window`. Call [`check_delay`](Self::check_delay)
/// once before every send and sleep for the returned duration.
///
/// Sends are booked into consecutive windows. Once the latest window is
/// full the next one is scheduled right after it, so callers arriving
/// before that window opens are all held until it does.
pub struct RateLimiter<C: Clock = SystemClock> {
    clock: C,
    window: Duration,
    cap: u32,
    window_start: Option<Instant>,
    window_end: Option<Instant>,
    sent: u32,
}

impl RateLimiter<SystemClock> {
    pub fn new(window: Duration, cap: u32) -> Self {
        Self::with_clock(window, cap, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(window: Duration, cap: u32, clock: C) -> Self {
        Self {
            clock,
            window,
            cap: cap.max(1),
            window_start: None,
            window_end: None,
            sent: 0,
        }
    }

    /// Count one send and return how long it must wait.
    pub fn check_delay(&mut self) -> Duration {
        let now = self.clock.now();
        let (start, end) = match (self.window_start, self.window_end) {
            (Some(start), Some(end)) if end > now => (start, end),
            _ => {
                self.window_start = Some(now);
                self.window_end = Some(now + self.window);
                self.sent = 1;
                return Duration::ZERO;
            }
        };

        let start = if self.sent < self.cap {
            self.sent += 1;
            start
        } else {
            // Latest window is full: book this send into the one after it.
            self.window_start = Some(end);
            self.window_end = Some(end + self.window);
            self.sent = 1;
            end
        };

        let delay = start.saturating_duration_since(now);
        if !delay.is_zero() {
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Send budget exhausted, throttling");
        }
        delay
    }

    /// End of the current window, if one has started.
    pub fn window_end(&self) -> Option<Instant> {
        self.window_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<Instant>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Instant::now())))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    const WINDOW: Duration = Duration::from_secs(30);

    #[test]
    fn first_send_opens_window_without_delay() {
        let clock = ManualClock::new();
        let mut limiter = RateLimiter::with_clock(WINDOW, 3, clock.clone());
        assert_eq!(limiter.check_delay(), Duration::ZERO);
        assert_eq!(limiter.window_end(), Some(clock.now() + WINDOW));
    }

    #[test]
    fn sends_over_cap_are_delayed_until_window_end() {
        let clock = ManualClock::new();
        let mut limiter = RateLimiter::with_clock(WINDOW, 3, clock.clone());
        for _ in 0..3 {
            assert_eq!(limiter.check_delay(), Duration::ZERO);
            clock.advance(Duration::from_secs(1));
        }
        let delay = limiter.check_delay();
        assert!(delay > Duration::ZERO);
        assert!(delay <= WINDOW);
        assert_eq!(delay, Duration::from_secs(27));
    }

    #[test]
    fn expired_window_resets_budget() {
        let clock = ManualClock::new();
        let mut limiter = RateLimiter::with_clock(WINDOW, 2, clock.clone());
        limiter.check_delay();
        limiter.check_delay();
        assert!(limiter.check_delay() > Duration::ZERO);

        clock.advance(WINDOW * 2 + Duration::from_millis(1));
        assert_eq!(limiter.check_delay(), Duration::ZERO);
        assert_eq!(limiter.check_delay(), Duration::ZERO);
    }

    #[test]
    fn unthrottled_window_expiry_returns_zero() {
        let clock = ManualClock::new();
        let mut limiter = RateLimiter::with_clock(WINDOW, 5, clock.clone());
        limiter.check_delay();
        clock.advance(WINDOW + Duration::from_millis(1));
        assert_eq!(limiter.check_delay(), Duration::ZERO);
    }

    #[test]
    fn burst_at_one_instant_never_exceeds_cap() {
        let clock = ManualClock::new();
        let mut limiter = RateLimiter::with_clock(WINDOW, 3, clock.clone());
        let delays: Vec<Duration> = (0..7).map(|_| limiter.check_delay()).collect();

        let immediate = delays.iter().filter(|d| d.is_zero()).count();
        assert_eq!(immediate, 3, "delays: {delays:?}");
        assert_eq!(&delays[3..6], &[WINDOW; 3]);
        assert_eq!(delays[6], WINDOW * 2);
    }

    #[test]
    fn held_sends_count_against_the_scheduled_window() {
        let clock = ManualClock::new();
        let mut limiter = RateLimiter::with_clock(WINDOW, 2, clock.clone());
        limiter.check_delay();
        limiter.check_delay();
        assert_eq!(limiter.check_delay(), WINDOW);

        // Inside the scheduled window one slot is left, then it is full again.
        clock.advance(WINDOW + Duration::from_secs(1));
        assert_eq!(limiter.check_delay(), Duration::ZERO);
        assert_eq!(limiter.check_delay(), WINDOW - Duration::from_secs(1));
    }

    #[test]
    fn window_end_never_moves_backwards() {
        let clock = ManualClock::new();
        let mut limiter = RateLimiter::with_clock(WINDOW, 1, clock.clone());
        let mut last = None;
        for step in 0..50u64 {
            limiter.check_delay();
            let end = limiter.window_end();
            assert!(end >= last, "window end went backwards at step {step}");
            last = end;
            clock.advance(Duration::from_millis(700 * (step % 4)));
        }
    }
}
