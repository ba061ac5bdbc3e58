//! Sliding-window rate limiting for provider API calls.
//!
//! Three independent 60-second windows are tracked per provider: request
//! count, payload bytes, and error count. Tripping the error ceiling puts
//! the limiter into a lockout, during which `reserve` blocks until the
//! lockout expires.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Margin added to computed waits so a woken caller lands strictly past the
/// window edge instead of racing it.
const WAKE_MARGIN: Duration = Duration::from_millis(50);

/// Per-provider ceilings over a one-minute sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCeilings {
    pub max_requests_per_minute: u32,
    pub max_bytes_per_minute: u64,
    pub max_errors_per_minute: u32,
    /// How long calls stay blocked once the error ceiling trips.
    pub lockout: Duration,
}

impl RateCeilings {
    /// Conservative defaults for providers that do not publish limits.
    pub const fn conservative() -> Self {
        Self {
            max_requests_per_minute: 30,
            max_bytes_per_minute: 10 * 1024 * 1024,
            max_errors_per_minute: 10,
            lockout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    requests: VecDeque<Instant>,
    bytes: VecDeque<(Instant, u64)>,
    byte_total: u64,
    errors: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(WINDOW);
        let Some(cutoff) = cutoff else { return };
        while self.requests.front().is_some_and(|at| *at <= cutoff) {
            self.requests.pop_front();
        }
        while self.bytes.front().is_some_and(|(at, _)| *at <= cutoff) {
            let (_, size) = self.bytes.pop_front().expect("front checked above");
            self.byte_total = self.byte_total.saturating_sub(size);
        }
        while self.errors.front().is_some_and(|at| *at <= cutoff) {
            self.errors.pop_front();
        }
        if self.locked_until.is_some_and(|until| until <= now) {
            self.locked_until = None;
        }
    }
}

/// Point-in-time view of the limiter's windows, for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub requests_in_window: u32,
    pub bytes_in_window: u64,
    pub errors_in_window: u32,
    pub lockout_remaining: Option<Duration>,
}

/// Sliding-window limiter shared by all callers of one provider.
#[derive(Debug)]
pub struct RateLimiter {
    ceilings: RateCeilings,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(ceilings: RateCeilings) -> Self {
        Self {
            ceilings,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub const fn ceilings(&self) -> &RateCeilings {
        &self.ceilings
    }

    /// Reserve capacity for one request expected to move `byte_estimate`
    /// bytes. Blocks until the request, byte, and lockout windows all admit
    /// the call, then records the request in the window.
    ///
    /// A single request larger than the whole byte ceiling is admitted when
    /// the byte window is empty, otherwise it could never proceed.
    pub async fn reserve(&self, byte_estimate: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate limiter state poisoned");
                let now = Instant::now();
                state.prune(now);

                match self.required_wait(&state, now, byte_estimate) {
                    None => {
                        state.requests.push_back(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };
            sleep(wait + WAKE_MARGIN).await;
        }
    }

    fn required_wait(
        &self,
        state: &WindowState,
        now: Instant,
        byte_estimate: u64,
    ) -> Option<Duration> {
        let mut wait: Option<Duration> = None;
        let mut bump = |candidate: Duration| {
            wait = Some(wait.map_or(candidate, |w| w.max(candidate)));
        };

        if let Some(until) = state.locked_until {
            bump(until.saturating_duration_since(now));
        }
        if state.requests.len() as u64 >= u64::from(self.ceilings.max_requests_per_minute) {
            if let Some(oldest) = state.requests.front() {
                bump(WINDOW.saturating_sub(now.saturating_duration_since(*oldest)));
            }
        }

        let over_bytes = state
            .byte_total
            .saturating_add(byte_estimate)
            > self.ceilings.max_bytes_per_minute;
        let oversized_alone = byte_estimate > self.ceilings.max_bytes_per_minute
            && state.bytes.is_empty();
        if over_bytes && !oversized_alone {
            if let Some((oldest, _)) = state.bytes.front() {
                bump(WINDOW.saturating_sub(now.saturating_duration_since(*oldest)));
            }
        }

        wait
    }

    /// Record the actual payload size of a completed request.
    pub fn record_bytes(&self, bytes: u64) {
        let mut state = self.state.lock().expect("rate limiter state poisoned");
        let now = Instant::now();
        state.prune(now);
        state.bytes.push_back((now, bytes));
        state.byte_total = state.byte_total.saturating_add(bytes);
    }

    /// Record one failed request. Tripping the error ceiling starts a
    /// lockout.
    pub fn record_error(&self) {
        let mut state = self.state.lock().expect("rate limiter state poisoned");
        let now = Instant::now();
        state.prune(now);
        state.errors.push_back(now);
        if state.errors.len() as u64 >= u64::from(self.ceilings.max_errors_per_minute)
            && state.locked_until.is_none()
        {
            state.locked_until = Some(now + self.ceilings.lockout);
            tracing::warn!(
                errors = state.errors.len(),
                lockout_secs = self.ceilings.lockout.as_secs(),
                "error ceiling tripped, provider locked out"
            );
        }
    }

    /// Remaining lockout, if one is active.
    pub fn lockout_remaining(&self) -> Option<Duration> {
        let mut state = self.state.lock().expect("rate limiter state poisoned");
        let now = Instant::now();
        state.prune(now);
        state
            .locked_until
            .map(|until| until.saturating_duration_since(now))
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let mut state = self.state.lock().expect("rate limiter state poisoned");
        let now = Instant::now();
        state.prune(now);
        LimiterSnapshot {
            requests_in_window: state.requests.len() as u32,
            bytes_in_window: state.byte_total,
            errors_in_window: state.errors.len() as u32,
            lockout_remaining: state
                .locked_until
                .map(|until| until.saturating_duration_since(now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_ceilings() -> RateCeilings {
        RateCeilings {
            max_requests_per_minute: 3,
            max_bytes_per_minute: 1_000,
            max_errors_per_minute: 2,
            lockout: Duration::from_secs(120),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn when_request_ceiling_is_hit_reserve_waits_for_the_window() {
        let limiter = RateLimiter::new(tight_ceilings());
        for _ in 0..3 {
            limiter.reserve(10).await;
        }

        let before = Instant::now();
        limiter.reserve(10).await;
        let waited = Instant::now().saturating_duration_since(before);

        assert!(waited >= Duration::from_secs(60), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn when_byte_ceiling_is_hit_reserve_waits_for_the_window() {
        let limiter = RateLimiter::new(tight_ceilings());
        limiter.reserve(0).await;
        limiter.record_bytes(950);

        let before = Instant::now();
        limiter.reserve(100).await;
        let waited = Instant::now().saturating_duration_since(before);

        assert!(waited >= Duration::from_secs(60), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_is_admitted_into_an_empty_byte_window() {
        let limiter = RateLimiter::new(tight_ceilings());

        let before = Instant::now();
        limiter.reserve(5_000).await;
        let waited = Instant::now().saturating_duration_since(before);

        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn error_ceiling_starts_a_lockout_that_reserve_respects() {
        let limiter = RateLimiter::new(tight_ceilings());
        limiter.record_error();
        limiter.record_error();

        let remaining = limiter.lockout_remaining().expect("lockout active");
        assert!(remaining > Duration::from_secs(115));

        let before = Instant::now();
        limiter.reserve(10).await;
        let waited = Instant::now().saturating_duration_since(before);
        assert!(waited >= Duration::from_secs(119), "waited {waited:?}");
        assert!(limiter.lockout_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn random_traffic_never_exceeds_the_ceilings() {
        let ceilings = RateCeilings {
            max_requests_per_minute: 5,
            max_bytes_per_minute: 2_000,
            max_errors_per_minute: 100,
            lockout: Duration::from_secs(60),
        };
        let limiter = RateLimiter::new(ceilings);
        fastrand::seed(7);

        for _ in 0..200 {
            let bytes = fastrand::u64(1..600);
            limiter.reserve(bytes).await;
            limiter.record_bytes(bytes);

            let snapshot = limiter.snapshot();
            assert!(
                snapshot.requests_in_window <= ceilings.max_requests_per_minute,
                "requests {snapshot:?}"
            );
            assert!(
                snapshot.bytes_in_window <= ceilings.max_bytes_per_minute,
                "bytes {snapshot:?}"
            );

            tokio::time::advance(Duration::from_millis(fastrand::u64(0..5_000))).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn windows_slide_rather_than_reset() {
        let limiter = RateLimiter::new(tight_ceilings());
        limiter.reserve(0).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        limiter.reserve(0).await;
        limiter.reserve(0).await;
        assert_eq!(limiter.snapshot().requests_in_window, 3);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.snapshot().requests_in_window, 2);
    }
}
