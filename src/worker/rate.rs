use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

/// A token-bucket rate limiter that glides between rates instead of
/// jumping.
///
/// The current rate steps toward the target by `acceleration` units per
/// elapsed second, re-evaluated every `refresh` interval, and never
/// overshoots. Permits are issued evenly spaced at the current rate. An
/// acceleration of zero disables smoothing: the current rate follows the
/// target directly.
pub struct RateGovernor {
    acceleration: f64,
    refresh: Duration,
    state: parking_lot::Mutex<GovernorState>,
}

struct GovernorState {
    current: f64,
    target: f64,
    last_adjust: Instant,
    next_permit: Instant,
}

impl RateGovernor {
    /// A negative `starting` means "begin at the target" (no ramp-up).
    pub fn new(starting: f64, target: f64, acceleration: f64, refresh: Duration) -> Self {
        let starting = if starting < 0.0 { target } else { starting };
        let now = Instant::now();

        Self {
            acceleration,
            refresh,
            state: parking_lot::Mutex::new(GovernorState {
                current: starting,
                target,
                last_adjust: now,
                next_permit: now,
            }),
        }
    }

    /// Retargets the governor; the current rate starts gliding toward the
    /// new target on the next refresh.
    pub fn set_target(&self, target: f64) {
        self.state.lock().target = target;
    }

    /// The rate at which permits are currently issued, in permits/second.
    pub fn current_rate(&self) -> f64 {
        let mut state = self.state.lock();
        self.adjust(&mut state);
        state.current
    }

    /// Blocks until the next evenly spaced permit is available.
    ///
    /// At a zero rate no pacing is applied; callers gate emission on the
    /// expected-line count instead, so a zero-rate acquire must not hang.
    pub async fn acquire(&self) {
        let wake = {
            let mut state = self.state.lock();
            self.adjust(&mut state);

            if state.current <= 0.0 {
                return;
            }

            let spacing = Duration::from_secs_f64(1.0 / state.current);
            let now = Instant::now();
            let at = state.next_permit.max(now);
            state.next_permit = at + spacing;
            at
        };

        tokio::time::sleep_until(wake).await;
    }

    /// Steps the current rate toward the target if a refresh is due.
    fn adjust(&self, state: &mut GovernorState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_adjust);
        if elapsed < self.refresh {
            return;
        }
        state.last_adjust = now;

        if state.current == state.target {
            return;
        }

        if self.acceleration <= 0.0 {
            state.current = state.target;
            return;
        }

        let step = elapsed.as_secs_f64().max(1.0) * self.acceleration;
        let old = state.current;
        let new = if old < state.target {
            (old + step).min(state.target)
        } else {
            (old - step).max(state.target)
        };

        if new < 0.0 {
            error!(rate = new, "bad rate computation, keeping previous rate");
            return;
        }

        state.current = new;
        debug!(old, new, target = state.target, "adjusted rate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_negative_starting_begins_at_target() {
        let governor = RateGovernor::new(-1.0, 100.0, 10.0, Duration::from_secs(1));
        assert_eq!(governor.current_rate(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_climbs_monotonically_without_overshoot() {
        let governor = RateGovernor::new(10.0, 100.0, 25.0, Duration::from_secs(1));

        let mut last = governor.current_rate();
        assert_eq!(last, 10.0);

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            let rate = governor.current_rate();
            assert!(rate >= last, "rate moved backwards: {last} -> {rate}");
            assert!(rate <= 100.0, "overshoot: {rate}");
            last = rate;
        }
        assert_eq!(last, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_descends_to_lower_target() {
        let governor = RateGovernor::new(100.0, 40.0, 30.0, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        let rate = governor.current_rate();
        assert_eq!(rate, 70.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(governor.current_rate(), 40.0);

        // Stays at the target once reached.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(governor.current_rate(), 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_adjustment_between_refreshes() {
        let governor = RateGovernor::new(10.0, 100.0, 25.0, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(governor.current_rate(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_acceleration_jumps_to_target() {
        let governor = RateGovernor::new(10.0, 100.0, 0.0, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(governor.current_rate(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retarget_restarts_glide() {
        let governor = RateGovernor::new(0.0, 0.0, 50.0, Duration::from_secs(1));
        assert_eq!(governor.current_rate(), 0.0);

        governor.set_target(100.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(governor.current_rate(), 50.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(governor.current_rate(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spacing_is_even() {
        let governor = RateGovernor::new(10.0, 10.0, 0.0, Duration::from_secs(1));

        let start = Instant::now();
        for _ in 0..5 {
            governor.acquire().await;
        }
        // 5 permits at 10/sec: first immediate, then 4 spaced 100 ms apart.
        let elapsed = Instant::now().duration_since(start);
        assert!(
            elapsed >= Duration::from_millis(400) && elapsed < Duration::from_millis(450),
            "elapsed {elapsed:?}",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_at_zero_rate_returns_immediately() {
        let governor = RateGovernor::new(0.0, 0.0, 0.0, Duration::from_secs(1));
        let start = Instant::now();
        governor.acquire().await;
        assert_eq!(Instant::now(), start);
    }
}
