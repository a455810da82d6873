use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rollcall_core::{Decision, Denial};

/// Throttling parameters, loaded from the daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    /// Deliberate failures tolerated inside one window before lockout.
    pub max_failures: u32,
    /// Sliding window over which failures are remembered.
    pub window: Duration,
    /// Lockout duration once the window fills up.
    pub lockout: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct IdentityWindow {
    /// Timestamps of deliberate failures still inside the window.
    failures: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

/// Per-identity throttle over attendance attempts.
///
/// The limiter classifies pipeline decisions itself: a mismatched face or a
/// failed blink check is someone (or something) probing the matcher and
/// counts toward lockout; `AlreadyMarked`, `NotEnrolled` and `NoFaceDetected`
/// are neutral, and infrastructure errors never reach [`RateLimiter::observe`]
/// at all. A successful attempt clears the identity's failure history.
pub struct RateLimiter {
    limits: RateLimits,
    entries: HashMap<String, IdentityWindow>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
        }
    }

    /// Whether the identity may attempt verification now.
    /// `Err` carries the remaining lockout time.
    pub fn check(&mut self, reference: &str) -> Result<(), Duration> {
        let Some(entry) = self.entries.get_mut(reference) else {
            return Ok(());
        };

        if let Some(locked_until) = entry.locked_until {
            let now = Instant::now();
            if now < locked_until {
                return Err(locked_until.duration_since(now));
            }
            // Lockout served; start from a clean slate.
            self.entries.remove(reference);
        }

        Ok(())
    }

    /// Feed the outcome of one attempt into the throttle.
    pub fn observe(&mut self, reference: &str, decision: &Decision) {
        match decision {
            Decision::Recorded { .. } => {
                self.entries.remove(reference);
            }
            Decision::Denied(denial) if Self::counts_as_failure(denial) => {
                self.record_failure(reference);
            }
            Decision::Denied(_) => {}
        }
    }

    fn counts_as_failure(denial: &Denial) -> bool {
        matches!(
            denial,
            Denial::FaceMismatch { .. } | Denial::LivenessFailed { .. }
        )
    }

    fn record_failure(&mut self, reference: &str) {
        let now = Instant::now();
        let window = self.limits.window;
        let entry = self.entries.entry(reference.to_string()).or_default();

        while let Some(oldest) = entry.failures.front() {
            if now.duration_since(*oldest) >= window {
                entry.failures.pop_front();
            } else {
                break;
            }
        }
        entry.failures.push_back(now);

        if entry.failures.len() as u32 >= self.limits.max_failures {
            entry.locked_until = Some(now + self.limits.lockout);
            tracing::warn!(
                reference,
                failures = entry.failures.len(),
                lockout_secs = self.limits.lockout.as_secs(),
                "rate limit triggered — locking identity"
            );
        } else {
            tracing::debug!(
                reference,
                failures = entry.failures.len(),
                max = self.limits.max_failures,
                "deliberate failure recorded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::AttendanceRecord;

    fn limits(max_failures: u32) -> RateLimits {
        RateLimits {
            max_failures,
            ..RateLimits::default()
        }
    }

    fn mismatch() -> Decision {
        Decision::Denied(Denial::FaceMismatch {
            confidence_percent: 12.0,
            distance: 0.88,
        })
    }

    fn no_blinks() -> Decision {
        Decision::Denied(Denial::LivenessFailed {
            blinks_observed: 0,
            blinks_required: 2,
        })
    }

    fn recorded() -> Decision {
        Decision::Recorded {
            record: AttendanceRecord {
                identity: "S-1001".to_string(),
                date: "2026-08-25".parse().unwrap(),
                time: "09:00:00".parse().unwrap(),
                confidence: 95.0,
            },
            blinks_detected: 2,
        }
    }

    #[test]
    fn repeated_mismatches_lock_the_identity() {
        let mut rl = RateLimiter::new(limits(3));
        for _ in 0..2 {
            rl.observe("S-1001", &mismatch());
            assert!(rl.check("S-1001").is_ok());
        }
        rl.observe("S-1001", &mismatch());

        let remaining = rl.check("S-1001").unwrap_err();
        assert!(remaining <= RateLimits::default().lockout);
    }

    #[test]
    fn failed_blink_checks_count_like_mismatches() {
        let mut rl = RateLimiter::new(limits(2));
        rl.observe("S-1001", &no_blinks());
        rl.observe("S-1001", &mismatch());
        assert!(rl.check("S-1001").is_err());
    }

    #[test]
    fn neutral_denials_never_lock() {
        let mut rl = RateLimiter::new(limits(2));
        for _ in 0..10 {
            rl.observe("S-1001", &Decision::Denied(Denial::AlreadyMarked));
            rl.observe("S-1001", &Decision::Denied(Denial::NoFaceDetected));
            rl.observe("S-1001", &Decision::Denied(Denial::NotEnrolled));
        }
        assert!(rl.check("S-1001").is_ok());
    }

    #[test]
    fn success_clears_failure_history() {
        let mut rl = RateLimiter::new(limits(3));
        rl.observe("S-1001", &mismatch());
        rl.observe("S-1001", &mismatch());
        rl.observe("S-1001", &recorded());
        // History gone: two more failures stay under the limit of three.
        rl.observe("S-1001", &mismatch());
        rl.observe("S-1001", &mismatch());
        assert!(rl.check("S-1001").is_ok());
    }

    #[test]
    fn identities_are_throttled_independently() {
        let mut rl = RateLimiter::new(limits(1));
        rl.observe("S-1001", &mismatch());
        assert!(rl.check("S-1001").is_err());
        assert!(rl.check("S-1002").is_ok());
    }

    #[test]
    fn expired_window_forgets_failures() {
        // A zero-length window prunes every earlier failure, so the count
        // can never accumulate to the limit of two.
        let mut rl = RateLimiter::new(RateLimits {
            max_failures: 2,
            window: Duration::ZERO,
            lockout: Duration::from_secs(300),
        });
        for _ in 0..5 {
            rl.observe("S-1001", &mismatch());
        }
        assert!(rl.check("S-1001").is_ok());
    }

    #[test]
    fn served_lockout_resets_the_identity() {
        // A zero-length lockout is already over by the next check.
        let mut rl = RateLimiter::new(RateLimits {
            max_failures: 1,
            window: Duration::from_secs(60),
            lockout: Duration::ZERO,
        });
        rl.observe("S-1001", &mismatch());
        assert!(rl.check("S-1001").is_ok());
        // And the slate is clean, not still one-failure-deep.
        rl.observe("S-1001", &recorded());
        assert!(rl.check("S-1001").is_ok());
    }
}
