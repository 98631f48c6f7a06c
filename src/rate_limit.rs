//! Fixed-window rate limiting.
//!
//! The table lives in process memory and is owned by [`AppState`]; limits are
//! per process and approximate under concurrency.
//!
//! [`AppState`]: crate::storage::AppState

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// Clock
// ============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Policies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub max: u32,
    pub window: Duration,
}

impl Policy {
    pub const fn new(max: u32, window_secs: u64) -> Self {
        Self {
            max,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Reads `RATE_LIMIT_{NAME}_MAX` and `RATE_LIMIT_{NAME}_WINDOW_SECS`,
    /// keeping the given values for anything unset or unparsable.
    fn from_env(name: &str, fallback: Self) -> Self {
        let read = |suffix: &str| {
            std::env::var(format!("RATE_LIMIT_{}_{}", name, suffix))
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        Self {
            max: read("MAX")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(fallback.max),
            window: read("WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(fallback.window),
        }
    }
}

/// Named policies for each rate-limited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub default: Policy,
    pub generation: Policy,
    pub chat: Policy,
    pub publish: Policy,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            default: Policy::new(30, 60),
            generation: Policy::new(5, 300),
            chat: Policy::new(30, 60),
            publish: Policy::new(10, 60),
        }
    }
}

impl RateLimits {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            default: Policy::from_env("DEFAULT", base.default),
            generation: Policy::from_env("GENERATION", base.generation),
            chat: Policy::from_env("CHAT", base.chat),
            publish: Policy::from_env("PUBLISH", base.publish),
        }
    }
}

// ============================================================================
// Limiter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: Instant,
}

impl Decision {
    /// Time until the window resets, rounded up to whole seconds.
    pub fn retry_after_secs(&self, now: Instant) -> u64 {
        let wait = self.reset_at.saturating_duration_since(now);
        wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
    sweep_threshold: usize,
}

impl RateLimiter {
    const DEFAULT_SWEEP_THRESHOLD: usize = 10_000;

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
            sweep_threshold: Self::DEFAULT_SWEEP_THRESHOLD,
        }
    }

    pub fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold;
        self
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn check(&self, key: &str, policy: Policy) -> Decision {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        if windows.len() >= self.sweep_threshold {
            let before = windows.len();
            windows.retain(|_, w| now < w.reset_at);
            log::debug!("Rate limit sweep: {} -> {} keys", before, windows.len());
        }

        match windows.get_mut(key) {
            Some(window) if now < window.reset_at => {
                if window.count >= policy.max {
                    return Decision {
                        allowed: false,
                        remaining: 0,
                        reset_at: window.reset_at,
                    };
                }
                window.count += 1;
                Decision {
                    allowed: true,
                    remaining: policy.max - window.count,
                    reset_at: window.reset_at,
                }
            }
            _ => {
                let reset_at = now + policy.window;
                windows.insert(key.to_string(), Window { count: 1, reset_at });
                Decision {
                    allowed: true,
                    remaining: policy.max.saturating_sub(1),
                    reset_at,
                }
            }
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_allows_max_then_denies() {
        let (_clock, limiter) = limiter();
        let policy = Policy::new(3, 60);

        let remaining: Vec<u32> = (0..3).map(|_| limiter.check("k", policy).remaining).collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check("k", policy);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let (clock, limiter) = limiter();
        let policy = Policy::new(2, 60);
        let first = limiter.check("k", policy);
        limiter.check("k", policy);
        assert!(!limiter.check("k", policy).allowed);

        clock.advance(Duration::from_secs(60));
        let fresh = limiter.check("k", policy);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
        assert!(fresh.reset_at > first.reset_at);
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, limiter) = limiter();
        let policy = Policy::new(1, 60);
        assert!(limiter.check("generate:a", policy).allowed);
        assert!(limiter.check("generate:b", policy).allowed);
        assert!(!limiter.check("generate:a", policy).allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let (clock, limiter) = limiter();
        let decision = limiter.check("k", Policy::new(1, 10));
        clock.advance(Duration::from_millis(2500));
        assert_eq!(decision.retry_after_secs(limiter.now()), 8);
    }

    #[test]
    fn test_sweep_drops_expired_windows() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(clock.clone()).with_sweep_threshold(2);
        let policy = Policy::new(5, 1);
        limiter.check("a", policy);
        limiter.check("b", policy);
        clock.advance(Duration::from_secs(2));

        limiter.check("c", policy);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_default_policies() {
        let limits = RateLimits::default();
        assert_eq!(limits.generation, Policy::new(5, 300));
        assert_eq!(limits.default.max, 30);
        assert_eq!(limits.publish.window, Duration::from_secs(60));
    }
}
