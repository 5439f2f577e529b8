//! Sliding-window rate limiter (spec.md §4.4).
//!
//! Uses a `DashMap`-backed counter per key, tracking live per-key
//! timestamps instead of a fixed-window counter, since true sliding
//! windows are wanted, not fixed buckets.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A single window's limit. `max == 0` forbids all traffic in that window;
/// a missing window (not present in `WindowLimits`) means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub duration: Duration,
    pub max: u32,
}

/// The set of sliding windows enforced for a key, e.g. 60 requests/minute
/// and 1000/hour simultaneously. Declaration order doesn't matter; all
/// configured windows must pass.
#[derive(Debug, Clone, Default)]
pub struct WindowLimits {
    pub windows: Vec<Window>,
}

impl WindowLimits {
    pub fn new() -> Self {
        WindowLimits { windows: Vec::new() }
    }

    pub fn with(mut self, duration: Duration, max: u32) -> Self {
        self.windows.push(Window { duration, max });
        self
    }

    fn max_duration(&self) -> Duration {
        self.windows
            .iter()
            .map(|w| w.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// A per-role override: `role_token` is matched case-insensitively as a
/// substring against the principal's role (so `"admin"` matches a role of
/// `"org-admin"`), per spec.md §4.4 edge cases. `exempt` bypasses all limits
/// outright; otherwise `limits` replaces the default for matching callers.
#[derive(Debug, Clone)]
pub struct RoleOverride {
    pub role_token: String,
    pub exempt: bool,
    pub limits: Option<WindowLimits>,
}

/// The structured result of a rate-limit check (spec.md §4.4), used both to
/// short-circuit the pipeline and to populate the HTTP `X-RateLimit-*` /
/// `Retry-After` headers on a 429 response.
#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub exceeded: bool,
    pub reason: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Seconds until the tightest exceeded (or, if not exceeded, tightest
    /// configured) window resets.
    pub reset_after: Option<Duration>,
}

impl RateLimitOutcome {
    pub(crate) fn allowed() -> Self {
        RateLimitOutcome {
            exceeded: false,
            reason: None,
            limit: None,
            remaining: None,
            reset_after: None,
        }
    }
}

pub struct RateLimiter {
    default_limits: WindowLimits,
    overrides: Vec<RoleOverride>,
    state: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(default_limits: WindowLimits) -> Self {
        RateLimiter {
            default_limits,
            overrides: Vec::new(),
            state: DashMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: Vec<RoleOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Merges `over.limits`'s windows into a copy of `default_limits`, keyed
    /// by duration: an override only replaces the windows it specifies,
    /// leaving any other configured window (e.g. an hourly cap alongside a
    /// tightened per-minute one) from the default in effect (spec.md §4.4 —
    /// "role overrides override per-class limits only for the windows they
    /// specify").
    fn limits_for(&self, role: Option<&str>) -> Option<WindowLimits> {
        if let Some(role) = role {
            let role_lower = role.to_ascii_lowercase();
            for over in &self.overrides {
                if role_lower.contains(&over.role_token.to_ascii_lowercase()) {
                    if over.exempt {
                        return None;
                    }
                    return Some(match &over.limits {
                        Some(over_limits) => merge_windows(&self.default_limits, over_limits),
                        None => self.default_limits.clone(),
                    });
                }
            }
        }
        Some(self.default_limits.clone())
    }

    /// Checks whether `key` (scoped, e.g. `"user:123"`) may proceed under
    /// `role`'s limits, without recording the attempt. Call `record` after
    /// a successful check to count it.
    pub fn check(&self, key: &str, role: Option<&str>) -> bool {
        let Some(limits) = self.limits_for(role) else {
            return true; // exempt
        };
        if limits.windows.iter().any(|w| w.max == 0) {
            return false;
        }
        if limits.windows.is_empty() {
            return true;
        }

        let now = Instant::now();
        let max_window = limits.max_duration();
        let Some(mut entry) = self.state.get_mut(key) else {
            return true;
        };
        evict(&mut entry, now, max_window);

        limits.windows.iter().all(|w| {
            let count = entry.iter().filter(|t| now.duration_since(**t) < w.duration).count();
            (count as u32) < w.max
        })
    }

    /// Records one attempt against `key` at the current instant. Evicts
    /// stale entries older than the widest configured window first, so
    /// memory for a key is bounded by `O(windows.max_duration / traffic
    /// rate)`, not unboundedly.
    pub fn record(&self, key: &str, role: Option<&str>) {
        let Some(limits) = self.limits_for(role) else {
            return;
        };
        let max_window = limits.max_duration();
        let now = Instant::now();
        let mut entry = self.state.entry(key.to_string()).or_default();
        evict(&mut entry, now, max_window);
        entry.push(now);
    }

    /// Atomically checks and, if allowed, records. This is the method the
    /// pipeline calls (spec.md §4.5 step 2).
    pub fn check_and_record(&self, key: &str, role: Option<&str>) -> bool {
        let Some(limits) = self.limits_for(role) else {
            return true;
        };
        if limits.windows.iter().any(|w| w.max == 0) {
            return false;
        }
        if limits.windows.is_empty() {
            return true;
        }

        let now = Instant::now();
        let max_window = limits.max_duration();
        let mut entry = self.state.entry(key.to_string()).or_default();
        evict(&mut entry, now, max_window);

        let allowed = limits.windows.iter().all(|w| {
            let count = entry.iter().filter(|t| now.duration_since(**t) < w.duration).count();
            (count as u32) < w.max
        });
        if allowed {
            entry.push(now);
        }
        allowed
    }

    /// Like `check_and_record`, but returns the full structured outcome
    /// spec.md §4.4 describes (`{exceeded, reason, limit, remaining,
    /// reset_at}`), scoped by `key` for the `PipelineResult` rate-limit
    /// reason string. The tightest (soonest-to-reset) window that was
    /// evaluated is reported.
    pub fn check_and_record_detailed(&self, key: &str, role: Option<&str>, scope: &str) -> RateLimitOutcome {
        let Some(limits) = self.limits_for(role) else {
            return RateLimitOutcome::allowed();
        };
        if limits.windows.is_empty() {
            return RateLimitOutcome::allowed();
        }
        if let Some(forbidden) = limits.windows.iter().find(|w| w.max == 0) {
            return RateLimitOutcome {
                exceeded: true,
                reason: Some(format!("Rate limit exceeded: {scope}")),
                limit: Some(0),
                remaining: Some(0),
                reset_after: Some(forbidden.duration),
            };
        }

        let now = Instant::now();
        let max_window = limits.max_duration();
        let mut entry = self.state.entry(key.to_string()).or_default();
        evict(&mut entry, now, max_window);

        let mut tightest_exceeded: Option<(&Window, u32, Duration)> = None;
        for w in &limits.windows {
            let count = entry.iter().filter(|t| now.duration_since(**t) < w.duration).count() as u32;
            if count >= w.max {
                let reset_after = entry
                    .iter()
                    .filter(|t| now.duration_since(**t) < w.duration)
                    .map(|t| w.duration.saturating_sub(now.duration_since(*t)))
                    .min()
                    .unwrap_or(w.duration);
                let tighter = match tightest_exceeded {
                    Some((_, _, best)) => reset_after < best,
                    None => true,
                };
                if tighter {
                    tightest_exceeded = Some((w, count, reset_after));
                }
            }
        }

        if let Some((w, count, reset_after)) = tightest_exceeded {
            return RateLimitOutcome {
                exceeded: true,
                reason: Some(format!("Rate limit exceeded: {scope}")),
                limit: Some(w.max),
                remaining: Some(w.max.saturating_sub(count)),
                reset_after: Some(reset_after),
            };
        }

        entry.push(now);
        let (limit, remaining) = limits
            .windows
            .iter()
            .map(|w| {
                let count = entry.iter().filter(|t| now.duration_since(**t) < w.duration).count() as u32;
                (w.max, w.max.saturating_sub(count))
            })
            .min_by_key(|(_, remaining)| *remaining)
            .unwrap();
        RateLimitOutcome {
            exceeded: false,
            reason: None,
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: None,
        }
    }
}

/// Starts from `base`'s windows, then overwrites (or adds) the windows
/// `over` specifies, matched by `duration`.
fn merge_windows(base: &WindowLimits, over: &WindowLimits) -> WindowLimits {
    let mut merged = base.windows.clone();
    for w in &over.windows {
        match merged.iter_mut().find(|m| m.duration == w.duration) {
            Some(slot) => *slot = *w,
            None => merged.push(*w),
        }
    }
    WindowLimits { windows: merged }
}

fn evict(entries: &mut Vec<Instant>, now: Instant, max_window: Duration) {
    if max_window.is_zero() {
        entries.clear();
        return;
    }
    entries.retain(|t| now.duration_since(*t) <= max_window);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_blocks() {
        let limiter = RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 2));
        assert!(limiter.check_and_record("k", None));
        assert!(limiter.check_and_record("k", None));
        assert!(!limiter.check_and_record("k", None));
    }

    #[test]
    fn zero_max_forbids_all_traffic() {
        let limiter = RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 0));
        assert!(!limiter.check_and_record("k", None));
    }

    #[test]
    fn empty_windows_means_unlimited() {
        let limiter = RateLimiter::new(WindowLimits::new());
        for _ in 0..100 {
            assert!(limiter.check_and_record("k", None));
        }
    }

    #[test]
    fn exempt_role_bypasses_all_limits() {
        let limiter = RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 1)).with_overrides(vec![
            RoleOverride {
                role_token: "admin".to_string(),
                exempt: true,
                limits: None,
            },
        ]);
        for _ in 0..10 {
            assert!(limiter.check_and_record("k", Some("org-admin")));
        }
    }

    #[test]
    fn role_token_matches_as_case_insensitive_substring() {
        let limiter = RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 1)).with_overrides(vec![
            RoleOverride {
                role_token: "ADMIN".to_string(),
                exempt: true,
                limits: None,
            },
        ]);
        assert!(limiter.check_and_record("k", Some("team-admin-user")));
    }

    #[test]
    fn separate_keys_have_independent_budgets() {
        let limiter = RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 1));
        assert!(limiter.check_and_record("a", None));
        assert!(limiter.check_and_record("b", None));
        assert!(!limiter.check_and_record("a", None));
    }

    #[test]
    fn detailed_outcome_reports_limit_and_remaining() {
        let limiter = RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 2));
        let first = limiter.check_and_record_detailed("k", None, "user:1");
        assert!(!first.exceeded);
        assert_eq!(first.limit, Some(2));
        assert_eq!(first.remaining, Some(1));

        limiter.check_and_record_detailed("k", None, "user:1");
        let third = limiter.check_and_record_detailed("k", None, "user:1");
        assert!(third.exceeded);
        assert!(third.reason.unwrap().contains("user:1"));
        assert!(third.reset_after.is_some());
    }

    #[test]
    fn zero_window_reports_exceeded_with_zero_limit() {
        let limiter = RateLimiter::new(WindowLimits::new().with(Duration::from_secs(60), 0));
        let outcome = limiter.check_and_record_detailed("k", None, "user:1");
        assert!(outcome.exceeded);
        assert_eq!(outcome.limit, Some(0));
    }

    #[test]
    fn role_override_only_replaces_the_windows_it_specifies() {
        let limiter = RateLimiter::new(
            WindowLimits::new()
                .with(Duration::from_secs(60), 100)
                .with(Duration::from_secs(3600), 5),
        )
        .with_overrides(vec![RoleOverride {
            role_token: "tight".to_string(),
            exempt: false,
            limits: Some(WindowLimits::new().with(Duration::from_secs(60), 1)),
        }]);

        // The overridden 60s window is tightened to 1...
        assert!(limiter.check_and_record("k", Some("tight-user")));
        assert!(!limiter.check_and_record("k", Some("tight-user")));

        // ...but the default's 3600s window of 5 is still enforced, not dropped.
        let limiter2 = RateLimiter::new(
            WindowLimits::new()
                .with(Duration::from_secs(60), 100)
                .with(Duration::from_secs(3600), 2),
        )
        .with_overrides(vec![RoleOverride {
            role_token: "tight".to_string(),
            exempt: false,
            limits: Some(WindowLimits::new().with(Duration::from_secs(60), 100)),
        }]);
        assert!(limiter2.check_and_record("k2", Some("tight-user")));
        assert!(limiter2.check_and_record("k2", Some("tight-user")));
        assert!(!limiter2.check_and_record("k2", Some("tight-user")));
    }

    #[test]
    fn multiple_windows_all_must_pass() {
        let limiter = RateLimiter::new(
            WindowLimits::new()
                .with(Duration::from_secs(1), 100)
                .with(Duration::from_secs(60), 2),
        );
        assert!(limiter.check_and_record("k", None));
        assert!(limiter.check_and_record("k", None));
        assert!(!limiter.check_and_record("k", None));
    }
}
