//! Per-principal rate limiting

use std::num::NonZeroU32;

use dashmap::DashMap;
use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Requests-per-minute limiter keyed by principal
///
/// Each principal carries its own quota; a changed quota replaces the
/// principal's limiter.
#[derive(Default)]
pub struct PrincipalRateLimiter {
    limiters: DashMap<String, (NonZeroU32, DirectLimiter)>,
}

impl PrincipalRateLimiter {
    /// Create an empty limiter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit one request for `principal`. A zero quota is unlimited.
    pub fn try_acquire(&self, principal: &str, per_minute: u32) -> bool {
        let Some(quota) = NonZeroU32::new(per_minute) else {
            return true;
        };

        let mut entry = self
            .limiters
            .entry(principal.to_string())
            .or_insert_with(|| (quota, GovernorLimiter::direct(Quota::per_minute(quota))));
        if entry.0 != quota {
            *entry = (quota, GovernorLimiter::direct(Quota::per_minute(quota)));
        }
        entry.1.check().is_ok()
    }

    /// Principals currently tracked
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no principal is tracked
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
