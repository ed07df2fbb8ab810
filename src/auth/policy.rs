//! What to do when no verdict can be reached

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::Principal;
use crate::config::{AuthConfig, FailurePolicyKind};

/// Decision for a request whose credential could not be validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Let the request through as an unverified principal
    Admit(Principal),
    /// Refuse the request
    Reject,
}

/// Fail-closed or fail-open with a bounded grace window
///
/// The window is measured from the first unavailable verdict of the current
/// outage; any verdict from the validator ends the outage.
pub struct FailurePolicy {
    kind: FailurePolicyKind,
    grace_window: Duration,
    outage_started: Mutex<Option<Instant>>,
}

impl FailurePolicy {
    /// Create a policy
    #[must_use]
    pub fn new(kind: FailurePolicyKind, grace_window: Duration) -> Self {
        Self {
            kind,
            grace_window,
            outage_started: Mutex::new(None),
        }
    }

    /// Policy kind
    #[must_use]
    pub fn kind(&self) -> FailurePolicyKind {
        self.kind
    }

    /// Decide for a request the validator could not answer
    pub fn on_unavailable(&self, fingerprint: &str) -> PolicyDecision {
        let started = {
            let mut outage = self.outage_started.lock();
            *outage.get_or_insert_with(|| {
                warn!(policy = ?self.kind, "Validator unavailable, outage started");
                Instant::now()
            })
        };

        match self.kind {
            FailurePolicyKind::FailClosed => PolicyDecision::Reject,
            FailurePolicyKind::FailOpen if started.elapsed() <= self.grace_window => {
                PolicyDecision::Admit(Principal::unverified(fingerprint))
            }
            FailurePolicyKind::FailOpen => PolicyDecision::Reject,
        }
    }

    /// The validator reached a verdict
    pub fn on_verdict(&self) {
        if let Some(started) = self.outage_started.lock().take() {
            info!(
                outage_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Validator recovered"
            );
        }
    }

    /// Whether an outage is in progress
    #[must_use]
    pub fn in_outage(&self) -> bool {
        self.outage_started.lock().is_some()
    }
}

impl From<&AuthConfig> for FailurePolicy {
    fn from(config: &AuthConfig) -> Self {
        Self::new(config.failure_policy, config.grace_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_closed_always_rejects() {
        let policy = FailurePolicy::new(FailurePolicyKind::FailClosed, Duration::from_secs(60));
        assert_eq!(policy.on_unavailable("abc"), PolicyDecision::Reject);
        assert!(policy.in_outage());
    }

    #[test]
    fn test_fail_open_admits_unverified_within_window() {
        let policy = FailurePolicy::new(FailurePolicyKind::FailOpen, Duration::from_secs(60));
        match policy.on_unavailable("0123456789abcdef") {
            PolicyDecision::Admit(principal) => {
                assert!(principal.degraded);
                assert!(principal.scopes.is_empty());
            }
            PolicyDecision::Reject => panic!("expected admission"),
        }
    }

    #[test]
    fn test_fail_open_rejects_after_window() {
        let policy = FailurePolicy::new(FailurePolicyKind::FailOpen, Duration::from_millis(10));
        assert!(matches!(policy.on_unavailable("abc"), PolicyDecision::Admit(_)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(policy.on_unavailable("abc"), PolicyDecision::Reject);
    }

    #[test]
    fn test_verdict_ends_outage_and_restarts_window() {
        let policy = FailurePolicy::new(FailurePolicyKind::FailOpen, Duration::from_millis(10));
        policy.on_unavailable("abc");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(policy.on_unavailable("abc"), PolicyDecision::Reject);

        policy.on_verdict();
        assert!(!policy.in_outage());
        assert!(matches!(policy.on_unavailable("abc"), PolicyDecision::Admit(_)));
    }
}
