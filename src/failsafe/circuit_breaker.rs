//! Circuit breaker implementation

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::stats::{CallStats, CallStatsSnapshot};
use crate::config::{CircuitBreakerConfig, RecoveryBackoff, humantime_serde};
use crate::telemetry;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (admitting one probe at a time)
    HalfOpen,
}

impl CircuitState {
    /// Label for logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    max_recovery_attempts: u32,
    backoff: RecoveryBackoff,
    max_recovery_timeout: Duration,
}

impl From<&CircuitBreakerConfig> for Settings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            max_recovery_attempts: config.max_recovery_attempts.max(1),
            backoff: config.recovery_backoff,
            max_recovery_timeout: config.max_recovery_timeout.max(config.recovery_timeout),
        }
    }
}

impl Settings {
    /// Recovery timeout after `attempts` failed probes
    fn recovery_timeout_after(&self, attempts: u32) -> Duration {
        let factor = match self.backoff {
            RecoveryBackoff::Fixed => Some(1),
            RecoveryBackoff::Linear => attempts.checked_add(1),
            RecoveryBackoff::Exponential => 2u32.checked_pow(attempts),
        };
        factor
            .and_then(|f| self.recovery_timeout.checked_mul(f))
            .unwrap_or(self.max_recovery_timeout)
            .min(self.max_recovery_timeout)
    }
}

#[derive(Debug)]
struct Core {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    recovery_attempts: u32,
    current_recovery_timeout: Duration,
    locked_open: bool,
}

impl Core {
    fn closed(recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            opened_at_wall: None,
            recovery_attempts: 0,
            current_recovery_timeout: recovery_timeout,
            locked_open: false,
        }
    }

    fn retry_in(&self) -> Option<Duration> {
        if self.state != CircuitState::Open || self.locked_open {
            return None;
        }
        let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        Some(self.current_recovery_timeout.saturating_sub(elapsed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Bypass,
    Normal,
    Probe,
}

/// Admission to call the guarded dependency
///
/// Report the outcome with [`CallPermit::success`] or [`CallPermit::failure`].
/// A probe permit dropped without an outcome frees the probe slot.
#[must_use = "a permit must record the call outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.kind == PermitKind::Probe
    }

    /// The dependency answered
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.kind, self.started.elapsed());
    }

    /// The dependency failed or timed out
    pub fn failure(mut self, reason: &str) {
        self.settled = true;
        self.breaker.on_failure(self.kind, self.started.elapsed(), reason);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Probe {
            debug!(dependency = %self.breaker.name, "Probe abandoned, releasing probe slot");
            self.breaker.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Circuit breaker for one guarded dependency
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    settings: RwLock<Settings>,
    core: Mutex<Core>,
    /// Half-open admits exactly one probe
    probe_in_flight: AtomicBool,
    stats: CallStats,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        let settings = Settings::from(config);
        Self {
            name: name.to_string(),
            core: Mutex::new(Core::closed(settings.recovery_timeout)),
            settings: RwLock::new(settings),
            probe_in_flight: AtomicBool::new(false),
            stats: CallStats::default(),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Run `f` through the breaker
    ///
    /// Rejected calls return [`Error::CircuitOpen`] without invoking `f`.
    /// Errors for which [`Error::is_dependency_failure`] holds count as
    /// failures; every other outcome means the dependency answered.
    /// No retries happen here.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let result = f().await;
        match &result {
            Err(e) if e.is_dependency_failure() => permit.failure(&e.to_string()),
            _ => permit.success(),
        }
        result
    }

    /// Ask for admission
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        let settings = *self.settings.read();
        let permit = |kind| CallPermit {
            breaker: self,
            kind,
            started: Instant::now(),
            settled: false,
        };

        if !settings.enabled {
            return Ok(permit(PermitKind::Bypass));
        }

        let mut core = self.core.lock();
        match core.state {
            CircuitState::Closed => Ok(permit(PermitKind::Normal)),
            CircuitState::HalfOpen => {
                if self.claim_probe() {
                    debug!(dependency = %self.name, "Admitting half-open probe");
                    Ok(permit(PermitKind::Probe))
                } else {
                    Err(self.reject(Some(Duration::ZERO)))
                }
            }
            CircuitState::Open => {
                if core.locked_open {
                    return Err(self.reject(None));
                }
                match core.retry_in() {
                    Some(wait) if !wait.is_zero() => Err(self.reject(Some(wait))),
                    _ => {
                        if !self.claim_probe() {
                            return Err(self.reject(Some(Duration::ZERO)));
                        }
                        core.consecutive_successes = 0;
                        self.transition(&mut core, CircuitState::HalfOpen, "recovery timeout elapsed");
                        Ok(permit(PermitKind::Probe))
                    }
                }
            }
        }
    }

    fn claim_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn reject(&self, retry_in: Option<Duration>) -> Error {
        self.stats.record_rejected();
        debug!(dependency = %self.name, ?retry_in, "Circuit open, rejecting call");
        Error::CircuitOpen {
            dependency: self.name.clone(),
            retry_in,
        }
    }

    fn on_success(&self, kind: PermitKind, latency: Duration) {
        self.stats.record_success(latency);
        if kind == PermitKind::Bypass {
            return;
        }

        let settings = *self.settings.read();
        let mut core = self.core.lock();
        match (kind, core.state) {
            (PermitKind::Normal, CircuitState::Closed) => core.consecutive_failures = 0,
            (PermitKind::Probe, CircuitState::HalfOpen) => {
                core.consecutive_successes += 1;
                debug!(
                    dependency = %self.name,
                    successes = core.consecutive_successes,
                    threshold = settings.success_threshold,
                    "Probe succeeded"
                );
                if core.consecutive_successes >= settings.success_threshold {
                    self.transition(&mut core, CircuitState::Closed, "probe succeeded");
                    *core = Core::closed(settings.recovery_timeout);
                }
            }
            // Late outcome of a call admitted before a transition
            _ => {}
        }
        if kind == PermitKind::Probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    fn on_failure(&self, kind: PermitKind, latency: Duration, reason: &str) {
        self.stats.record_failure(latency);
        if kind == PermitKind::Bypass {
            return;
        }

        let settings = *self.settings.read();
        let mut core = self.core.lock();
        match (kind, core.state) {
            (PermitKind::Normal, CircuitState::Closed) => {
                core.consecutive_failures += 1;
                debug!(
                    dependency = %self.name,
                    failures = core.consecutive_failures,
                    threshold = settings.failure_threshold,
                    error = %reason,
                    "Call failed"
                );
                if core.consecutive_failures >= settings.failure_threshold {
                    core.opened_at = Some(Instant::now());
                    core.opened_at_wall = Some(Utc::now());
                    core.current_recovery_timeout = settings.recovery_timeout;
                    self.transition(&mut core, CircuitState::Open, "failure threshold reached");
                }
            }
            (PermitKind::Probe, CircuitState::HalfOpen) => {
                core.recovery_attempts += 1;
                core.consecutive_successes = 0;
                core.current_recovery_timeout = settings.recovery_timeout_after(core.recovery_attempts);
                core.opened_at = Some(Instant::now());
                core.opened_at_wall = Some(Utc::now());
                core.locked_open = core.recovery_attempts >= settings.max_recovery_attempts;
                let event = if core.locked_open {
                    "probe failed, recovery attempts exhausted"
                } else {
                    "probe failed"
                };
                warn!(
                    dependency = %self.name,
                    attempts = core.recovery_attempts,
                    next_retry_ms = u64::try_from(core.current_recovery_timeout.as_millis()).unwrap_or(u64::MAX),
                    error = %reason,
                    "Recovery probe failed"
                );
                self.transition(&mut core, CircuitState::Open, event);
            }
            _ => {}
        }
        if kind == PermitKind::Probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    /// Force the breaker closed with all counters zeroed
    pub fn reset(&self) -> CircuitSnapshot {
        let settings = *self.settings.read();
        {
            let mut core = self.core.lock();
            if core.state != CircuitState::Closed {
                self.transition(&mut core, CircuitState::Closed, "manual reset");
            } else {
                info!(dependency = %self.name, "Circuit breaker reset while closed");
            }
            *core = Core::closed(settings.recovery_timeout);
            self.probe_in_flight.store(false, Ordering::Release);
        }
        self.snapshot()
    }

    /// Apply new thresholds, keeping the current phase and counters
    pub fn reconfigure(&self, config: &CircuitBreakerConfig) {
        let settings = Settings::from(config);
        *self.settings.write() = settings;

        let mut core = self.core.lock();
        if core.state == CircuitState::Closed {
            core.current_recovery_timeout = settings.recovery_timeout;
        } else {
            core.current_recovery_timeout = core.current_recovery_timeout.min(settings.max_recovery_timeout);
        }
        core.locked_open = core.locked_open && core.recovery_attempts >= settings.max_recovery_attempts;
        info!(
            dependency = %self.name,
            enabled = settings.enabled,
            failure_threshold = settings.failure_threshold,
            "Circuit breaker reconfigured"
        );
    }

    /// Log and count a phase change; caller holds the core lock
    fn transition(&self, core: &mut Core, to: CircuitState, event: &str) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        telemetry::record_transition(&self.name, from.as_str(), to.as_str());

        match to {
            CircuitState::Open => warn!(
                dependency = %self.name,
                from = %from,
                to = %to,
                event,
                failures = core.consecutive_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(dependency = %self.name, from = %from, to = %to, event, "Circuit breaker half-open"),
            CircuitState::Closed => info!(dependency = %self.name, from = %from, to = %to, event, "Circuit breaker closed"),
        }
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let settings = *self.settings.read();
        let core = self.core.lock();
        let retry_in = core.retry_in();
        CircuitSnapshot {
            dependency: self.name.clone(),
            enabled: settings.enabled,
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            opened_at: core.opened_at_wall,
            recovery_attempts: core.recovery_attempts,
            current_recovery_timeout: core.current_recovery_timeout,
            retry_in_ms: retry_in.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            probe_in_flight: self.probe_in_flight.load(Ordering::Acquire),
            locked_open: core.locked_open,
            status_message: status_message(&core, settings.enabled),
            stats: self.stats.snapshot(),
        }
    }

    /// Human-readable description of the current phase
    #[must_use]
    pub fn status_message(&self) -> String {
        let enabled = self.settings.read().enabled;
        status_message(&self.core.lock(), enabled)
    }
}

fn status_message(core: &Core, enabled: bool) -> String {
    if !enabled {
        return "disabled (all calls pass through)".to_string();
    }
    match core.state {
        CircuitState::Closed if core.consecutive_failures == 0 => "closed".to_string(),
        CircuitState::Closed => format!("closed ({} consecutive failures)", core.consecutive_failures),
        CircuitState::HalfOpen => "half-open (probing recovery)".to_string(),
        CircuitState::Open if core.locked_open => format!(
            "open after {} failed recovery attempts; manual reset required",
            core.recovery_attempts
        ),
        CircuitState::Open => format!(
            "open, next probe in {}s",
            core.retry_in().unwrap_or_default().as_secs()
        ),
    }
}

/// Serializable breaker state
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Guarded dependency
    pub dependency: String,
    /// Whether the breaker is active
    pub enabled: bool,
    /// Phase
    pub state: CircuitState,
    /// Failures in a row
    pub consecutive_failures: u32,
    /// Probe successes in a row
    pub consecutive_successes: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Failed probes since the breaker first opened
    pub recovery_attempts: u32,
    /// Wait before the next probe
    #[serde(with = "humantime_serde")]
    pub current_recovery_timeout: Duration,
    /// Time left until a probe is admitted
    pub retry_in_ms: Option<u64>,
    /// A probe is running
    pub probe_in_flight: bool,
    /// Open until manually reset
    pub locked_open: bool,
    /// Summary for humans
    pub status_message: String,
    /// Call statistics
    pub stats: CallStatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn config(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            recovery_backoff: RecoveryBackoff::Fixed,
            ..Default::default()
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Err::<(), _>(Error::dependency("tracking", "connection refused")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("tracking", &config(3, Duration::from_secs(30)));
        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.snapshot().opened_at.is_some());
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling() {
        let cb = CircuitBreaker::new("tracking", &config(1, Duration::from_secs(30)));
        let _ = fail(&cb).await;

        let calls = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { retry_in: Some(_), .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.snapshot().stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let cb = CircuitBreaker::new("tracking", &config(3, Duration::from_secs(30)));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_recovers_through_half_open_probe() {
        let cb = CircuitBreaker::new("tracking", &config(1, Duration::from_millis(20)));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_success_threshold_requires_multiple_probes() {
        let mut cfg = config(1, Duration::from_millis(10));
        cfg.success_threshold = 2;
        let cb = CircuitBreaker::new("tracking", &cfg);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_only_one_probe_in_flight() {
        let cb = Arc::new(CircuitBreaker::new("tracking", &config(1, Duration::from_millis(10))));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert!(cb.snapshot().probe_in_flight);

        let second = cb.try_acquire();
        assert!(matches!(second, Err(Error::CircuitOpen { .. })));

        probe.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.snapshot().probe_in_flight);
    }

    #[tokio::test]
    async fn test_dropped_probe_releases_slot() {
        let cb = CircuitBreaker::new("tracking", &config(1, Duration::from_millis(10)));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let probe = cb.try_acquire().unwrap();
        drop(probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_probe());
    }

    #[tokio::test]
    async fn test_failed_probe_extends_recovery() {
        let mut cfg = config(1, Duration::from_millis(10));
        cfg.recovery_backoff = RecoveryBackoff::Exponential;
        let cb = CircuitBreaker::new("tracking", &cfg);
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = fail(&cb).await;
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.recovery_attempts, 1);
        assert_eq!(snapshot.current_recovery_timeout, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_locked_open_until_reset() {
        let mut cfg = config(1, Duration::from_millis(5));
        cfg.max_recovery_attempts = 2;
        let cb = CircuitBreaker::new("tracking", &cfg);
        let _ = fail(&cb).await;

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            let _ = fail(&cb).await;
        }
        assert!(cb.snapshot().locked_open);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(matches!(
            succeed(&cb).await,
            Err(Error::CircuitOpen { retry_in: None, .. })
        ));
        assert!(cb.status_message().contains("manual reset required"));

        let snapshot = cb.reset();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.recovery_attempts, 0);
        assert!(!snapshot.locked_open);
        succeed(&cb).await.unwrap();
    }

    #[tokio::test]
    async fn test_verdict_errors_are_not_failures() {
        let cb = CircuitBreaker::new("authority", &config(1, Duration::from_secs(30)));
        let result = cb.call(|| async { Err::<(), _>(Error::Unauthorized) }).await;
        assert!(matches!(result, Err(Error::Unauthorized)));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let mut cfg = config(1, Duration::from_secs(30));
        cfg.enabled = false;
        let cb = CircuitBreaker::new("tracking", &cfg);
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        succeed(&cb).await.unwrap();
        assert!(cb.status_message().starts_with("disabled"));
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_state() {
        let cb = CircuitBreaker::new("tracking", &config(1, Duration::from_secs(30)));
        let _ = fail(&cb).await;
        cb.reconfigure(&config(10, Duration::from_secs(5)));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_backoff_strategies() {
        let base = CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(10),
            max_recovery_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let with = |backoff| {
            Settings::from(&CircuitBreakerConfig {
                recovery_backoff: backoff,
                ..base.clone()
            })
        };

        let fixed = with(RecoveryBackoff::Fixed);
        assert_eq!(fixed.recovery_timeout_after(3), Duration::from_secs(10));

        let linear = with(RecoveryBackoff::Linear);
        assert_eq!(linear.recovery_timeout_after(1), Duration::from_secs(20));
        assert_eq!(linear.recovery_timeout_after(9), Duration::from_secs(60));

        let exponential = with(RecoveryBackoff::Exponential);
        assert_eq!(exponential.recovery_timeout_after(2), Duration::from_secs(40));
        assert_eq!(exponential.recovery_timeout_after(3), Duration::from_secs(60));
        assert_eq!(exponential.recovery_timeout_after(40), Duration::from_secs(60));
    }
}
