//! Reconcile outcomes and the pause protocol
//!
//! A controller that arms a monitor returns [`Reconciled::Pending`] rather
//! than an error. The [`Dispatcher`] turns a reconcile result into a
//! controller [`Action`]: pauses wait for the monitor's notification,
//! failures are requeued with per-object exponential backoff.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use tracing::{info, warn};

use dm_common::{metrics, Error};

use crate::monitor::MonitorKey;

/// Signal that a monitor was armed and the reconcile should not be requeued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForMonitor {
    /// Key of the armed monitor
    pub key: MonitorKey,
    /// Why the controller is waiting
    pub reason: String,
}

impl WaitForMonitor {
    /// Create a pause signal
    pub fn new(key: MonitorKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for WaitForMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiting for monitor {}: {}", self.key, self.reason)
    }
}

/// Successful return value of a reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Reconcile finished; the controller action to take next
    Done(Action),
    /// Reconcile paused until a monitor re-queues the object
    Pending(WaitForMonitor),
}

impl From<Action> for Reconciled {
    fn from(action: Action) -> Self {
        Self::Done(action)
    }
}

impl From<WaitForMonitor> for Reconciled {
    fn from(wait: WaitForMonitor) -> Self {
        Self::Pending(wait)
    }
}

/// Return type of pause-aware reconcile functions
pub type ReconcileResult = Result<Reconciled, Error>;

/// Tagged outcome of one reconcile attempt
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Reconcile succeeded
    Success(Action),
    /// Reconcile failed and goes through the error policy
    RetryableFailure(Error),
    /// Reconcile is waiting on a monitor
    Pending(WaitForMonitor),
}

impl ReconcileOutcome {
    /// Coarse classification used for metrics and logs
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Success,
            Self::RetryableFailure(_) => OutcomeKind::Failure,
            Self::Pending(_) => OutcomeKind::Pending,
        }
    }
}

impl From<ReconcileResult> for ReconcileOutcome {
    fn from(result: ReconcileResult) -> Self {
        match result {
            Ok(Reconciled::Done(action)) => Self::Success(action),
            Ok(Reconciled::Pending(wait)) => Self::Pending(wait),
            Err(e) => Self::RetryableFailure(e),
        }
    }
}

/// Outcome classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Success
    Success,
    /// Failure
    Failure,
    /// Paused on a monitor
    Pending,
}

impl OutcomeKind {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Pending => "pending",
        }
    }

    /// Pauses are not failures
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

/// Exponential requeue backoff for failed reconciles
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound on the delay
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Converts reconcile results into controller actions for one controller
///
/// ```ignore
/// let dispatcher = Arc::new(coordinator.dispatcher("host"));
/// let on_error = dispatcher.clone();
///
/// Controller::new(hosts, watcher::Config::default())
///     .run(
///         move |host, ctx| {
///             let dispatcher = dispatcher.clone();
///             async move {
///                 let key = host.name_any();
///                 dispatcher.finish(&key, reconcile(host, ctx).await)
///             }
///         },
///         move |host, error, _| on_error.error_policy(&host.name_any(), error),
///         ctx,
///     )
/// ```
pub struct Dispatcher {
    controller: String,
    backoff: BackoffPolicy,
    attempts: DashMap<String, u32>,
}

impl Dispatcher {
    /// Create a dispatcher for `controller`
    pub fn new(controller: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            controller: controller.into(),
            backoff,
            attempts: DashMap::new(),
        }
    }

    /// Controller name used in logs and metrics
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Finish one reconcile of `object_key`
    ///
    /// Pauses map to `Ok(Action::await_change())` so the controller runtime
    /// does not requeue; failures are returned for [`Dispatcher::error_policy`].
    pub fn finish(&self, object_key: &str, result: ReconcileResult) -> Result<Action, Error> {
        let outcome = ReconcileOutcome::from(result);
        metrics::record_reconcile_outcome(&self.controller, outcome.kind().as_str());

        match outcome {
            ReconcileOutcome::Success(action) => {
                self.attempts.remove(object_key);
                Ok(action)
            }
            ReconcileOutcome::Pending(wait) => {
                self.attempts.remove(object_key);
                info!(
                    controller = %self.controller,
                    object = %object_key,
                    monitor = %wait.key,
                    reason = %wait.reason,
                    "reconcile paused on monitor"
                );
                Ok(Action::await_change())
            }
            ReconcileOutcome::RetryableFailure(e) => Err(e),
        }
    }

    /// Requeue policy for a failed reconcile of `object_key`
    ///
    /// API and platform client errors requeue with backoff whatever their
    /// status code. Invalid objects and bad configuration wait for a change.
    pub fn error_policy(&self, object_key: &str, error: &Error) -> Action {
        if !error.is_retryable() {
            self.attempts.remove(object_key);
            warn!(
                controller = %self.controller,
                object = %object_key,
                error = %error,
                "reconcile failed permanently, waiting for a change"
            );
            return Action::await_change();
        }

        let attempt = {
            let mut entry = self.attempts.entry(object_key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        let delay = self.backoff.delay(attempt);

        warn!(
            controller = %self.controller,
            object = %object_key,
            error = %error,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconcile failed, requeuing"
        );
        Action::requeue(delay)
    }

    /// Consecutive failures recorded for `object_key`
    pub fn attempts(&self, object_key: &str) -> u32 {
        self.attempts.get(object_key).map(|a| *a).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectTarget;
    use dm_common::ResourceKind;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::kube(
            "get",
            "Secret/ns1/system-endpoint",
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("status {code}"),
                reason: "Test".to_string(),
                code,
            }),
        )
    }

    fn wait() -> WaitForMonitor {
        let target = ObjectTarget::of_kind(ResourceKind::Host, "ns1", "controller-0");
        WaitForMonitor::new(MonitorKey::from_target(&target), "waiting for host to unlock")
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            "host",
            BackoffPolicy {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(10),
                multiplier: 2.0,
            },
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = dispatcher().backoff;
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn outcome_is_classified_by_type() {
        let pending = ReconcileOutcome::from(Ok(Reconciled::from(wait())));
        assert_eq!(pending.kind(), OutcomeKind::Pending);
        assert!(!pending.kind().is_failure());

        let failed = ReconcileOutcome::from(Err(Error::internal("boom")));
        assert!(failed.kind().is_failure());

        let done = ReconcileOutcome::from(Ok(Reconciled::from(Action::await_change())));
        assert_eq!(done.kind(), OutcomeKind::Success);
    }

    #[test]
    fn wait_for_monitor_display_includes_reason() {
        let msg = wait().to_string();
        assert!(msg.contains("Host/ns1/controller-0"));
        assert!(msg.contains("waiting for host to unlock"));
    }

    /// Story: a controller that armed a monitor is not requeued and its
    /// failure count is cleared.
    #[test]
    fn story_pause_is_not_a_failure() {
        let d = dispatcher();
        let err = Error::internal("platform unavailable");
        d.error_policy("ns1/controller-0", &err);
        assert_eq!(d.attempts("ns1/controller-0"), 1);

        let action = d
            .finish("ns1/controller-0", Ok(Reconciled::Pending(wait())))
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(d.attempts("ns1/controller-0"), 0);
    }

    #[test]
    fn failures_back_off_per_object() {
        let d = dispatcher();
        let err = Error::internal("platform unavailable");

        assert_eq!(d.error_policy("a", &err), Action::requeue(Duration::from_secs(1)));
        assert_eq!(d.error_policy("a", &err), Action::requeue(Duration::from_secs(2)));
        assert_eq!(d.error_policy("b", &err), Action::requeue(Duration::from_secs(1)));

        assert!(d.finish("a", Err(Error::internal("again"))).is_err());
        d.finish("a", Ok(Reconciled::Done(Action::await_change()))).unwrap();
        assert_eq!(d.attempts("a"), 0);
        assert_eq!(d.attempts("b"), 1);
    }

    /// Story: the endpoint secret has not been created yet, so the system
    /// reconcile fails with a 404. The object is requeued with backoff
    /// instead of stalling until someone edits it.
    #[test]
    fn story_api_client_errors_requeue_with_backoff() {
        let d = dispatcher();
        assert_eq!(
            d.error_policy("ns1/system", &api_error(404)),
            Action::requeue(Duration::from_secs(1))
        );
        assert_eq!(
            d.error_policy("ns1/system", &api_error(403)),
            Action::requeue(Duration::from_secs(2))
        );
        assert_eq!(
            d.error_policy("ns1/other", &api_error(422)),
            Action::requeue(Duration::from_secs(1))
        );
        assert_ne!(
            d.error_policy("ns1/platform", &Error::platform_client("ns1", "connection refused")),
            Action::await_change()
        );
    }

    #[test]
    fn permanent_failures_wait_for_change() {
        let d = dispatcher();
        let err = Error::invalid_object("Host/?/a", "missing namespace");
        assert_eq!(d.error_policy("a", &err), Action::await_change());
        assert_eq!(d.attempts("a"), 0);
    }
}
