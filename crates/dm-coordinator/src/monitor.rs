//! Background monitors
//!
//! A monitor polls an application-defined condition on behalf of one owning
//! resource. When the condition is satisfied (or the optional timeout
//! expires) the monitor re-queues its owner by bumping the owner's
//! notification annotation, then removes itself from the coordinator.
//!
//! Lifecycle: `Idle -> Running -> Stopped`. A stopped monitor may be started
//! again. Stopping cancels the task's token; the task exits at its next
//! await point and never re-queues the owner afterwards.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::discovery::ApiResource;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use dm_common::Result;

use crate::coordinator::Coordinator;
use crate::store::ObjectTarget;

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Registry key of a monitor: group/version/kind/namespace/name of its owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorKey(String);

impl MonitorKey {
    /// Build a key from an owner's resource type and identity
    pub fn new(resource: &ApiResource, namespace: &str, name: &str) -> Self {
        Self(format!(
            "{}/{}/{}/{}/{}",
            resource.group, resource.version, resource.kind, namespace, name
        ))
    }

    /// Build the key for monitors owned by `target`
    pub fn from_target(target: &ObjectTarget) -> Self {
        Self::new(target.resource(), target.namespace(), target.name())
    }

    /// Key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Created, never started
    Idle,
    /// Background task is polling
    Running,
    /// Stopped; the task exits without re-queuing the owner
    Stopped,
}

/// Condition polled by a monitor
///
/// `Ok(true)` means the owner should be re-queued. Errors are logged and the
/// condition is polled again on the next tick.
#[async_trait]
pub trait MonitorCondition: Send + Sync {
    /// Evaluate the condition once
    async fn check(&self) -> Result<bool>;
}

/// [`MonitorCondition`] backed by an async closure
pub struct FnCondition<F>(F);

#[async_trait]
impl<F, Fut> MonitorCondition for FnCondition<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    async fn check(&self) -> Result<bool> {
        (self.0)().await
    }
}

/// Wrap an async closure as a monitor condition
///
/// ```ignore
/// let done = condition_fn(move || {
///     let platform = platform.clone();
///     async move { Ok(platform.is_unlocked().await?) }
/// });
/// ```
pub fn condition_fn<F, Fut>(f: F) -> FnCondition<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    FnCondition(f)
}

/// A background poller that re-queues its owning resource
pub struct Monitor {
    id: u64,
    key: MonitorKey,
    target: ObjectTarget,
    condition: Arc<dyn MonitorCondition>,
    interval: Option<Duration>,
    timeout: Option<Duration>,
    state: MonitorState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Create an idle monitor for `target`
    ///
    /// Interval and timeout default to the coordinator's configuration.
    pub fn new(target: ObjectTarget, condition: impl MonitorCondition + 'static) -> Self {
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            key: MonitorKey::from_target(&target),
            target,
            condition: Arc::new(condition),
            interval: None,
            timeout: None,
            state: MonitorState::Idle,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Poll every `interval` instead of the configured default
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Re-queue the owner after `timeout` even if the condition never holds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Process-unique id of this monitor instance
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Registry key
    pub fn key(&self) -> &MonitorKey {
        &self.key
    }

    /// Resource re-queued when the monitor fires
    pub fn target(&self) -> &ObjectTarget {
        &self.target
    }

    /// Current lifecycle state
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Spawn the polling task. No-op if already running.
    pub(crate) fn start(&mut self, coordinator: Coordinator) {
        if self.state == MonitorState::Running {
            return;
        }

        let config = coordinator.config();
        let interval = self.interval.unwrap_or(config.monitor_interval);
        let timeout = self.timeout.or(config.monitor_timeout);

        // A stopped monitor's token is already cancelled
        self.cancel = CancellationToken::new();

        let span = info_span!("monitor", monitor = %self.key, owner = %self.target, id = self.id);
        let task = MonitorTask {
            coordinator,
            id: self.id,
            key: self.key.clone(),
            target: self.target.clone(),
            condition: Arc::clone(&self.condition),
            interval,
            timeout,
            cancel: self.cancel.clone(),
        };
        self.handle = Some(tokio::spawn(task.run().instrument(span)));
        self.state = MonitorState::Running;

        debug!(
            monitor = %self.key,
            interval_ms = interval.as_millis() as u64,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "monitor started"
        );
    }

    /// Stop the polling task. Idempotent.
    pub fn stop(&mut self) {
        if self.state != MonitorState::Running {
            return;
        }
        self.cancel.cancel();
        // The task observes the token and exits on its own
        self.handle.take();
        self.state = MonitorState::Stopped;
        debug!(monitor = %self.key, "monitor stopped");
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .finish()
    }
}

struct MonitorTask {
    coordinator: Coordinator,
    id: u64,
    key: MonitorKey,
    target: ObjectTarget,
    condition: Arc<dyn MonitorCondition>,
    interval: Duration,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl MonitorTask {
    async fn run(self) {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fired = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("monitor task cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if !fired {
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        debug!("monitor task cancelled during poll");
                        return;
                    }
                    result = self.condition.check() => result,
                };

                match result {
                    Ok(true) => {
                        info!("monitor condition satisfied");
                        fired = true;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "monitor condition check failed");
                    }
                }

                if !fired && deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("monitor timed out, re-queuing owner");
                    fired = true;
                }
            }

            if !fired {
                continue;
            }

            // Keep the registration until the owner has been re-queued
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("monitor task cancelled before re-queue");
                    return;
                }
                result = self.coordinator.notify_resource(&self.target) => result,
            };

            match result {
                Ok(()) => {
                    self.coordinator.release_monitor(&self.key, self.id);
                    return;
                }
                Err(e) => {
                    warn!(
                        resource = %self.target,
                        error = %e,
                        "failed to re-queue monitor owner, retrying"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_common::{Error, ResourceKind};

    fn target() -> ObjectTarget {
        ObjectTarget::of_kind(ResourceKind::Host, "ns1", "controller-0")
    }

    #[test]
    fn key_includes_group_version_kind_namespace_and_name() {
        let key = MonitorKey::from_target(&target());
        assert_eq!(key.as_str(), "starlingx.windriver.com/v1/Host/ns1/controller-0");
    }

    #[test]
    fn keys_differ_by_kind() {
        let host = MonitorKey::from_target(&target());
        let network = MonitorKey::from_target(&ObjectTarget::of_kind(
            ResourceKind::DataNetwork,
            "ns1",
            "controller-0",
        ));
        assert_ne!(host, network);
    }

    #[test]
    fn new_monitor_is_idle_with_unique_id() {
        let a = Monitor::new(target(), condition_fn(|| async { Ok::<_, Error>(false) }));
        let b = Monitor::new(target(), condition_fn(|| async { Ok::<_, Error>(false) }));
        assert_eq!(a.state(), MonitorState::Idle);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn stopping_an_idle_monitor_is_a_noop() {
        let mut monitor = Monitor::new(target(), condition_fn(|| async { Ok::<_, Error>(false) }));
        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn dropping_a_monitor_cancels_its_token() {
        let monitor = Monitor::new(target(), condition_fn(|| async { Ok::<_, Error>(false) }));
        let token = monitor.cancel.clone();
        drop(monitor);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn fn_condition_forwards_result() {
        let condition = condition_fn(|| async { Ok::<_, Error>(true) });
        assert!(condition.check().await.unwrap());
    }
}
