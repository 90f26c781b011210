//! Shared coordinator for deployment manager controllers
//!
//! One [`Coordinator`] is built at startup and cloned into every
//! controller's context. It owns:
//!
//! - the per-namespace platform client, readiness flag and system type
//! - the monitor registry
//! - the notification cascade between controllers
//!
//! All bookkeeping runs under a single mutex that is never held across an
//! await. Platform client rebuilds are left to the system controller: a
//! reset only clears the client and wakes the System objects.

use std::sync::Arc;

use kube::Client;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use dm_common::{metrics, Error, ResourceKind, Result, SystemType, SYSTEM_DEPENDENCIES};

use crate::config::CoordinatorConfig;
use crate::monitor::{Monitor, MonitorKey, MonitorState};
use crate::notify;
use crate::outcome::{Dispatcher, WaitForMonitor};
use crate::platform::{PlatformClient, PlatformClientFactory, SecretClientFactory};
use crate::registry::{Registry, SystemNamespace};
use crate::store::{KubeObjectStore, ObjectStore, ObjectTarget};

struct Inner {
    store: Arc<dyn ObjectStore>,
    factory: Arc<dyn PlatformClientFactory>,
    config: CoordinatorConfig,
    registry: Mutex<Registry>,
}

/// Process-wide coordination state shared by all controllers
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create a coordinator over explicit store and client factory implementations
    pub fn new(
        store: Arc<dyn ObjectStore>,
        factory: Arc<dyn PlatformClientFactory>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                factory,
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Create a coordinator backed by the cluster
    pub fn from_client(client: Client, config: CoordinatorConfig) -> Self {
        Self::new(
            Arc::new(KubeObjectStore::new(client.clone())),
            Arc::new(SecretClientFactory::new(client)),
            config,
        )
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock()
    }

    /// Shared cluster object store
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.inner.store)
    }

    /// Configuration the coordinator was built with
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Create a reconcile dispatcher for `controller` using the configured backoff
    pub fn dispatcher(&self, controller: impl Into<String>) -> Dispatcher {
        Dispatcher::new(controller, self.inner.config.backoff.clone())
    }

    // =========================================================================
    // Platform clients
    // =========================================================================

    /// Current platform client for `namespace`, if one has been built
    pub fn get_platform_client(&self, namespace: &str) -> Option<PlatformClient> {
        self.registry().client(namespace)
    }

    /// Build a platform client for `namespace` and store it
    ///
    /// Replaces any existing client. On failure the registry is unchanged.
    #[instrument(skip_all, fields(namespace = %namespace))]
    pub async fn build_platform_client(&self, namespace: &str) -> Result<PlatformClient> {
        let client = match self.inner.factory.build(namespace).await {
            Ok(client) => client,
            Err(e) => {
                metrics::record_client_build(false);
                warn!(error = %e, "failed to build platform client");
                return Err(match e {
                    Error::PlatformClient { .. } => e,
                    other => Error::platform_client(namespace, other.to_string()),
                });
            }
        };

        metrics::record_client_build(true);
        self.registry().set_client(namespace, client.clone());
        info!(client_id = client.id(), "platform client built");
        Ok(client)
    }

    /// Discard the platform client for `namespace` and wake the system controller
    ///
    /// No-op when there is no client to discard.
    #[instrument(skip_all, fields(namespace = %namespace))]
    pub async fn reset_platform_client(&self, namespace: &str) -> Result<()> {
        let previous = self.registry().take_client(namespace);
        let Some(previous) = previous else {
            debug!("no platform client to reset");
            return Ok(());
        };

        info!(
            client_id = previous.id(),
            "platform client reset, notifying system controller"
        );
        self.notify_system_controller(namespace).await
    }

    // =========================================================================
    // System state
    // =========================================================================

    /// Record whether the system in `namespace` is ready
    pub fn set_system_ready(&self, namespace: &str, ready: bool) {
        self.registry().set_ready(namespace, ready);
    }

    /// Whether the system in `namespace` is ready; false when unknown
    pub fn get_system_ready(&self, namespace: &str) -> bool {
        self.registry().ready(namespace)
    }

    /// Record the deployment type of the system in `namespace`
    ///
    /// Returns true if the value changed.
    pub fn set_system_type(&self, namespace: &str, system_type: SystemType) -> bool {
        let changed = self.registry().set_system_type(namespace, system_type);
        if changed {
            info!(namespace = %namespace, system_type = %system_type, "system type updated");
        }
        changed
    }

    /// Deployment type of the system in `namespace`
    pub fn get_system_type(&self, namespace: &str) -> SystemType {
        self.registry().system_type(namespace)
    }

    /// Snapshot of everything known about `namespace`
    pub fn system(&self, namespace: &str) -> Option<SystemNamespace> {
        self.registry().system(namespace)
    }

    // =========================================================================
    // Monitors
    // =========================================================================

    /// Register and start `monitor`, returning the pause signal for the caller
    ///
    /// A monitor already registered under the same key is stopped and
    /// replaced.
    pub fn start_monitor(&self, monitor: Monitor, message: impl Into<String>) -> WaitForMonitor {
        let key = monitor.key().clone();
        let id = monitor.id();

        // Start under the lock so the task cannot deregister before it is registered
        let (previous, active) = {
            let mut registry = self.registry();
            let mut previous = registry.insert_monitor(monitor);
            if let Some(previous) = previous.as_mut() {
                previous.stop();
            }
            if let Some(monitor) = registry.monitor_mut(&key) {
                monitor.start(self.clone());
            }
            (previous, registry.monitor_count())
        };
        metrics::set_active_monitors(active);

        if let Some(previous) = previous {
            info!(monitor = %key, replaced = previous.id(), id, "replaced running monitor");
        } else {
            info!(monitor = %key, id, "monitor registered");
        }

        WaitForMonitor::new(key, message)
    }

    /// Stop and remove the monitor registered under `key`; no-op if absent
    pub fn cancel_monitor(&self, key: &MonitorKey) {
        let (removed, active) = {
            let mut registry = self.registry();
            let removed = registry.remove_monitor(key);
            (removed, registry.monitor_count())
        };

        match removed {
            Some(mut monitor) => {
                monitor.stop();
                metrics::set_active_monitors(active);
                info!(monitor = %key, id = monitor.id(), "monitor cancelled");
            }
            None => debug!(monitor = %key, "no monitor to cancel"),
        }
    }

    /// Stop and remove the monitor owned by `target`; no-op if absent
    pub fn cancel_monitor_for(&self, target: &ObjectTarget) {
        self.cancel_monitor(&MonitorKey::from_target(target));
    }

    /// State of the monitor registered under `key`
    pub fn monitor_state(&self, key: &MonitorKey) -> Option<MonitorState> {
        self.registry().monitor_state(key)
    }

    /// Deregister a finished monitor if it is still the registered instance
    pub(crate) fn release_monitor(&self, key: &MonitorKey, id: u64) {
        let (removed, active) = {
            let mut registry = self.registry();
            let removed = registry.remove_monitor_if(key, id);
            (removed, registry.monitor_count())
        };

        if removed.is_some() {
            metrics::set_active_monitors(active);
            debug!(monitor = %key, id, "monitor deregistered");
        } else {
            debug!(monitor = %key, id, "monitor already replaced or cancelled");
        }
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Re-queue a single resource by bumping its notification annotation
    #[instrument(skip_all, fields(resource = %target))]
    pub async fn notify_resource(&self, target: &ObjectTarget) -> Result<()> {
        notify::notify_resource(self.inner.store.as_ref(), target).await?;
        Ok(())
    }

    /// Re-queue every system dependency object in `namespace`
    ///
    /// Stops at the first failure.
    #[instrument(skip_all, fields(namespace = %namespace))]
    pub async fn notify_system_dependencies(&self, namespace: &str) -> Result<()> {
        notify::notify_kinds(self.inner.store.as_ref(), namespace, SYSTEM_DEPENDENCIES).await?;
        Ok(())
    }

    /// Re-queue every System object in `namespace`
    #[instrument(skip_all, fields(namespace = %namespace))]
    pub async fn notify_system_controller(&self, namespace: &str) -> Result<()> {
        notify::notify_kinds(self.inner.store.as_ref(), namespace, &[ResourceKind::System]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MockPlatformClientFactory, PlatformEndpoint};
    use crate::store::{InMemoryObjectStore, MockObjectStore};
    use dm_common::NOTIFICATION_COUNT_KEY;
    use kube::api::DynamicObject;

    fn endpoint() -> PlatformEndpoint {
        PlatformEndpoint {
            auth_url: "https://10.10.10.2:5000/v3".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            project_name: "admin".to_string(),
            region_name: "RegionOne".to_string(),
            project_domain_name: "Default".to_string(),
            user_domain_name: "Default".to_string(),
            interface: "public".to_string(),
        }
    }

    fn working_factory() -> MockPlatformClientFactory {
        let mut factory = MockPlatformClientFactory::new();
        factory
            .expect_build()
            .returning(|ns| Ok(PlatformClient::new(ns, endpoint())));
        factory
    }

    fn coordinator(
        store: Arc<dyn ObjectStore>,
        factory: MockPlatformClientFactory,
    ) -> Coordinator {
        Coordinator::new(store, Arc::new(factory), CoordinatorConfig::default())
    }

    fn seed_system(store: &InMemoryObjectStore, namespace: &str) -> ObjectTarget {
        let ar = ResourceKind::System.api_resource();
        store
            .insert(&ar, DynamicObject::new("system", &ar).within(namespace))
            .unwrap()
    }

    #[tokio::test]
    async fn client_is_absent_until_built() {
        let coordinator = coordinator(Arc::new(InMemoryObjectStore::new()), working_factory());
        assert!(coordinator.get_platform_client("ns1").is_none());

        let built = coordinator.build_platform_client("ns1").await.unwrap();
        let stored = coordinator.get_platform_client("ns1").unwrap();
        assert!(built.ptr_eq(&stored));
        assert!(coordinator.get_platform_client("ns2").is_none());
    }

    #[tokio::test]
    async fn rebuild_replaces_client() {
        let coordinator = coordinator(Arc::new(InMemoryObjectStore::new()), working_factory());
        let first = coordinator.build_platform_client("ns1").await.unwrap();
        let second = coordinator.build_platform_client("ns1").await.unwrap();
        assert!(!first.ptr_eq(&second));
        assert!(coordinator.get_platform_client("ns1").unwrap().ptr_eq(&second));
    }

    /// Story: the endpoint secret is missing at first, so the build fails
    /// and nothing is stored. Once it appears, the next build succeeds.
    #[tokio::test]
    async fn story_failed_build_leaves_registry_untouched() {
        let mut factory = MockPlatformClientFactory::new();
        let mut seq = mockall::Sequence::new();
        factory
            .expect_build()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ns| Err(Error::platform_client(ns, "secret system-endpoint not found")));
        factory
            .expect_build()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ns| Ok(PlatformClient::new(ns, endpoint())));

        let coordinator = coordinator(Arc::new(InMemoryObjectStore::new()), factory);
        coordinator.set_system_ready("ns1", true);

        let err = coordinator.build_platform_client("ns1").await.unwrap_err();
        assert!(matches!(err, Error::PlatformClient { .. }));
        assert!(coordinator.get_platform_client("ns1").is_none());
        assert!(coordinator.get_system_ready("ns1"));

        coordinator.build_platform_client("ns1").await.unwrap();
        assert!(coordinator.get_platform_client("ns1").is_some());
    }

    #[tokio::test]
    async fn factory_errors_become_client_errors() {
        let mut factory = MockPlatformClientFactory::new();
        factory
            .expect_build()
            .returning(|_| Err(Error::internal("tls handshake failed")));

        let coordinator = coordinator(Arc::new(InMemoryObjectStore::new()), factory);
        let err = coordinator.build_platform_client("ns1").await.unwrap_err();
        assert!(matches!(err, Error::PlatformClient { ref namespace, .. } if namespace == "ns1"));
    }

    #[tokio::test]
    async fn reset_clears_client_and_notifies_system_once() {
        let store = Arc::new(InMemoryObjectStore::new());
        let system = seed_system(&store, "ns1");
        let coordinator = coordinator(store.clone(), working_factory());

        coordinator.build_platform_client("ns1").await.unwrap();
        coordinator.reset_platform_client("ns1").await.unwrap();
        assert!(coordinator.get_platform_client("ns1").is_none());
        assert_eq!(
            store.annotation(&system, NOTIFICATION_COUNT_KEY).as_deref(),
            Some("1")
        );

        coordinator.reset_platform_client("ns1").await.unwrap();
        assert_eq!(
            store.annotation(&system, NOTIFICATION_COUNT_KEY).as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn reset_unknown_namespace_touches_nothing() {
        // Any store call would panic: no expectations are set
        let store = MockObjectStore::new();
        let coordinator = coordinator(Arc::new(store), MockPlatformClientFactory::new());
        coordinator.reset_platform_client("ns1").await.unwrap();
    }

    #[tokio::test]
    async fn reset_surfaces_notification_failure() {
        let mut store = MockObjectStore::new();
        store
            .expect_list()
            .returning(|_, _| Err(Error::internal("api server unavailable")));

        let coordinator = coordinator(Arc::new(store), working_factory());
        coordinator.build_platform_client("ns1").await.unwrap();

        let err = coordinator.reset_platform_client("ns1").await.unwrap_err();
        assert!(err.to_string().contains("api server unavailable"));
        // The client is cleared even though the notification failed
        assert!(coordinator.get_platform_client("ns1").is_none());
    }

    #[test]
    fn system_state_defaults_and_merges() {
        let coordinator = coordinator(
            Arc::new(InMemoryObjectStore::new()),
            MockPlatformClientFactory::new(),
        );
        assert!(!coordinator.get_system_ready("ns1"));
        assert_eq!(coordinator.get_system_type("ns1"), SystemType::Unknown);

        coordinator.set_system_ready("ns1", true);
        assert!(coordinator.set_system_type("ns1", SystemType::Standard));
        assert!(!coordinator.set_system_type("ns1", SystemType::Standard));

        let system = coordinator.system("ns1").unwrap();
        assert!(system.ready());
        assert_eq!(system.system_type(), SystemType::Standard);
        assert!(system.client().is_none());
        assert!(!coordinator.get_system_ready("ns2"));
    }

    #[test]
    fn cancel_unknown_monitor_is_noop() {
        let coordinator = coordinator(
            Arc::new(InMemoryObjectStore::new()),
            MockPlatformClientFactory::new(),
        );
        let target = ObjectTarget::of_kind(ResourceKind::Host, "ns1", "controller-0");
        coordinator.cancel_monitor_for(&target);
        assert!(coordinator
            .monitor_state(&MonitorKey::from_target(&target))
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ready_updates_do_not_corrupt_registry() {
        let coordinator = coordinator(
            Arc::new(InMemoryObjectStore::new()),
            MockPlatformClientFactory::new(),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..64 {
            let coordinator = coordinator.clone();
            tasks.spawn(async move {
                let namespace = format!("ns{}", i % 4);
                for _ in 0..100 {
                    coordinator.set_system_ready(&namespace, true);
                    assert!(coordinator.get_system_ready(&namespace));
                    coordinator.set_system_type(&namespace, SystemType::AllInOne);
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        for i in 0..4 {
            let system = coordinator.system(&format!("ns{}", i)).unwrap();
            assert!(system.ready());
            assert_eq!(system.system_type(), SystemType::AllInOne);
        }
    }

    #[test]
    fn dispatcher_uses_configured_backoff() {
        let coordinator = coordinator(
            Arc::new(InMemoryObjectStore::new()),
            MockPlatformClientFactory::new(),
        );
        let dispatcher = coordinator.dispatcher("system");
        assert_eq!(dispatcher.controller(), "system");
    }
}
