//! Per-namespace system state and the monitor registry
//!
//! Both maps live behind the coordinator's single mutex. Nothing here
//! performs I/O; callers take the lock, mutate, and drop it before awaiting.

use std::collections::HashMap;

use dm_common::SystemType;

use crate::monitor::{Monitor, MonitorKey, MonitorState};
use crate::platform::PlatformClient;

/// Snapshot of the coordinator's state for one system namespace
#[derive(Debug, Clone, Default)]
pub struct SystemNamespace {
    client: Option<PlatformClient>,
    ready: bool,
    system_type: SystemType,
}

impl SystemNamespace {
    /// Platform client, if one has been built
    pub fn client(&self) -> Option<&PlatformClient> {
        self.client.as_ref()
    }

    /// Whether the system controller has marked the system ready
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Deployment type reported by the system controller
    pub fn system_type(&self) -> SystemType {
        self.system_type
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    systems: HashMap<String, SystemNamespace>,
    monitors: HashMap<MonitorKey, Monitor>,
}

impl Registry {
    fn entry(&mut self, namespace: &str) -> &mut SystemNamespace {
        self.systems.entry(namespace.to_string()).or_default()
    }

    pub(crate) fn system(&self, namespace: &str) -> Option<SystemNamespace> {
        self.systems.get(namespace).cloned()
    }

    pub(crate) fn client(&self, namespace: &str) -> Option<PlatformClient> {
        self.systems.get(namespace)?.client.clone()
    }

    pub(crate) fn set_client(&mut self, namespace: &str, client: PlatformClient) {
        self.entry(namespace).client = Some(client);
    }

    /// Clear the client, returning it. `None` if there was nothing to clear.
    pub(crate) fn take_client(&mut self, namespace: &str) -> Option<PlatformClient> {
        self.systems.get_mut(namespace)?.client.take()
    }

    pub(crate) fn set_ready(&mut self, namespace: &str, ready: bool) {
        self.entry(namespace).ready = ready;
    }

    pub(crate) fn ready(&self, namespace: &str) -> bool {
        self.systems.get(namespace).is_some_and(|s| s.ready)
    }

    /// Returns true if the stored value changed
    pub(crate) fn set_system_type(&mut self, namespace: &str, system_type: SystemType) -> bool {
        let entry = self.entry(namespace);
        if entry.system_type == system_type {
            return false;
        }
        entry.system_type = system_type;
        true
    }

    pub(crate) fn system_type(&self, namespace: &str) -> SystemType {
        self.systems
            .get(namespace)
            .map(|s| s.system_type)
            .unwrap_or_default()
    }

    /// Register a monitor, returning any monitor previously under its key
    pub(crate) fn insert_monitor(&mut self, monitor: Monitor) -> Option<Monitor> {
        self.monitors.insert(monitor.key().clone(), monitor)
    }

    pub(crate) fn remove_monitor(&mut self, key: &MonitorKey) -> Option<Monitor> {
        self.monitors.remove(key)
    }

    /// Remove the monitor under `key` only if it is the instance `id`
    pub(crate) fn remove_monitor_if(&mut self, key: &MonitorKey, id: u64) -> Option<Monitor> {
        if self.monitors.get(key)?.id() != id {
            return None;
        }
        self.monitors.remove(key)
    }

    pub(crate) fn monitor_state(&self, key: &MonitorKey) -> Option<MonitorState> {
        self.monitors.get(key).map(Monitor::state)
    }

    pub(crate) fn monitor_mut(&mut self, key: &MonitorKey) -> Option<&mut Monitor> {
        self.monitors.get_mut(key)
    }

    pub(crate) fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}
