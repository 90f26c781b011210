//! Coordination layer shared by the deployment manager controllers
//!
//! Controllers receive a cloned [`Coordinator`] and use it to:
//!
//! - share one platform API client per system namespace
//! - wake other controllers through the notification annotation cascade
//! - pause their own reconcile until a background [`Monitor`] re-queues them
//!
//! A pausing reconcile returns [`Reconciled::Pending`], which the
//! [`Dispatcher`] maps to "no requeue" instead of the error path.

#![deny(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod monitor;
pub mod notify;
pub mod outcome;
pub mod platform;
pub mod registry;
pub mod store;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use monitor::{condition_fn, FnCondition, Monitor, MonitorCondition, MonitorKey, MonitorState};
pub use notify::{bump_notification_count, next_notification_count};
pub use outcome::{
    BackoffPolicy, Dispatcher, OutcomeKind, ReconcileOutcome, ReconcileResult, Reconciled,
    WaitForMonitor,
};
pub use platform::{PlatformClient, PlatformClientFactory, PlatformEndpoint, SecretClientFactory};
pub use registry::SystemNamespace;
pub use store::{InMemoryObjectStore, KubeObjectStore, ObjectStore, ObjectTarget};
