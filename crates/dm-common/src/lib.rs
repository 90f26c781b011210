//! Common types for the deployment manager: errors, resource kinds, telemetry

#![deny(missing_docs)]

pub mod error;
pub mod kinds;
pub mod metrics;
pub mod telemetry;

pub use error::{Error, KubeResultExt};
pub use kinds::{ResourceKind, SystemMode, SystemType, SYSTEM_DEPENDENCIES};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the deployment manager resources
pub const API_GROUP: &str = "starlingx.windriver.com";

/// API version of the deployment manager resources
pub const API_VERSION: &str = "v1";

/// Well-known name of the secret holding the system API endpoint attributes (OS_*)
pub const SYSTEM_ENDPOINT_SECRET_NAME: &str = "system-endpoint";

/// Annotation holding the notification counter used to force a reconcile
pub const NOTIFICATION_COUNT_KEY: &str = "deployment-manager/notifications";

/// Annotation consumed by controllers that must reconcile again once in sync.
///
/// Not interpreted by the coordinator.
pub const RECONCILE_AFTER_INSYNC_KEY: &str = "deployment-manager/reconcile-after-insync";

/// URL prefix for TLS platform endpoints
pub const HTTPS_PREFIX: &str = "https://";

/// URL prefix for plaintext platform endpoints
pub const HTTP_PREFIX: &str = "http://";
