//! Metrics for the deployment manager coordination layer
//!
//! - Reconcile outcomes (success, failure, pending)
//! - Active monitors
//! - Notification annotations written
//! - Platform client builds

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Global meter for deployment manager metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("deployment-manager"));

/// Counter of reconcile attempts by outcome
///
/// Labels:
/// - `controller`: controller name
/// - `outcome`: success, failure, pending
pub static RECONCILE_OUTCOMES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dm_reconcile_outcomes_total")
        .with_description("Total number of reconcile attempts by outcome")
        .with_unit("{reconciles}")
        .build()
});

/// Gauge of monitors currently registered
pub static ACTIVE_MONITORS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("dm_active_monitors")
        .with_description("Number of monitors currently registered")
        .with_unit("{monitors}")
        .build()
});

/// Counter of notification annotations written
///
/// Labels:
/// - `kind`: resource kind that was notified
pub static NOTIFICATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dm_notifications_total")
        .with_description("Total number of notification annotations written")
        .with_unit("{notifications}")
        .build()
});

/// Counter of platform client build attempts
///
/// Labels:
/// - `result`: success, error
pub static PLATFORM_CLIENT_BUILDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dm_platform_client_builds_total")
        .with_description("Total number of platform client build attempts")
        .with_unit("{builds}")
        .build()
});

/// Record the outcome of one reconcile attempt
pub fn record_reconcile_outcome(controller: &str, outcome: &str) {
    RECONCILE_OUTCOMES.add(
        1,
        &[
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

/// Update the active monitor gauge
pub fn set_active_monitors(count: usize) {
    ACTIVE_MONITORS.record(count as u64, &[]);
}

/// Record a notification annotation write
pub fn record_notification(kind: &str) {
    NOTIFICATIONS.add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a platform client build attempt
pub fn record_client_build(success: bool) {
    let result = if success { "success" } else { "error" };
    PLATFORM_CLIENT_BUILDS.add(1, &[KeyValue::new("result", result)]);
}
