//! Annotation-based notification cascade
//!
//! Controllers watch their own objects, so writing a fresh value to an
//! object's notification annotation wakes its controller. The value is a
//! decimal counter that only ever increases; it carries no other meaning.

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use tracing::{debug, info};

use dm_common::{metrics, ResourceKind, Result, NOTIFICATION_COUNT_KEY};

use crate::store::{ObjectStore, ObjectTarget};

/// Next counter value after `current`
///
/// Missing, malformed and overflowing values restart the count at 1.
pub fn next_notification_count(current: Option<&str>) -> String {
    current
        .and_then(|v| v.trim().parse::<u64>().ok())
        .and_then(|v| v.checked_add(1))
        .unwrap_or(1)
        .to_string()
}

/// Bump the notification annotation on `object` in place, returning the new value
pub fn bump_notification_count(object: &mut DynamicObject) -> String {
    let annotations = object.metadata.annotations.get_or_insert_with(Default::default);
    let next = next_notification_count(annotations.get(NOTIFICATION_COUNT_KEY).map(String::as_str));
    annotations.insert(NOTIFICATION_COUNT_KEY.to_string(), next.clone());
    next
}

async fn notify_object(
    store: &dyn ObjectStore,
    resource: &ApiResource,
    mut object: DynamicObject,
) -> Result<String> {
    let count = bump_notification_count(&mut object);
    store.update(resource, &object).await?;
    metrics::record_notification(&resource.kind);

    debug!(
        kind = %resource.kind,
        namespace = object.metadata.namespace.as_deref().unwrap_or_default(),
        name = object.metadata.name.as_deref().unwrap_or_default(),
        count = %count,
        "notified controller"
    );
    Ok(count)
}

/// Re-queue a single resource from a fresh read
pub(crate) async fn notify_resource(store: &dyn ObjectStore, target: &ObjectTarget) -> Result<String> {
    let object = store.get(target).await?;
    notify_object(store, target.resource(), object).await
}

/// Re-queue every object of `kinds` in `namespace`
///
/// Stops at the first failure; objects already notified stay notified.
/// Returns the number of objects notified.
pub(crate) async fn notify_kinds(
    store: &dyn ObjectStore,
    namespace: &str,
    kinds: &[ResourceKind],
) -> Result<usize> {
    let mut notified = 0;
    for kind in kinds {
        let resource = kind.api_resource();
        for object in store.list(&resource, namespace).await? {
            notify_object(store, &resource, object).await?;
            notified += 1;
        }
    }

    info!(namespace = %namespace, kinds = ?kinds, notified, "notified controllers");
    Ok(notified)
}
