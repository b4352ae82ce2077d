//! Readiness polling for dependent objects.
//!
//! A dependent object is ready when its status carries a condition of the
//! policy's type whose message equals the success sentinel. Polling is
//! capped by attempt count, not wall-clock time.

use std::time::Duration;

use tracing::{debug, warn};

use wpo_store::{ObjectRef, ResourceStore};

use crate::error::{SiteError, SiteResult};

/// How a dependent object signals success, and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub condition_type: String,
    pub success_message: String,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 12,
            interval: Duration::from_secs(5),
            condition_type: "Ready".to_string(),
            success_message: "Created".to_string(),
        }
    }
}

impl ReadinessPolicy {
    /// Policy for MariaDB `Restore` objects.
    pub fn restore() -> Self {
        Self {
            condition_type: "Complete".to_string(),
            success_message: "Success".to_string(),
            ..Self::default()
        }
    }

    /// Same policy with other attempt settings.
    pub fn with_timing(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts;
        self.interval = interval;
        self
    }
}

/// Poll `target` until it reports success. Gives up with a fatal
/// [`SiteError::NotReady`] after `policy.attempts` reads; no sleep
/// follows the last one. A missing object counts as not ready yet.
pub async fn wait_until_ready(
    store: &dyn ResourceStore,
    target: &ObjectRef,
    policy: &ReadinessPolicy,
) -> SiteResult<()> {
    let mut last_message = String::new();
    for attempt in 1..=policy.attempts {
        match store.get(target).await {
            Ok(object) => {
                let condition = object
                    .conditions()
                    .into_iter()
                    .find(|c| c.type_ == policy.condition_type);
                if let Some(condition) = condition {
                    let message = condition.message.unwrap_or_default();
                    if message == policy.success_message {
                        debug!(object = %target, attempt, "ready");
                        return Ok(());
                    }
                    last_message = message;
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        debug!(object = %target, attempt, message = %last_message, "not ready yet");
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    warn!(object = %target, attempts = policy.attempts, message = %last_message, "gave up waiting for readiness");
    Err(SiteError::NotReady {
        object: target.to_string(),
        message: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;
    use wpo_store::{ApiKind, InMemoryStore, ManagedObject};

    fn database(message: &str) -> ManagedObject {
        ManagedObject::from_definition(json!({
            "apiVersion": "k8s.mariadb.com/v1alpha1",
            "kind": "Database",
            "metadata": {"name": "wp-db-blog", "namespace": "ns"},
            "status": {"conditions": [
                {"type": "Ready", "status": "False", "message": message},
            ]},
        }))
        .unwrap()
    }

    fn target() -> ObjectRef {
        ObjectRef::namespaced(ApiKind::new("k8s.mariadb.com/v1alpha1", "Database"), "ns", "wp-db-blog")
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exactly_twelve_polls() {
        let store = InMemoryStore::new();
        store.create(&database("Pending")).await.unwrap();
        let start = Instant::now();

        let err = wait_until_ready(&store, &target(), &ReadinessPolicy::default())
            .await
            .unwrap_err();

        assert_eq!(store.get_calls(), 12);
        assert_eq!(start.elapsed(), Duration::from_secs(55));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("last condition message: Pending"));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_sentinel_appears() {
        let store = InMemoryStore::new();
        store.create(&database("Pending")).await.unwrap();
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            writer
                .patch_status(
                    &target(),
                    &json!({"conditions": [{"type": "Ready", "status": "True", "message": "Created"}]}),
                )
                .await
                .unwrap();
        });

        wait_until_ready(&store, &target(), &ReadinessPolicy::default())
            .await
            .unwrap();
        assert_eq!(store.get_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_object_is_polled_not_failed() {
        let store = InMemoryStore::new();
        let policy = ReadinessPolicy::default().with_timing(3, Duration::from_secs(1));
        let err = wait_until_ready(&store, &target(), &policy).await.unwrap_err();
        assert_eq!(store.get_calls(), 3);
        assert!(matches!(err, SiteError::NotReady { ref message, .. } if message.is_empty()));
    }

    #[tokio::test]
    async fn restore_policy_reads_complete_condition() {
        let store = InMemoryStore::new();
        let restore = ManagedObject::from_definition(json!({
            "apiVersion": "k8s.mariadb.com/v1alpha1",
            "kind": "Restore",
            "metadata": {"name": "m-db-1", "namespace": "ns"},
            "status": {"conditions": [{"type": "Complete", "status": "True", "message": "Success"}]},
        }))
        .unwrap();
        store.create(&restore).await.unwrap();
        let target = ObjectRef::namespaced(ApiKind::new("k8s.mariadb.com/v1alpha1", "Restore"), "ns", "m-db-1");
        wait_until_ready(&store, &target, &ReadinessPolicy::restore()).await.unwrap();
    }
}
