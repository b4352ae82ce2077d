//! Site operator mode: the `run` subcommand.
//!
//! Under the leader lease, the daemon:
//! 1. Primes the shard inventory and the route table from a listing
//! 2. Keeps both current from their watch streams
//! 3. Runs the site controller until cancelled

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wpo_leader::{LeaderElector, LeaderExit};
use wpo_placement::DatabasePlacer;
use wpo_routing::RouteResolver;
use wpo_site::{SiteController, SiteReconciler, WpCliExecutor, WpExecutor};
use wpo_store::{ApiKind, EventType, ResourceStore, WatchEvent};

use crate::config::OperatorConfig;

/// Everything the site controller needs, wired together.
pub struct SiteEngine {
    store: Arc<dyn ResourceStore>,
    placer: Arc<DatabasePlacer>,
    routes: Arc<RouteResolver>,
    controller: Arc<SiteController>,
}

impl SiteEngine {
    pub fn build(store: Arc<dyn ResourceStore>, config: &OperatorConfig) -> Self {
        let placer = Arc::new(DatabasePlacer::new(Arc::clone(&store)).with_config(config.placement.clone()));
        let routes = Arc::new(RouteResolver::new(Arc::clone(&store)).with_config(config.routing.clone()));
        let executor: Arc<dyn WpExecutor> = Arc::new(WpCliExecutor::new(config.executor.clone()));
        let (readiness, restore) = config.readiness.policies();
        let reconciler = Arc::new(
            SiteReconciler::new(Arc::clone(&store), Arc::clone(&placer), Arc::clone(&routes), executor)
                .with_config(config.site.clone())
                .with_readiness(readiness, restore),
        );
        let controller = Arc::new(SiteController::with_config(
            Arc::clone(&store),
            reconciler,
            config.controller.controller_config(),
        ));
        Self {
            store,
            placer,
            routes,
            controller,
        }
    }

    /// Fill the indexes from a listing so the first site events see the
    /// existing shards and routes.
    pub async fn prime(&self, namespace: Option<&str>) {
        let placement = self.placer.config();
        for kind in [&placement.shard_kind, &placement.database_kind] {
            self.replay(kind, namespace, |event| self.placer.apply(event)).await;
        }
        let routes = &self.routes.config().route_kind;
        self.replay(routes, namespace, |event| self.routes.table().apply(event)).await;
    }

    async fn replay(&self, kind: &ApiKind, namespace: Option<&str>, apply: impl Fn(&WatchEvent)) {
        match self.store.list(kind, namespace).await {
            Ok(objects) => {
                info!(%kind, count = objects.len(), "primed");
                for object in objects {
                    apply(&WatchEvent::new(EventType::Added, object));
                }
            }
            Err(e) => warn!(%kind, error = %e, "cannot prime, relying on the watch"),
        }
    }

    /// Run until cancelled, then wait for in-flight passes.
    pub async fn run(self, namespace: Option<String>, cancel: CancellationToken) {
        self.prime(namespace.as_deref()).await;

        let placer = tokio::spawn(Arc::clone(&self.placer).run(namespace.clone(), cancel.clone()));
        let routes = tokio::spawn(Arc::clone(&self.routes).run(namespace.clone(), cancel.clone()));

        Arc::clone(&self.controller).run(namespace, cancel).await;

        let _ = placer.await;
        let _ = routes.await;
    }
}

/// Compete for the lease and run the site engine while holding it.
pub async fn run_operator(
    store: Arc<dyn ResourceStore>,
    config: &OperatorConfig,
    cancel: CancellationToken,
) -> anyhow::Result<LeaderExit> {
    let scope = config.watch_scope()?;
    let elector = LeaderElector::new(Arc::clone(&store), &config.lease_namespace()?, config.leader.clone())?;
    info!(
        namespace = scope.as_deref().unwrap_or("*"),
        identity = elector.identity(),
        dry_run = config.executor.dry_run,
        "site operator starting"
    );

    let engine = SiteEngine::build(store, config);
    let exit = elector.gate(&cancel, |token| engine.run(scope, token)).await;
    info!(?exit, "site operator stopped");
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wpo_leader::LeaseRecord;
    use wpo_store::{InMemoryStore, ManagedObject, ObjectRef};

    use super::*;

    const NS: &str = "wordpress-test";

    /// Poll `check` once a second for up to ten minutes.
    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..600 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    fn object(definition: serde_json::Value) -> ManagedObject {
        ManagedObject::from_definition(definition).unwrap()
    }

    /// Marks MariaDB databases, users and grants ready as they appear.
    async fn mark_ready(store: InMemoryStore, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            for kind in ["Database", "User", "Grant"] {
                let kind = ApiKind::new("k8s.mariadb.com/v1alpha1", kind);
                for found in store.list(&kind, Some(NS)).await.unwrap() {
                    if found.conditions().is_empty() {
                        let status = json!({"conditions": [{"type": "Ready", "status": "True", "message": "Created"}]});
                        let _ = store.patch_status(found.object_ref(), &status).await;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn operator_creates_sites_and_releases_the_lease() {
        let store = InMemoryStore::new();
        store
            .create(&object(json!({
                "apiVersion": "k8s.mariadb.com/v1alpha1",
                "kind": "MariaDB",
                "metadata": {"name": "mariadb-01", "namespace": NS, "labels": {"wpAutoallocate": "true"}},
            })))
            .await
            .unwrap();
        let site = store
            .create(&object(json!({
                "apiVersion": "wordpress.epfl.ch/v2",
                "kind": "WordpressSite",
                "metadata": {"name": "blog", "namespace": NS},
                "spec": {"hostname": "www.example.com", "path": "/blog", "wordpress": {"title": "Blog"}},
            })))
            .await
            .unwrap();

        let mut config = OperatorConfig {
            namespace: Some(NS.into()),
            ..OperatorConfig::default()
        };
        config.executor.dry_run = true;
        config.readiness.interval_secs = 1;

        let cancel = CancellationToken::new();
        tokio::spawn(mark_ready(store.clone(), cancel.clone()));
        let operator = tokio::spawn({
            let store: Arc<dyn ResourceStore> = Arc::new(store.clone());
            let cancel = cancel.clone();
            async move { run_operator(store, &config, cancel).await }
        });

        let created = wait_for(|| {
            let store = store.clone();
            let target = site.object_ref().clone();
            async move {
                let current = store.get(&target).await.unwrap();
                current.field(&["status", "wordpresssite", "state"]) == Some(&json!("created"))
            }
        })
        .await;
        assert!(created);

        let route = ObjectRef::namespaced(ApiKind::new("route.openshift.io/v1", "Route"), NS, "wp-route-blog");
        assert!(store.exists(&route).await.unwrap());

        cancel.cancel();
        assert_eq!(operator.await.unwrap().unwrap(), LeaderExit::EngineStopped);

        let lease = ObjectRef::namespaced(wpo_leader::lease_kind(), NS, "wp-operator-lock");
        let lease = LeaseRecord::from_object(&store.get(&lease).await.unwrap()).unwrap();
        assert_eq!(lease.holder, None);
    }

    #[tokio::test]
    async fn operator_needs_a_namespace() {
        let store: Arc<dyn ResourceStore> = Arc::new(InMemoryStore::new());
        let result = run_operator(store, &OperatorConfig::default(), CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
