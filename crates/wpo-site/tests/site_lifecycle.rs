//! End-to-end site lifecycle against the in-memory store, a fake MariaDB
//! operator and a fake WordPress.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use wpo_placement::DatabasePlacer;
use wpo_routing::RouteResolver;
use wpo_site::{
    ExecError, ExecOutput, ExecResult, Language, ReadinessPolicy, SiteController, SiteError, SiteHandle,
    SiteReconciler, WpExecutor, WpOperation,
};
use wpo_store::{ApiKind, EventType, InMemoryStore, ManagedObject, ObjectRef, ResourceStore, WatchEvent};

const NS: &str = "wordpress-test";
const MARIADB_API: &str = "k8s.mariadb.com/v1alpha1";

#[derive(Default)]
struct FakeSite {
    plugins: BTreeSet<String>,
    languages: Vec<Language>,
    unit_id: Option<String>,
}

/// Remembers every operation and keeps enough WordPress state to answer
/// status queries.
#[derive(Default)]
struct FakeWordpress {
    ops: Mutex<Vec<(SiteHandle, WpOperation)>>,
    sites: Mutex<HashMap<String, FakeSite>>,
    broken_install: bool,
}

impl FakeWordpress {
    fn ops_for(&self, site: &str) -> Vec<WpOperation> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h.name == site)
            .map(|(_, op)| op.clone())
            .collect()
    }

    fn seed_plugins(&self, site: &str, plugins: &[&str]) {
        let mut sites = self.sites.lock().unwrap();
        let entry = sites.entry(site.to_string()).or_default();
        entry.plugins = plugins.iter().map(|p| p.to_string()).collect();
    }
}

#[async_trait]
impl WpExecutor for FakeWordpress {
    async fn run(&self, site: &SiteHandle, op: &WpOperation) -> ExecResult<ExecOutput> {
        self.ops.lock().unwrap().push((site.clone(), op.clone()));
        let mut sites = self.sites.lock().unwrap();
        let state = sites.entry(site.name.clone()).or_default();
        let stdout = match op {
            WpOperation::Install(_) if self.broken_install => {
                return Err(ExecError::MissingMarker {
                    operation: "install".into(),
                    marker: "WordPress successfully installed".into(),
                });
            }
            WpOperation::Install(_) => "WordPress successfully installed".to_string(),
            WpOperation::ActivatePlugins(names) => {
                state.plugins.extend(names.iter().cloned());
                String::new()
            }
            WpOperation::DeactivatePlugins(names) => {
                for name in names {
                    state.plugins.remove(name);
                }
                String::new()
            }
            WpOperation::AddLanguage(lang) => {
                state.languages.push(lang.clone());
                String::new()
            }
            WpOperation::DeleteLanguage(slug) => {
                state.languages.retain(|l| &l.slug != slug);
                String::new()
            }
            WpOperation::Eval(php) => {
                let marker = "update_option(\"plugin:epfl_accred:unit_id\", ";
                if let Some(start) = php.find(marker) {
                    let rest = &php[start + marker.len()..];
                    let value = rest.split(");").next().unwrap_or_default();
                    state.unit_id = Some(value.trim_matches('"').to_string());
                }
                String::new()
            }
            WpOperation::QueryStatus => {
                let plugins: serde_json::Map<String, Value> =
                    state.plugins.iter().map(|p| (p.clone(), json!({}))).collect();
                let mut status = json!({
                    "plugins": plugins,
                    "languages": state.languages,
                });
                if let Some(unit) = &state.unit_id {
                    status["unitid"] = json!(unit);
                }
                status.to_string()
            }
            _ => String::new(),
        };
        Ok(ExecOutput { stdout })
    }
}

/// Marks every new object of `kind` as successfully provisioned.
async fn fake_mariadb_operator(store: InMemoryStore, kind: ApiKind, condition: &'static str, message: &'static str) {
    let mut events = store.watch(&kind, None);
    while let Some(Ok(event)) = events.next().await {
        if event.event_type == EventType::Added {
            let _ = store
                .patch_status(
                    event.object.object_ref(),
                    &json!({"conditions": [{"type": condition, "status": "True", "message": message}]}),
                )
                .await;
        }
    }
}

fn shard(name: &str) -> ManagedObject {
    ManagedObject::from_definition(json!({
        "apiVersion": MARIADB_API,
        "kind": "MariaDB",
        "metadata": {"name": name, "namespace": NS, "labels": {"wpAutoallocate": "true"}},
        "spec": {"replicas": 1},
    }))
    .unwrap()
}

fn kind(k: &str) -> ApiKind {
    ApiKind::new(MARIADB_API, k)
}

struct Harness {
    store: InMemoryStore,
    placer: Arc<DatabasePlacer>,
    wordpress: Arc<FakeWordpress>,
    reconciler: Arc<SiteReconciler>,
}

impl Harness {
    async fn new(with_operator: bool, wordpress: FakeWordpress) -> Self {
        let store = InMemoryStore::new();
        let shared: Arc<dyn ResourceStore> = Arc::new(store.clone());
        let placer = Arc::new(DatabasePlacer::new(Arc::clone(&shared)));
        for name in ["mariadb-01", "mariadb-02"] {
            let created = store.create(&shard(name)).await.unwrap();
            placer.apply(&WatchEvent::new(EventType::Added, created));
        }
        if with_operator {
            for k in ["Database", "User", "Grant"] {
                tokio::spawn(fake_mariadb_operator(store.clone(), kind(k), "Ready", "Created"));
            }
            tokio::spawn(fake_mariadb_operator(store.clone(), kind("Restore"), "Complete", "Success"));
        }
        let routes = Arc::new(RouteResolver::new(Arc::clone(&shared)));
        let wordpress = Arc::new(wordpress);
        let executor: Arc<dyn WpExecutor> = wordpress.clone();
        let reconciler = Arc::new(SiteReconciler::new(shared, Arc::clone(&placer), routes, executor));
        Self {
            store,
            placer,
            wordpress,
            reconciler,
        }
    }

    async fn add_site(&self, name: &str, spec: Value) -> ManagedObject {
        let site = ManagedObject::from_definition(json!({
            "apiVersion": "wordpress.epfl.ch/v2",
            "kind": "WordpressSite",
            "metadata": {"name": name, "namespace": NS},
            "spec": spec,
        }))
        .unwrap();
        self.store.create(&site).await.unwrap()
    }

    async fn current(&self, site: &ManagedObject) -> ManagedObject {
        self.store.get(site.object_ref()).await.unwrap()
    }

    async fn exists(&self, kind: ApiKind, name: &str) -> bool {
        self.store.exists(&ObjectRef::namespaced(kind, NS, name)).await.unwrap()
    }
}

fn blog_spec() -> Value {
    json!({
        "hostname": "www.example.com",
        "path": "/blog",
        "owner": {"epfl": {"unitId": 13030}},
        "wordpress": {
            "title": "Blog",
            "tagline": "News",
            "plugins": {
                "polylang": {"polylang": {"languages": [
                    {"name": "English", "slug": "en", "locale": "en_US", "rtl": 0, "term_group": 0, "flag": "us"},
                    {"name": "Français", "slug": "fr", "locale": "fr_FR", "rtl": 0, "term_group": 1, "flag": "fr"},
                ]}},
                "epfl-menus": {"wp_options": [{"name": "epfl_menus_enabled", "value": "1"}]},
            },
        },
    })
}

#[tokio::test(start_paused = true)]
async fn create_provisions_everything_and_marks_site_created() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    let site = h.add_site("blog", blog_spec()).await;

    h.reconciler.create_site(&site).await.unwrap();

    assert!(h.exists(kind("Database"), "wp-db-blog").await);
    assert!(h.exists(kind("User"), "wp-db-user-blog").await);
    assert!(h.exists(kind("Grant"), "wp-db-grant-blog").await);
    assert!(h.exists(ApiKind::new("v1", "Secret"), "wp-db-password-blog").await);
    assert!(h.exists(ApiKind::new("networking.k8s.io/v1", "Ingress"), "blog").await);
    assert!(h.exists(ApiKind::new("route.openshift.io/v1", "Route"), "wp-route-blog").await);
    assert_eq!(h.placer.shard_of(NS, "wp-db-blog").as_deref(), Some("mariadb-01"));

    let ops = h.wordpress.ops_for("blog");
    match &ops[0] {
        WpOperation::Install(params) => {
            assert_eq!(params.db_host, "mariadb-01");
            assert_eq!(params.db_user, "wp-db-user-blog");
            assert_eq!(params.unit_id.as_deref(), Some("13030"));
            assert_eq!(params.db_password.len(), 43);
        }
        other => panic!("expected install first, got {other:?}"),
    }
    assert!(ops.contains(&WpOperation::ActivatePlugins(vec!["epfl-menus".into(), "polylang".into()])));
    assert!(ops.contains(&WpOperation::DeleteTransient("pll_activation_redirect".into())));
    assert_eq!(
        ops.iter().filter(|op| matches!(op, WpOperation::AddLanguage(_))).count(),
        2
    );

    let status = h.current(&site).await;
    let wp = status.field(&["status", "wordpresssite"]).unwrap();
    assert_eq!(wp["state"], json!("created"));
    assert_eq!(wp["url"], json!("https://www.example.com/blog"));
    assert_eq!(wp["unitid"], json!("13030"));
    assert!(wp["plugins"].get("polylang").is_some());
    assert!(wp.get("lastCronJobRuntime").is_some());
}

#[tokio::test(start_paused = true)]
async fn secret_password_reaches_the_ingress() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    let site = h.add_site("blog", json!({"hostname": "www.example.com", "path": "/blog"})).await;
    h.reconciler.create_site(&site).await.unwrap();

    let secret = h
        .store
        .get(&ObjectRef::namespaced(ApiKind::new("v1", "Secret"), NS, "wp-db-password-blog"))
        .await
        .unwrap();
    let install_password = match &h.wordpress.ops_for("blog")[0] {
        WpOperation::Install(p) => p.db_password.clone(),
        other => panic!("unexpected {other:?}"),
    };
    assert!(secret.field(&["data", "password"]).is_some());

    let ingress = h
        .store
        .get(&ObjectRef::namespaced(ApiKind::new("networking.k8s.io/v1", "Ingress"), NS, "blog"))
        .await
        .unwrap();
    let annotations = ingress.annotations();
    let snippet = &annotations["nginx.ingress.kubernetes.io/configuration-snippet"];
    assert!(snippet.contains(&format!("WP_DB_PASSWORD     {install_password};")));
}

#[tokio::test]
async fn reconcile_activates_and_deactivates_only_the_difference() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    h.wordpress.seed_plugins("site", &["B", "C"]);
    let site = h
        .add_site(
            "site",
            json!({"hostname": "www.example.com", "wordpress": {"plugins": {"A": {}, "B": {}}}}),
        )
        .await;
    let site = h
        .store
        .patch_status(
            site.object_ref(),
            &json!({"wordpresssite": {"state": "created", "plugins": {"B": {}, "C": {}}}}),
        )
        .await
        .unwrap();

    h.reconciler.reconcile_site(&site).await.unwrap();

    let ops = h.wordpress.ops_for("site");
    assert!(ops.contains(&WpOperation::ActivatePlugins(vec!["A".into()])));
    assert!(ops.contains(&WpOperation::DeactivatePlugins(vec!["C".into()])));
    for op in &ops {
        if let WpOperation::ActivatePlugins(names) | WpOperation::DeactivatePlugins(names) = op {
            assert!(!names.contains(&"B".to_string()));
        }
    }

    let status = h.current(&site).await;
    let plugins = status.field(&["status", "wordpresssite", "plugins"]).unwrap();
    assert_eq!(plugins, &json!({"A": {}, "B": {}}));
    assert_eq!(status.field(&["status", "wordpresssite", "state"]), Some(&json!("created")));
}

#[tokio::test]
async fn languages_follow_locale_changes() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    let site = h
        .add_site(
            "site",
            json!({"hostname": "h.example.com", "wordpress": {"plugins": {"polylang": {"polylang": {"languages": [
                {"name": "Deutsch", "slug": "de", "locale": "de_DE"},
            ]}}}}}),
        )
        .await;
    let site = h
        .store
        .patch_status(
            site.object_ref(),
            &json!({"wordpresssite": {
                "state": "created",
                "plugins": {"polylang": {}},
                "languages": [{"name": "Français", "slug": "fr", "locale": "fr_FR"}],
            }}),
        )
        .await
        .unwrap();

    h.reconciler.reconcile_site(&site).await.unwrap();

    let ops = h.wordpress.ops_for("site");
    let delete = ops.iter().position(|op| op == &WpOperation::DeleteLanguage("fr".into())).unwrap();
    let add = ops
        .iter()
        .position(|op| matches!(op, WpOperation::AddLanguage(l) if l.locale == "de_DE"))
        .unwrap();
    assert!(delete < add);
    assert!(!ops.iter().any(|op| matches!(op, WpOperation::ActivatePlugins(_))));
}

#[tokio::test(start_paused = true)]
async fn stuck_database_is_fatal_after_bounded_polling() {
    let h = Harness::new(false, FakeWordpress::default()).await;
    let site = h.add_site("blog", json!({"hostname": "www.example.com"})).await;
    let before = h.store.get_calls();

    let err = h.reconciler.create_site(&site).await.unwrap_err();

    assert!(matches!(err, SiteError::NotReady { .. }), "{err}");
    assert!(err.is_fatal());
    assert_eq!(h.store.get_calls() - before, ReadinessPolicy::default().attempts as usize);
    assert!(!h.exists(ApiKind::new("v1", "Secret"), "wp-db-password-blog").await);
    assert!(h.wordpress.ops_for("blog").is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_install_leaves_status_unpatched() {
    let h = Harness::new(
        true,
        FakeWordpress {
            broken_install: true,
            ..FakeWordpress::default()
        },
    )
    .await;
    let site = h.add_site("blog", json!({"hostname": "www.example.com"})).await;

    let err = h.reconciler.create_site(&site).await.unwrap_err();
    assert!(matches!(err, SiteError::Executor(_)));
    assert!(h.current(&site).await.status().is_none());
    assert!(!h.exists(ApiKind::new("networking.k8s.io/v1", "Ingress"), "blog").await);
}

#[tokio::test(start_paused = true)]
async fn restore_runs_before_install() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    let root = ManagedObject::from_definition(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": "mariadb-restore-root", "namespace": NS},
        "stringData": {"root-password": "r00t"},
    }))
    .unwrap();
    h.store.create(&root).await.unwrap();
    let mut spec = json!({"hostname": "new.example.com", "path": "/"});
    spec["restore"] = json!({
        "wpDbBackupRef": {"mariaDBLookup": {
            "mariadbNameSource": "mariadb-min",
            "databaseNameSource": "wp-db-old",
            "mariadbSecretName": "mariadb-restore-root",
        }},
        "s3": {"bucket": "backups", "endpoint": "s3.example.com", "secretKeyName": "s3-creds"},
        "urlSource": "https://old.example.com/",
    });
    let site = h.add_site("moved", spec).await;

    h.reconciler.create_site(&site).await.unwrap();

    let restores = h.store.list(&kind("Restore"), Some(NS)).await.unwrap();
    assert_eq!(restores.len(), 1);
    assert!(h.exists(kind("Database"), "wp-db-old").await);

    let ops = h.wordpress.ops_for("moved");
    match (&ops[0], &ops[1]) {
        (WpOperation::Import(import), WpOperation::Install(_)) => {
            assert_eq!(import.source_database, "wp-db-old");
            assert_eq!(import.source_password, "r00t");
            assert_eq!(import.target_database, "wp-db-moved");
            assert_eq!(import.target_url, "https://new.example.com/");
        }
        other => panic!("expected import then install, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn delete_removes_dependents_and_tolerates_missing_ones() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    let site = h.add_site("blog", json!({"hostname": "www.example.com", "path": "/blog"})).await;
    h.reconciler.create_site(&site).await.unwrap();

    h.reconciler.delete_site(&site).await.unwrap();
    for (kind, name) in [
        (kind("Database"), "wp-db-blog"),
        (kind("User"), "wp-db-user-blog"),
        (kind("Grant"), "wp-db-grant-blog"),
        (ApiKind::new("v1", "Secret"), "wp-db-password-blog"),
        (ApiKind::new("networking.k8s.io/v1", "Ingress"), "blog"),
        (ApiKind::new("route.openshift.io/v1", "Route"), "wp-route-blog"),
    ] {
        assert!(!h.exists(kind, name).await, "{name} still exists");
    }

    // Second delete finds nothing and still succeeds.
    h.reconciler.delete_site(&site).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn controller_skips_unchanged_sites_and_pins_fatal_failures() {
    let h = Harness::new(false, FakeWordpress::default()).await;
    let controller = SiteController::new(Arc::new(h.store.clone()), Arc::clone(&h.reconciler));
    let site = h.add_site("blog", json!({"hostname": "www.example.com"})).await;
    let event = WatchEvent::new(EventType::Added, site.clone());

    let first = controller.handle(event.clone()).await.unwrap();
    assert!(first.unwrap_err().is_fatal());
    // Same fingerprint, fatal outcome: not retried.
    assert!(controller.handle(event).await.is_none());

    let changed = site
        .map_definition(|d| d["spec"]["path"] = json!("/other"))
        .unwrap();
    assert!(controller.plan(&WatchEvent::new(EventType::Modified, changed)).is_some());
}

#[tokio::test(start_paused = true)]
async fn controller_retries_failed_install_on_resync() {
    let h = Harness::new(
        true,
        FakeWordpress {
            broken_install: true,
            ..FakeWordpress::default()
        },
    )
    .await;
    let controller = SiteController::new(Arc::new(h.store.clone()), Arc::clone(&h.reconciler));
    let site = h.add_site("blog", json!({"hostname": "www.example.com"})).await;

    let first = controller.handle(WatchEvent::new(EventType::Added, site.clone())).await.unwrap();
    assert!(matches!(first, Err(SiteError::Executor(_))));

    // Resync replays the unchanged site; the install runs again.
    let current = h.current(&site).await;
    let second = controller.handle(WatchEvent::new(EventType::Modified, current)).await;
    assert!(matches!(second, Some(Err(SiteError::Executor(_)))));
    let installs = h
        .wordpress
        .ops_for("blog")
        .iter()
        .filter(|op| matches!(op, WpOperation::Install(_)))
        .count();
    assert_eq!(installs, 2);
}

#[tokio::test(start_paused = true)]
async fn controller_creates_then_reconciles() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    let controller = SiteController::new(Arc::new(h.store.clone()), Arc::clone(&h.reconciler));
    let site = h
        .add_site("blog", json!({"hostname": "www.example.com", "wordpress": {"plugins": {"A": {}}}}))
        .await;

    controller
        .handle(WatchEvent::new(EventType::Added, site.clone()))
        .await
        .unwrap()
        .unwrap();
    let installs = |ops: &[WpOperation]| ops.iter().filter(|op| matches!(op, WpOperation::Install(_))).count();
    assert_eq!(installs(&h.wordpress.ops_for("blog")), 1);

    // The spec changes after creation: reconcile, no second install.
    let updated = h
        .current(&site)
        .await
        .map_definition(|d| d["spec"]["wordpress"]["plugins"] = json!({"A": {}, "B": {}}))
        .unwrap();
    let updated = h.store.replace(&updated).await.unwrap();
    controller
        .handle(WatchEvent::new(EventType::Modified, updated))
        .await
        .unwrap()
        .unwrap();
    let ops = h.wordpress.ops_for("blog");
    assert_eq!(installs(&ops), 1);
    assert!(ops.contains(&WpOperation::ActivatePlugins(vec!["B".into()])));

    let deleted = h.current(&site).await;
    controller
        .handle(WatchEvent::new(EventType::Deleted, deleted))
        .await
        .unwrap()
        .unwrap();
    assert!(!h.exists(kind("Database"), "wp-db-blog").await);
}

#[tokio::test(start_paused = true)]
async fn controller_run_handles_watch_events() {
    let h = Harness::new(true, FakeWordpress::default()).await;
    let controller = Arc::new(SiteController::new(Arc::new(h.store.clone()), Arc::clone(&h.reconciler)));
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&controller).run(Some(NS.to_string()), cancel.clone()));

    let site = h.add_site("blog", json!({"hostname": "www.example.com"})).await;
    for _ in 0..100 {
        let current = h.current(&site).await;
        if current.field(&["status", "wordpresssite", "state"]) == Some(&json!("created")) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(
        h.current(&site).await.field(&["status", "wordpresssite", "state"]),
        Some(&json!("created"))
    );

    cancel.cancel();
    task.await.unwrap();
}
