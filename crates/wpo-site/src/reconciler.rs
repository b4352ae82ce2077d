//! Site reconciler: from a site object to a running WordPress.
//!
//! # Create path
//!
//! ```text
//! place database → wait ready
//!   → password secret → user (wait) → grant (wait) → read password back
//!   → [restore: restore database, Restore (wait), import]
//!   → install → ingress → reconcile pass → route → status "created"
//! ```
//!
//! Every step is create-or-accept-existing, so a failed pass can be
//! repeated from the start. Any error aborts the pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use wpo_placement::DatabasePlacer;
use wpo_routing::{RouteOutcome, RouteRequest, RouteResolver};
use wpo_store::{ManagedObject, ObjectRef, ResourceStore, replacement_patch};

use crate::error::{ExecError, SiteResult};
use crate::executor::{ImportParams, InstallParams, SiteHandle, WpExecutor, WpOperation};
use crate::model::{CREATED_STATE, SiteDesiredState, SiteObservedState, plain_text};
use crate::plugins::{PluginContext, PluginReconciler, read_secret_key};
use crate::readiness::{ReadinessPolicy, wait_until_ready};
use crate::resources::{self, SiteConfig};
use crate::work::SiteWork;

/// Plugin set changes for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginChanges {
    pub activate: BTreeSet<String>,
    pub deactivate: BTreeSet<String>,
}

impl PluginChanges {
    pub fn between(desired: &BTreeSet<String>, observed: &BTreeSet<String>) -> Self {
        Self {
            activate: desired.difference(observed).cloned().collect(),
            deactivate: observed.difference(desired).cloned().collect(),
        }
    }
}

/// Drives sites through creation, convergence and deletion.
pub struct SiteReconciler {
    store: Arc<dyn ResourceStore>,
    placer: Arc<DatabasePlacer>,
    routes: Arc<RouteResolver>,
    executor: Arc<dyn WpExecutor>,
    config: SiteConfig,
    readiness: ReadinessPolicy,
    restore_readiness: ReadinessPolicy,
}

impl SiteReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        placer: Arc<DatabasePlacer>,
        routes: Arc<RouteResolver>,
        executor: Arc<dyn WpExecutor>,
    ) -> Self {
        Self {
            store,
            placer,
            routes,
            executor,
            config: SiteConfig::default(),
            readiness: ReadinessPolicy::default(),
            restore_readiness: ReadinessPolicy::restore(),
        }
    }

    pub fn with_config(mut self, config: SiteConfig) -> Self {
        self.config = config;
        self
    }

    /// Override readiness timing for both dependent and restore objects.
    pub fn with_readiness(mut self, readiness: ReadinessPolicy, restore: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self.restore_readiness = restore;
        self
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    fn database_ref(&self, site: &SiteDesiredState, database: &str) -> ObjectRef {
        ObjectRef::namespaced(self.placer.config().database_kind.clone(), &site.namespace, database)
    }

    async fn create_or_accept(&self, object: &ManagedObject) -> SiteResult<bool> {
        match self.store.create(object).await {
            Ok(_) => {
                info!(object = %object, "created");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(object = %object, "already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Provision everything a new site needs, then mark it created.
    pub async fn create_site(&self, site_object: &ManagedObject) -> SiteResult<()> {
        let site = SiteDesiredState::from_site(site_object)?;
        info!(namespace = %site.namespace, site = %site.name, url = %site.url(), "creating site");

        let placement = self
            .placer
            .place_and_create(&site.namespace, &site.name, &site.owner)
            .await?;
        let shard = placement.shard.as_str();
        let database = placement.database.as_str();
        wait_until_ready(self.store.as_ref(), &self.database_ref(&site, database), &self.readiness).await?;

        let password = resources::generate_password()?;
        self.create_or_accept(&resources::secret_object(&self.config, &site, &password)?)
            .await?;

        self.create_or_accept(&resources::user_object(&self.config, &site, shard)?)
            .await?;
        wait_until_ready(self.store.as_ref(), &self.config.user_ref(&site), &self.readiness).await?;

        self.create_or_accept(&resources::grant_object(&self.config, &site, shard, database)?)
            .await?;
        wait_until_ready(self.store.as_ref(), &self.config.grant_ref(&site), &self.readiness).await?;

        // The secret may predate this pass; its stored password wins.
        let password = read_secret_key(
            self.store.as_ref(),
            &site.namespace,
            &self.config.secret_name(&site.name),
            "password",
        )
        .await?;

        let handle = SiteHandle::new(&site.namespace, &site.name);
        if site.restore.is_some() {
            self.restore_site(&site, &handle, shard, database).await?;
        }
        self.install(&site, &handle, shard, database, &password).await?;

        self.create_or_accept(&resources::ingress_object(&self.config, &site, shard, database, &password)?)
            .await?;

        self.reconcile_site(site_object).await?;

        let outcome = self
            .routes
            .create_route(&RouteRequest {
                namespace: site.namespace.clone(),
                site_name: site.name.clone(),
                host: site.hostname.clone(),
                path: site.path.clone(),
                service: self.config.service_name.clone(),
                owner: site.owner.clone(),
            })
            .await?;
        if let RouteOutcome::Covered { parent } = &outcome {
            info!(site = %site.name, %parent, "served by parent route");
        }

        self.store
            .patch_status(
                site_object.object_ref(),
                &json!({"wordpresssite": {
                    "state": CREATED_STATE,
                    "url": site.url(),
                    "lastUpdate": chrono::Utc::now().to_rfc3339(),
                }}),
            )
            .await?;
        info!(namespace = %site.namespace, site = %site.name, shard, "site created");
        Ok(())
    }

    async fn install(
        &self,
        site: &SiteDesiredState,
        handle: &SiteHandle,
        shard: &str,
        database: &str,
        password: &str,
    ) -> SiteResult<()> {
        let params = InstallParams {
            hostname: site.hostname.clone(),
            path: site.path.clone(),
            title: site.title.clone(),
            tagline: site.tagline.clone(),
            unit_id: site.unit_id.as_ref().map(plain_text),
            db_host: shard.to_string(),
            db_name: database.to_string(),
            db_user: self.config.user_name(&site.name),
            db_password: password.to_string(),
        };
        info!(site = %handle, "installing WordPress");
        self.executor.run(handle, &WpOperation::Install(params)).await?;
        Ok(())
    }

    /// Restore the backup onto the restore shard, then copy it into the
    /// site's own database.
    async fn restore_site(
        &self,
        site: &SiteDesiredState,
        handle: &SiteHandle,
        shard: &str,
        database: &str,
    ) -> SiteResult<()> {
        let Some(restore) = site.restore.as_ref() else {
            return Ok(());
        };
        let lookup = &restore.wp_db_backup_ref.mariadb_lookup;
        info!(site = %handle, source = %lookup.database_name_source, from = %lookup.mariadb_name_source, "restoring site");

        let source_db = resources::restore_database_object(&self.config, site, restore)?;
        self.create_or_accept(&source_db).await?;
        wait_until_ready(self.store.as_ref(), source_db.object_ref(), &self.readiness).await?;

        let restore_object = resources::restore_object(&self.config, site, restore, chrono::Utc::now())?;
        self.create_or_accept(&restore_object).await?;
        wait_until_ready(self.store.as_ref(), restore_object.object_ref(), &self.restore_readiness).await?;

        let root_password = read_secret_key(
            self.store.as_ref(),
            &site.namespace,
            &lookup.mariadb_secret_name,
            "root-password",
        )
        .await?;
        let params = ImportParams {
            source_host: self.config.restore_shard.clone(),
            source_database: lookup.database_name_source.clone(),
            source_password: root_password,
            target_host: shard.to_string(),
            target_database: database.to_string(),
            url_source: restore.url_source.clone(),
            target_url: site.url(),
        };
        self.executor.run(handle, &WpOperation::Import(params)).await?;
        Ok(())
    }

    /// Converge plugins, languages and unit id, then record what the site
    /// now reports in its status.
    pub async fn reconcile_site(&self, site_object: &ManagedObject) -> SiteResult<()> {
        let desired = SiteDesiredState::from_site(site_object)?;
        let observed = SiteObservedState::from_site(site_object);
        let handle = SiteHandle::new(&desired.namespace, &desired.name);
        info!(site = %handle, "reconciling site");
        let ctx = PluginContext {
            store: self.store.as_ref(),
            namespace: &desired.namespace,
            redirection_sql: self.config.redirection_sql.clone(),
        };
        let mut work = SiteWork::new(self.executor.as_ref(), handle.clone());

        let changes = PluginChanges::between(&desired.plugin_names(), &observed.plugins);
        debug!(site = %handle, activate = ?changes.activate, deactivate = ?changes.deactivate, "plugin changes");
        for name in &changes.activate {
            PluginReconciler::for_plugin(name).activate(name, &mut work);
        }
        for name in &changes.activate {
            if let Some(decl) = desired.plugins.get(name) {
                PluginReconciler::for_plugin(name)
                    .configure(name, decl, &ctx, &mut work)
                    .await?;
            }
        }
        for name in &changes.deactivate {
            PluginReconciler::for_plugin(name).deactivate(name, &mut work);
        }
        work.flush().await?;

        PluginReconciler::reconcile_languages(&desired.languages, &observed.languages, &mut work).await?;
        work.flush().await?;

        if let Some(unit_id) = &desired.unit_id {
            if observed.unit_id.as_deref() != Some(plain_text(unit_id).as_str()) {
                work.set_option(&self.config.unit_id_option, unit_id);
                work.flush().await?;
            }
        }

        self.record_status(site_object, &handle).await
    }

    async fn record_status(&self, site_object: &ManagedObject, handle: &SiteHandle) -> SiteResult<()> {
        let output = self.executor.run(handle, &WpOperation::QueryStatus).await?;
        let bad_output = |message: String| ExecError::BadOutput {
            operation: WpOperation::QueryStatus.name().to_string(),
            message,
        };
        let text = output.stdout.trim();
        let reported = if text.is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => map,
                // PHP encodes an empty array as `[]`.
                Ok(Value::Array(items)) if items.is_empty() => Map::new(),
                Ok(other) => return Err(bad_output(format!("expected an object, got {other}")).into()),
                Err(e) => return Err(bad_output(e.to_string()).into()),
            }
        };

        let current = site_object
            .field(&["status", "wordpresssite"])
            .cloned()
            .unwrap_or_else(|| json!({}));
        let mut desired = Map::new();
        // Bookkeeping written at creation survives every pass.
        for key in ["state", "url", "lastUpdate"] {
            if let Some(value) = current.get(key) {
                desired.insert(key.to_string(), value.clone());
            }
        }
        desired.insert("lastCronJobRuntime".into(), Value::String(chrono::Utc::now().to_rfc3339()));
        desired.extend(reported);
        let patch = replacement_patch(&current, &Value::Object(desired));
        self.store
            .patch_status(site_object.object_ref(), &json!({"wordpresssite": patch}))
            .await?;
        debug!(site = %handle, "status recorded");
        Ok(())
    }

    /// Delete a site's dependents, last created first. Missing ones are
    /// skipped.
    pub async fn delete_site(&self, site_object: &ManagedObject) -> SiteResult<()> {
        let Some(namespace) = site_object.namespace() else {
            return Ok(());
        };
        let name = site_object.name();
        info!(%namespace, site = %name, "deleting site");
        let cfg = &self.config;
        let placer = self.placer.config();
        let targets = [
            ObjectRef::namespaced(self.routes.config().route_kind.clone(), namespace, &self.routes.route_name(name)),
            ObjectRef::namespaced(cfg.ingress_kind(), namespace, name),
            ObjectRef::namespaced(cfg.grant_kind(), namespace, &cfg.grant_name(name)),
            ObjectRef::namespaced(cfg.user_kind(), namespace, &cfg.user_name(name)),
            ObjectRef::namespaced(cfg.secret_kind(), namespace, &cfg.secret_name(name)),
            ObjectRef::namespaced(placer.database_kind.clone(), namespace, &self.placer.database_name(name)),
        ];
        for target in &targets {
            if self.store.delete_if_exists(target).await? {
                info!(object = %target, "deleted");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plugin_changes_are_set_differences() {
        let changes = PluginChanges::between(&set(&["A", "B"]), &set(&["B", "C"]));
        assert_eq!(changes.activate, set(&["A"]));
        assert_eq!(changes.deactivate, set(&["C"]));
    }

    #[test]
    fn unchanged_plugins_produce_no_changes() {
        let changes = PluginChanges::between(&set(&["A"]), &set(&["A"]));
        assert_eq!(changes, PluginChanges::default());
    }
}
