//! Dependent objects of a site, rendered from its desired state.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::json;

use wpo_store::{ApiKind, ManagedObject, ObjectRef};

use crate::error::{SiteError, SiteResult};
use crate::model::{RestoreSource, SiteDesiredState};

/// Naming and wiring of the objects a site owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub secret_prefix: String,
    pub user_prefix: String,
    pub grant_prefix: String,
    pub mariadb_api_version: String,
    pub ingress_class: String,
    /// Service fronting every WordPress of a namespace.
    pub service_name: String,
    pub service_port: u16,
    /// MariaDB instance backups are restored onto before import.
    pub restore_shard: String,
    pub unit_id_option: String,
    pub redirection_sql: PathBuf,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            secret_prefix: "wp-db-password-".to_string(),
            user_prefix: "wp-db-user-".to_string(),
            grant_prefix: "wp-db-grant-".to_string(),
            mariadb_api_version: "k8s.mariadb.com/v1alpha1".to_string(),
            ingress_class: "wordpress".to_string(),
            service_name: "wp-nginx".to_string(),
            service_port: 80,
            restore_shard: "mariadb-restore".to_string(),
            unit_id_option: "plugin:epfl_accred:unit_id".to_string(),
            redirection_sql: "redirection.sql".into(),
        }
    }
}

impl SiteConfig {
    pub fn secret_kind(&self) -> ApiKind {
        ApiKind::new("v1", "Secret")
    }

    pub fn user_kind(&self) -> ApiKind {
        ApiKind::new(&self.mariadb_api_version, "User")
    }

    pub fn grant_kind(&self) -> ApiKind {
        ApiKind::new(&self.mariadb_api_version, "Grant")
    }

    pub fn restore_kind(&self) -> ApiKind {
        ApiKind::new(&self.mariadb_api_version, "Restore")
    }

    pub fn ingress_kind(&self) -> ApiKind {
        ApiKind::new("networking.k8s.io/v1", "Ingress")
    }

    pub fn secret_name(&self, site: &str) -> String {
        format!("{}{site}", self.secret_prefix)
    }

    pub fn user_name(&self, site: &str) -> String {
        format!("{}{site}", self.user_prefix)
    }

    pub fn grant_name(&self, site: &str) -> String {
        format!("{}{site}", self.grant_prefix)
    }

    pub fn secret_ref(&self, site: &SiteDesiredState) -> ObjectRef {
        ObjectRef::namespaced(self.secret_kind(), &site.namespace, &self.secret_name(&site.name))
    }

    pub fn user_ref(&self, site: &SiteDesiredState) -> ObjectRef {
        ObjectRef::namespaced(self.user_kind(), &site.namespace, &self.user_name(&site.name))
    }

    pub fn grant_ref(&self, site: &SiteDesiredState) -> ObjectRef {
        ObjectRef::namespaced(self.grant_kind(), &site.namespace, &self.grant_name(&site.name))
    }

    pub fn ingress_ref(&self, site: &SiteDesiredState) -> ObjectRef {
        ObjectRef::namespaced(self.ingress_kind(), &site.namespace, &site.name)
    }
}

/// A URL-safe random password from 32 bytes of OS entropy.
pub fn generate_password() -> SiteResult<String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| SiteError::Entropy(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub fn secret_object(cfg: &SiteConfig, site: &SiteDesiredState, password: &str) -> SiteResult<ManagedObject> {
    Ok(ManagedObject::from_definition(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": cfg.secret_name(&site.name),
            "namespace": site.namespace,
            "ownerReferences": [site.owner],
        },
        "stringData": {"password": password},
    }))?)
}

pub fn user_object(cfg: &SiteConfig, site: &SiteDesiredState, shard: &str) -> SiteResult<ManagedObject> {
    Ok(ManagedObject::from_definition(json!({
        "apiVersion": cfg.mariadb_api_version,
        "kind": "User",
        "metadata": {
            "name": cfg.user_name(&site.name),
            "namespace": site.namespace,
            "ownerReferences": [site.owner],
        },
        "spec": {
            "mariaDbRef": {"name": shard},
            "passwordSecretKeyRef": {"name": cfg.secret_name(&site.name), "key": "password"},
            "host": "%",
            "cleanupPolicy": "Delete",
        },
    }))?)
}

pub fn grant_object(
    cfg: &SiteConfig,
    site: &SiteDesiredState,
    shard: &str,
    database: &str,
) -> SiteResult<ManagedObject> {
    Ok(ManagedObject::from_definition(json!({
        "apiVersion": cfg.mariadb_api_version,
        "kind": "Grant",
        "metadata": {
            "name": cfg.grant_name(&site.name),
            "namespace": site.namespace,
            "ownerReferences": [site.owner],
        },
        "spec": {
            "mariaDbRef": {"name": shard},
            "privileges": ["ALL PRIVILEGES"],
            "database": database,
            "table": "*",
            "username": cfg.user_name(&site.name),
            "grantOption": false,
            "host": "%",
        },
    }))?)
}

/// nginx `fastcgi_param` lines handing the site its database and paths.
pub fn nginx_snippet(site: &SiteDesiredState, shard: &str, database: &str, user: &str, password: &str) -> String {
    let protection = site
        .downloads_protection_script
        .as_deref()
        .map(|script| format!("fastcgi_param DOWNLOADS_PROTECTION_SCRIPT    {script};"))
        .unwrap_or_default();
    format!(
        "
fastcgi_param WP_DEBUG           {debug};
fastcgi_param WP_ROOT_URI        {root};
fastcgi_param WP_UPLOADS_DIRNAME {uploads};
fastcgi_param WP_DB_HOST         {shard};
fastcgi_param WP_DB_NAME         {database};
fastcgi_param WP_DB_USER         {user};
fastcgi_param WP_DB_PASSWORD     {password};
{protection}
",
        debug = site.debug,
        root = site.root_uri(),
        uploads = site.name,
    )
}

pub fn ingress_object(
    cfg: &SiteConfig,
    site: &SiteDesiredState,
    shard: &str,
    database: &str,
    password: &str,
) -> SiteResult<ManagedObject> {
    let user = cfg.user_name(&site.name);
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        "nginx.ingress.kubernetes.io/configuration-snippet".into(),
        nginx_snippet(site, shard, database, &user, password).into(),
    );
    if site.downloads_protection_script.is_none() {
        annotations.insert("wordpress.epfl.ch/nginx-uploads-dirname".into(), site.name.clone().into());
    }
    Ok(ManagedObject::from_definition(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": site.name,
            "namespace": site.namespace,
            "ownerReferences": [site.owner],
            "annotations": annotations,
        },
        "spec": {
            "ingressClassName": cfg.ingress_class,
            "rules": [{
                "host": site.hostname,
                "http": {"paths": [{
                    "path": site.path,
                    "pathType": "Prefix",
                    "backend": {"service": {
                        "name": cfg.service_name,
                        "port": {"number": cfg.service_port},
                    }},
                }]},
            }],
        },
    }))?)
}

/// Database on the restore shard that a backup is restored into.
pub fn restore_database_object(
    cfg: &SiteConfig,
    site: &SiteDesiredState,
    restore: &RestoreSource,
) -> SiteResult<ManagedObject> {
    let lookup = &restore.wp_db_backup_ref.mariadb_lookup;
    Ok(ManagedObject::from_definition(json!({
        "apiVersion": cfg.mariadb_api_version,
        "kind": "Database",
        "metadata": {
            "name": lookup.database_name_source,
            "namespace": site.namespace,
        },
        "spec": {
            "mariaDbRef": {"name": cfg.restore_shard},
            "characterSet": "utf8mb4",
            "collate": "utf8mb4_unicode_ci",
        },
    }))?)
}

/// MariaDB `Restore` pulling the source database from S3 onto the restore
/// shard. `now` is used as the recovery time unless the descriptor names one.
pub fn restore_object(
    cfg: &SiteConfig,
    site: &SiteDesiredState,
    restore: &RestoreSource,
    now: chrono::DateTime<chrono::Utc>,
) -> SiteResult<ManagedObject> {
    let lookup = &restore.wp_db_backup_ref.mariadb_lookup;
    let source = &lookup.database_name_source;
    let tail: String = {
        let chars: Vec<char> = source.chars().collect();
        chars[chars.len().saturating_sub(50)..].iter().collect()
    };
    let recovery_time = restore
        .target_recovery_time
        .clone()
        .unwrap_or_else(|| now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
    let s3_secret = &restore.s3.secret_key_name;
    Ok(ManagedObject::from_definition(json!({
        "apiVersion": cfg.mariadb_api_version,
        "kind": "Restore",
        "metadata": {
            "name": format!("m-{tail}-{}", now.timestamp()),
            "namespace": site.namespace,
            "ownerReferences": [site.owner],
        },
        "spec": {
            "mariaDbRef": {"name": cfg.restore_shard},
            "resources": {"requests": {"cpu": "100m", "memory": "256Mi"}},
            "s3": {
                "bucket": restore.s3.bucket,
                "prefix": format!("MariaDB-{}", lookup.mariadb_name_source),
                "endpoint": restore.s3.endpoint,
                "accessKeyIdSecretKeyRef": {"name": s3_secret, "key": "keyId"},
                "secretAccessKeySecretKeyRef": {"name": s3_secret, "key": "accessSecret"},
                "tls": {"enabled": true},
            },
            "targetRecoveryTime": recovery_time,
            "args": ["--verbose", format!("--database={source}")],
        },
    }))?)
}
