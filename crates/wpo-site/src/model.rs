//! Site desired and observed state, parsed from a site object.
//!
//! Both are snapshots: they are taken once at the start of a pass and
//! never refreshed while it runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use wpo_store::{ApiKind, ManagedObject, OwnerReference};

use crate::error::{SiteError, SiteResult};

/// Kind of the site custom resource.
pub fn site_kind() -> ApiKind {
    ApiKind::new("wordpress.epfl.ch/v2", "WordpressSite")
}

/// A Polylang language entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Language {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub rtl: Value,
    #[serde(default)]
    pub term_group: Value,
    #[serde(default)]
    pub flag: String,
}

/// Reference to one key of a Secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSource {
    #[serde(rename = "secretKeyRef")]
    pub secret_key_ref: SecretKeyRef,
}

/// One `wp_options` entry of a plugin declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WpOption {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(rename = "valueFrom", default)]
    pub value_from: Option<OptionSource>,
    /// `JSON` when the value is a JSON document to decode first.
    #[serde(rename = "valueEncoding", default)]
    pub value_encoding: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolylangDecl {
    #[serde(default)]
    pub languages: Vec<Language>,
}

/// Declared configuration of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginDecl {
    #[serde(default)]
    pub wp_options: Vec<WpOption>,
    #[serde(default)]
    pub polylang: Option<PolylangDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbLookup {
    pub mariadb_name_source: String,
    pub database_name_source: String,
    pub mariadb_secret_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRef {
    #[serde(rename = "mariaDBLookup")]
    pub mariadb_lookup: MariaDbLookup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    pub bucket: String,
    pub endpoint: String,
    pub secret_key_name: String,
}

/// Where a site's content is restored from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSource {
    pub wp_db_backup_ref: BackupRef,
    pub s3: S3Source,
    #[serde(default)]
    pub url_source: Option<String>,
    /// RFC 3339 point in time; latest backup when absent.
    #[serde(default)]
    pub target_recovery_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WordpressSpec {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    tagline: Option<String>,
    #[serde(default)]
    plugins: BTreeMap<String, PluginDecl>,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    downloads_protection_script: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteSpec {
    hostname: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    wordpress: WordpressSpec,
    #[serde(default)]
    owner: Value,
    #[serde(default)]
    restore: Option<RestoreSource>,
}

/// What a site object declares.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteDesiredState {
    pub name: String,
    pub namespace: String,
    pub owner: OwnerReference,
    pub hostname: String,
    pub path: String,
    pub title: String,
    pub tagline: String,
    pub plugins: BTreeMap<String, PluginDecl>,
    /// Polylang languages, from the `polylang` plugin declaration.
    pub languages: Vec<Language>,
    pub unit_id: Option<Value>,
    pub debug: bool,
    pub downloads_protection_script: Option<String>,
    pub restore: Option<RestoreSource>,
}

impl SiteDesiredState {
    pub fn from_site(site: &ManagedObject) -> SiteResult<Self> {
        let invalid = |message: String| SiteError::InvalidSpec {
            site: site.moniker(),
            message,
        };
        let namespace = site
            .namespace()
            .ok_or_else(|| invalid("site is not namespaced".into()))?
            .to_string();
        let spec_value = site.spec().cloned().ok_or_else(|| invalid("missing spec".into()))?;
        let spec: SiteSpec = serde_json::from_value(spec_value).map_err(|e| invalid(e.to_string()))?;
        if spec.hostname.is_empty() {
            return Err(invalid("empty hostname".into()));
        }
        let owner = site.owner_reference()?;

        let path = match spec.path.as_deref() {
            None | Some("") => "/".to_string(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{p}"),
        };
        let languages = spec
            .wordpress
            .plugins
            .get("polylang")
            .and_then(|p| p.polylang.as_ref())
            .map(|p| p.languages.clone())
            .unwrap_or_default();
        let unit_id = spec
            .owner
            .pointer("/epfl/unitId")
            .filter(|v| !v.is_null())
            .cloned();
        let name = site.name().to_string();

        Ok(Self {
            title: spec.wordpress.title.unwrap_or_else(|| name.clone()),
            tagline: spec.wordpress.tagline.unwrap_or_default(),
            name,
            namespace,
            owner,
            hostname: spec.hostname,
            path,
            plugins: spec.wordpress.plugins,
            languages,
            unit_id,
            debug: spec.wordpress.debug,
            downloads_protection_script: spec.wordpress.downloads_protection_script,
            restore: spec.restore,
        })
    }

    pub fn plugin_names(&self) -> BTreeSet<String> {
        self.plugins.keys().cloned().collect()
    }

    /// `https://` URL of the site.
    pub fn url(&self) -> String {
        format!("https://{}{}", self.hostname, self.path)
    }

    /// Path with exactly one trailing slash.
    pub fn root_uri(&self) -> String {
        format!("{}/", self.path.trim_end_matches('/'))
    }
}

/// What the site's status says was last applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteObservedState {
    pub state: Option<String>,
    pub plugins: BTreeSet<String>,
    pub languages: Vec<Language>,
    pub unit_id: Option<String>,
}

impl SiteObservedState {
    pub fn from_site(site: &ManagedObject) -> Self {
        let Some(status) = site.field(&["status", "wordpresssite"]) else {
            return Self::default();
        };
        let plugins = match status.get("plugins") {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            _ => BTreeSet::new(),
        };
        let languages = status
            .get("languages")
            .and_then(|v| serde_json::from_value::<Vec<Language>>(v.clone()).ok())
            .unwrap_or_default();
        Self {
            state: status.get("state").and_then(Value::as_str).map(str::to_string),
            plugins,
            languages,
            unit_id: status.get("unitid").map(plain_text).filter(|s| !s.is_empty()),
        }
    }

    pub fn is_created(&self) -> bool {
        self.state.as_deref() == Some(CREATED_STATE)
    }
}

/// Status state of a fully provisioned site.
pub const CREATED_STATE: &str = "created";

/// A scalar as plain text: strings unquoted, everything else as JSON.
pub fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn site(spec: Value, status: Value) -> ManagedObject {
        ManagedObject::from_definition(json!({
            "apiVersion": "wordpress.epfl.ch/v2",
            "kind": "WordpressSite",
            "metadata": {"name": "blog", "namespace": "ns", "uid": "uid-blog"},
            "spec": spec,
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn desired_state_from_full_spec() {
        let object = site(
            json!({
                "hostname": "www.example.com",
                "path": "/research/lab",
                "owner": {"epfl": {"unitId": 13030}},
                "wordpress": {
                    "title": "Lab",
                    "tagline": "Science",
                    "plugins": {
                        "polylang": {"polylang": {"languages": [
                            {"name": "English", "slug": "en", "locale": "en_US", "rtl": 0, "term_group": 0, "flag": "us"}
                        ]}},
                        "redirection": {},
                        "epfl-menus": {"wp_options": [{"name": "epfl_menus_sync", "value": "1"}]},
                    },
                },
            }),
            json!({}),
        );
        let desired = SiteDesiredState::from_site(&object).unwrap();
        assert_eq!(desired.root_uri(), "/research/lab/");
        assert_eq!(desired.url(), "https://www.example.com/research/lab");
        assert_eq!(desired.plugin_names().len(), 3);
        assert_eq!(desired.languages[0].locale, "en_US");
        assert_eq!(desired.unit_id, Some(json!(13030)));
        assert_eq!(desired.owner.uid, "uid-blog");
    }

    #[test]
    fn defaults_for_sparse_spec() {
        let desired = SiteDesiredState::from_site(&site(json!({"hostname": "a.example.com"}), json!({}))).unwrap();
        assert_eq!(desired.path, "/");
        assert_eq!(desired.root_uri(), "/");
        assert_eq!(desired.title, "blog");
        assert!(desired.plugins.is_empty());
        assert!(desired.restore.is_none());
    }

    #[test]
    fn missing_hostname_is_invalid() {
        let err = SiteDesiredState::from_site(&site(json!({"path": "/x"}), json!({}))).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn observed_state_accepts_map_or_list_of_plugins() {
        let map = site(
            json!({"hostname": "h"}),
            json!({"wordpresssite": {"state": "created", "plugins": {"b": {}, "c": {}}, "unitid": 12}}),
        );
        let observed = SiteObservedState::from_site(&map);
        assert!(observed.is_created());
        assert_eq!(observed.plugins, BTreeSet::from(["b".to_string(), "c".to_string()]));
        assert_eq!(observed.unit_id.as_deref(), Some("12"));

        let list = site(json!({"hostname": "h"}), json!({"wordpresssite": {"plugins": ["b"]}}));
        assert_eq!(SiteObservedState::from_site(&list).plugins.len(), 1);
        assert_eq!(SiteObservedState::from_site(&site(json!({"hostname": "h"}), json!(null))), SiteObservedState::default());
    }

    #[test]
    fn restore_descriptor_parses() {
        let desired = SiteDesiredState::from_site(&site(
            json!({
                "hostname": "h",
                "restore": {
                    "wpDbBackupRef": {"mariaDBLookup": {
                        "mariadbNameSource": "mariadb-min",
                        "databaseNameSource": "wp-db-old",
                        "mariadbSecretName": "s3-creds",
                    }},
                    "s3": {"bucket": "backups", "endpoint": "s3.example.com", "secretKeyName": "s3-creds"},
                    "urlSource": "https://old.example.com/",
                },
            }),
            json!({}),
        ))
        .unwrap();
        let restore = desired.restore.unwrap();
        assert_eq!(restore.wp_db_backup_ref.mariadb_lookup.database_name_source, "wp-db-old");
        assert_eq!(restore.url_source.as_deref(), Some("https://old.example.com/"));
    }
}
