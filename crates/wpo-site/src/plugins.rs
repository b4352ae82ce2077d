//! Per-plugin reconciliation.
//!
//! Most plugins only need activating, deactivating and their declared
//! options written. A few known plugins carry extra steps; they are
//! picked by name from a fixed table, anything else is [`PluginReconciler::Generic`].

use std::collections::BTreeSet;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{debug, info};

use wpo_store::{ApiKind, ObjectRef, ResourceStore};

use crate::error::{SiteError, SiteResult};
use crate::model::{Language, PluginDecl, WpOption};
use crate::work::SiteWork;

/// Transient Polylang sets to redirect the first admin visit to its wizard.
pub const POLYLANG_ACTIVATION_TRANSIENT: &str = "pll_activation_redirect";

/// What plugin reconcilers may need besides the batch itself.
pub struct PluginContext<'a> {
    pub store: &'a dyn ResourceStore,
    pub namespace: &'a str,
    /// Rule set loaded when Redirection is configured.
    pub redirection_sql: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginReconciler {
    Generic,
    /// Also manages languages and clears the setup-wizard redirect.
    Polylang,
    /// Also loads a static redirect rule set.
    Redirection,
}

const KNOWN_PLUGINS: &[(&str, PluginReconciler)] = &[
    ("polylang", PluginReconciler::Polylang),
    ("redirection", PluginReconciler::Redirection),
];

impl PluginReconciler {
    pub fn for_plugin(name: &str) -> Self {
        KNOWN_PLUGINS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, reconciler)| *reconciler)
            .unwrap_or(PluginReconciler::Generic)
    }

    pub fn activate(&self, name: &str, work: &mut SiteWork<'_>) {
        info!(site = %work.site(), plugin = name, "activating plugin");
        work.activate_plugin(name);
    }

    pub fn deactivate(&self, name: &str, work: &mut SiteWork<'_>) {
        info!(site = %work.site(), plugin = name, "deactivating plugin");
        work.deactivate_plugin(name);
    }

    /// Apply a freshly activated plugin's declared configuration.
    pub async fn configure(
        &self,
        name: &str,
        decl: &PluginDecl,
        ctx: &PluginContext<'_>,
        work: &mut SiteWork<'_>,
    ) -> SiteResult<()> {
        debug!(site = %work.site(), plugin = name, options = decl.wp_options.len(), "configuring plugin");
        for option in &decl.wp_options {
            let value = resolve_option(option, ctx).await?;
            work.set_option(&option.name, &value);
        }
        match self {
            PluginReconciler::Generic => {}
            PluginReconciler::Polylang => work.delete_transient(POLYLANG_ACTIVATION_TRANSIENT).await?,
            PluginReconciler::Redirection => work.apply_sql(ctx.redirection_sql.clone()).await?,
        }
        Ok(())
    }

    /// Converge Polylang languages, keyed by locale.
    pub async fn reconcile_languages(
        desired: &[Language],
        observed: &[Language],
        work: &mut SiteWork<'_>,
    ) -> SiteResult<()> {
        let changes = LanguageChanges::between(desired, observed);
        for slug in &changes.remove {
            info!(site = %work.site(), slug = %slug, "removing language");
            work.delete_language(slug).await?;
        }
        for language in &changes.add {
            info!(site = %work.site(), locale = %language.locale, "adding language");
            work.add_language(language).await?;
        }
        Ok(())
    }
}

/// Language additions and removals for one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LanguageChanges {
    /// Slugs of observed languages whose locale is no longer wanted.
    pub remove: Vec<String>,
    pub add: Vec<Language>,
}

impl LanguageChanges {
    pub fn between(desired: &[Language], observed: &[Language]) -> Self {
        let wanted: BTreeSet<&str> = desired.iter().map(|l| l.locale.as_str()).collect();
        let got: BTreeSet<&str> = observed.iter().map(|l| l.locale.as_str()).collect();
        let mut seen = BTreeSet::new();
        let remove = observed
            .iter()
            .filter(|l| !wanted.contains(l.locale.as_str()) && seen.insert(l.locale.as_str()))
            .map(|l| l.slug.clone())
            .collect();
        let mut seen = BTreeSet::new();
        let add = desired
            .iter()
            .filter(|l| !got.contains(l.locale.as_str()) && seen.insert(l.locale.as_str()))
            .cloned()
            .collect();
        Self { remove, add }
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// The value an option should be set to: inline or from a Secret key,
/// JSON-decoded when declared so.
pub async fn resolve_option(option: &WpOption, ctx: &PluginContext<'_>) -> SiteResult<Value> {
    let raw = match (&option.value, &option.value_from) {
        (Some(value), _) => value.clone(),
        (None, Some(source)) => {
            let secret = &source.secret_key_ref;
            Value::String(read_secret_key(ctx.store, ctx.namespace, &secret.name, &secret.key).await?)
        }
        (None, None) => {
            return Err(SiteError::InvalidSpec {
                site: ctx.namespace.to_string(),
                message: format!("option {} has neither value nor valueFrom", option.name),
            });
        }
    };
    if option.value_encoding.as_deref() != Some("JSON") {
        return Ok(raw);
    }
    match raw {
        Value::String(text) => serde_json::from_str(&text).map_err(|e| SiteError::InvalidSpec {
            site: ctx.namespace.to_string(),
            message: format!("option {} is not valid JSON: {e}", option.name),
        }),
        other => Ok(other),
    }
}

/// Decoded text of `data[key]` of a Secret.
pub async fn read_secret_key(
    store: &dyn ResourceStore,
    namespace: &str,
    secret: &str,
    key: &str,
) -> SiteResult<String> {
    let target = ObjectRef::namespaced(ApiKind::new("v1", "Secret"), namespace, secret);
    let object = store.get(&target).await?;
    let missing = || SiteError::MissingSecret {
        secret: target.to_string(),
        key: key.to_string(),
    };
    let encoded = object.field(&["data", key]).and_then(Value::as_str).ok_or_else(missing)?;
    let bytes = STANDARD.decode(encoded).map_err(|_| missing())?;
    String::from_utf8(bytes).map_err(|_| missing())
}
