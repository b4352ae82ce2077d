//! Batched mutations for one reconciliation pass.
//!
//! Plugin activations, deactivations and option updates are buffered and
//! sent in at most three executor calls per flush: activate, deactivate,
//! then one `eval` with every option statement. Operations that cannot be
//! batched flush the buffer first so ordering is preserved.

use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use crate::error::SiteResult;
use crate::executor::{ExecOutput, SiteHandle, WpExecutor, WpOperation};
use crate::model::Language;
use crate::php;

pub struct SiteWork<'a> {
    executor: &'a dyn WpExecutor,
    site: SiteHandle,
    activate: Vec<String>,
    deactivate: Vec<String>,
    php: String,
}

impl<'a> SiteWork<'a> {
    pub fn new(executor: &'a dyn WpExecutor, site: SiteHandle) -> Self {
        Self {
            executor,
            site,
            activate: Vec::new(),
            deactivate: Vec::new(),
            php: String::new(),
        }
    }

    pub fn site(&self) -> &SiteHandle {
        &self.site
    }

    pub fn activate_plugin(&mut self, name: &str) {
        self.activate.push(name.to_string());
    }

    pub fn deactivate_plugin(&mut self, name: &str) {
        self.deactivate.push(name.to_string());
    }

    pub fn set_option(&mut self, name: &str, value: &Value) {
        self.php.push_str(&php::update_option(name, value));
    }

    pub fn is_empty(&self) -> bool {
        self.activate.is_empty() && self.deactivate.is_empty() && self.php.is_empty()
    }

    /// Send everything buffered so far.
    pub async fn flush(&mut self) -> SiteResult<()> {
        if !self.activate.is_empty() {
            let names = std::mem::take(&mut self.activate);
            self.run(WpOperation::ActivatePlugins(names)).await?;
        }
        if !self.deactivate.is_empty() {
            let names = std::mem::take(&mut self.deactivate);
            self.run(WpOperation::DeactivatePlugins(names)).await?;
        }
        if !self.php.is_empty() {
            let code = std::mem::take(&mut self.php);
            self.run(WpOperation::Eval(code)).await?;
        }
        Ok(())
    }

    pub async fn add_language(&mut self, language: &Language) -> SiteResult<()> {
        self.flush().await?;
        self.run(WpOperation::AddLanguage(language.clone())).await?;
        Ok(())
    }

    pub async fn delete_language(&mut self, slug: &str) -> SiteResult<()> {
        self.flush().await?;
        self.run(WpOperation::DeleteLanguage(slug.to_string())).await?;
        Ok(())
    }

    pub async fn delete_transient(&mut self, name: &str) -> SiteResult<()> {
        self.flush().await?;
        self.run(WpOperation::DeleteTransient(name.to_string())).await?;
        Ok(())
    }

    pub async fn apply_sql(&mut self, path: PathBuf) -> SiteResult<()> {
        self.flush().await?;
        self.run(WpOperation::ApplySql(path)).await?;
        Ok(())
    }

    async fn run(&self, op: WpOperation) -> SiteResult<ExecOutput> {
        debug!(site = %self.site, operation = op.name(), "executing");
        Ok(self.executor.run(&self.site, &op).await?)
    }
}
