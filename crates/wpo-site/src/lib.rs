//! wpo-site: WordPress site reconciliation.
//!
//! # Components
//!
//! - **`model`**: desired and observed site state parsed from the site object
//! - **`resources`**: secret, user, grant, ingress and restore objects a site owns
//! - **`readiness`**: bounded polling of dependent object conditions
//! - **`executor`**: the WordPress mutation boundary (`wp`, install script, MariaDB tools)
//! - **`work`**: per-pass batching of executor calls
//! - **`plugins`**: plugin reconcilers picked by plugin name
//! - **`php`**: PHP literal encoding for option values
//! - **`reconciler`**: create, reconcile and delete paths for one site
//! - **`controller`**: event fingerprinting, worker pool and periodic resync

pub mod controller;
pub mod error;
pub mod executor;
pub mod model;
pub mod php;
pub mod plugins;
pub mod readiness;
pub mod reconciler;
pub mod resources;
pub mod work;

pub use controller::{ControllerConfig, SiteAction, SiteController};
pub use error::{ExecError, ExecResult, SiteError, SiteResult};
pub use executor::{
    ExecOutput, ExecutorConfig, ImportParams, InstallParams, SiteHandle, WpCliExecutor, WpExecutor, WpOperation,
};
pub use model::{Language, PluginDecl, SiteDesiredState, SiteObservedState, site_kind};
pub use plugins::{LanguageChanges, PluginReconciler};
pub use readiness::{ReadinessPolicy, wait_until_ready};
pub use reconciler::{PluginChanges, SiteReconciler};
pub use resources::SiteConfig;
pub use work::SiteWork;
