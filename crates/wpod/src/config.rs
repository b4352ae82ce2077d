//! wpod.toml configuration.
//!
//! Every section and field is optional. Command-line flags are applied on
//! top of the file by the subcommands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use wpo_leader::LeaseConfig;
use wpo_placement::PlacerConfig;
use wpo_routing::RouteConfig;
use wpo_site::{ControllerConfig, ExecutorConfig, ReadinessPolicy, SiteConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace to operate in. Ignored when `cluster_wide` is set.
    pub namespace: Option<String>,
    pub cluster_wide: bool,
    pub site: SiteConfig,
    pub placement: PlacerConfig,
    pub routing: RouteConfig,
    pub leader: LeaseConfig,
    pub executor: ExecutorConfig,
    pub readiness: ReadinessSection,
    pub controller: ControllerSection,
    pub olm: OlmSection,
}

/// Polling budget for databases, users, grants and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSection {
    pub attempts: u32,
    pub interval_secs: u64,
}

impl Default for ReadinessSection {
    fn default() -> Self {
        let policy = ReadinessPolicy::default();
        Self {
            attempts: policy.attempts,
            interval_secs: policy.interval.as_secs(),
        }
    }
}

impl ReadinessSection {
    /// Policies for dependent objects and for restores.
    pub fn policies(&self) -> (ReadinessPolicy, ReadinessPolicy) {
        let interval = Duration::from_secs(self.interval_secs);
        (
            ReadinessPolicy::default().with_timing(self.attempts, interval),
            ReadinessPolicy::restore().with_timing(self.attempts, interval),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub max_workers: usize,
    pub resync_secs: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            max_workers: controller.max_workers,
            resync_secs: controller.resync_interval.as_secs(),
        }
    }
}

impl ControllerSection {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_workers: self.max_workers,
            resync_interval: Duration::from_secs(self.resync_secs),
        }
    }
}

/// Inputs of the `olm` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OlmSection {
    /// Manifests whose objects must always exist.
    pub guards: Vec<PathBuf>,
    /// Manifest instantiated into every namespace that has sites.
    pub namespaced_manifest: Option<PathBuf>,
    /// Namespace `namespaced_manifest` is written for.
    pub sample_namespace: String,
}

impl Default for OlmSection {
    fn default() -> Self {
        Self {
            guards: Vec::new(),
            namespaced_manifest: None,
            sample_namespace: wpo_presence::provisioner::DEFAULT_SAMPLE_NAMESPACE.to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
        let config: OperatorConfig =
            toml::from_str(&content).with_context(|| format!("cannot parse {}", path.display()))?;
        Ok(config)
    }

    /// The file at `path`, or defaults when none is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Namespace to watch, `None` for the whole cluster.
    pub fn watch_scope(&self) -> anyhow::Result<Option<String>> {
        if self.cluster_wide {
            return Ok(None);
        }
        match &self.namespace {
            Some(ns) if !ns.is_empty() => Ok(Some(ns.clone())),
            _ => bail!("a namespace is required unless running cluster-wide"),
        }
    }

    /// Namespace holding the leader lease.
    pub fn lease_namespace(&self) -> anyhow::Result<String> {
        if let Some(ns) = &self.leader.namespace {
            return Ok(ns.clone());
        }
        match self.watch_scope()? {
            Some(ns) => Ok(ns),
            None => bail!("cluster-wide mode needs [leader] namespace for the lease"),
        }
    }
}
