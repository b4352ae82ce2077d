//! Lifecycle mode: the `olm` subcommand.
//!
//! Under its own lease, the daemon:
//! 1. Keeps every object of the `--guard` manifests in existence
//! 2. Provisions per-namespace support objects while a namespace has sites
//! 3. On shutdown, stops the guards and waits for in-flight recreations

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use wpo_leader::{LeaderElector, LeaderExit, LeaseConfig};
use wpo_presence::{ExistenceGuard, NamespacePopulationIndex, NamespaceProvisioner};
use wpo_site::site_kind;
use wpo_store::ResourceStore;
use wpo_store::manifest::load_manifest;

use crate::config::OperatorConfig;

pub struct LifecycleEngine {
    store: Arc<dyn ResourceStore>,
    guards: Vec<Arc<ExistenceGuard>>,
    population: Option<Arc<NamespacePopulationIndex>>,
}

impl LifecycleEngine {
    /// Load the guard and namespace manifests named in `config.olm`.
    pub fn build(store: Arc<dyn ResourceStore>, config: &OperatorConfig) -> anyhow::Result<Self> {
        let mut guards = Vec::new();
        for path in &config.olm.guards {
            let objects = load_manifest(path).with_context(|| format!("cannot load {}", path.display()))?;
            for object in objects {
                guards.push(Arc::new(ExistenceGuard::new(Arc::clone(&store), object)));
            }
        }

        let population = match &config.olm.namespaced_manifest {
            Some(path) => Some(Arc::new(population_index(&store, path, &config.olm.sample_namespace)?)),
            None => None,
        };

        Ok(Self {
            store,
            guards,
            population,
        })
    }

    pub fn guards(&self) -> &[Arc<ExistenceGuard>] {
        &self.guards
    }

    /// Run until cancelled.
    pub async fn run(self, namespace: Option<String>, cancel: CancellationToken) {
        for guard in &self.guards {
            guard.start();
        }
        info!(guards = self.guards.len(), "existence guards started");

        let population = self.population.map(|index| {
            tokio::spawn(index.run(Arc::clone(&self.store), namespace, cancel.clone()))
        });

        cancel.cancelled().await;

        for guard in &self.guards {
            guard.stop().await;
        }
        if let Some(population) = population {
            let _ = population.await;
        }
    }
}

fn population_index(
    store: &Arc<dyn ResourceStore>,
    manifest: &Path,
    sample_namespace: &str,
) -> anyhow::Result<NamespacePopulationIndex> {
    let template =
        std::fs::read_to_string(manifest).with_context(|| format!("cannot read {}", manifest.display()))?;
    let provisioner = NamespaceProvisioner::new(Arc::clone(store), template).with_sample_namespace(sample_namespace);
    // Fail at startup rather than on the first populated namespace.
    provisioner
        .objects_for(sample_namespace)
        .with_context(|| format!("cannot parse {}", manifest.display()))?;
    Ok(Arc::new(provisioner).attach(NamespacePopulationIndex::new(site_kind())))
}

/// Compete for the lifecycle lease and run the guards while holding it.
pub async fn run_olm(
    store: Arc<dyn ResourceStore>,
    config: &OperatorConfig,
    cancel: CancellationToken,
) -> anyhow::Result<LeaderExit> {
    let scope = config.watch_scope()?;
    let lease = LeaseConfig {
        lock_name: format!("{}-olm", config.leader.lock_name),
        ..config.leader.clone()
    };
    let elector = LeaderElector::new(Arc::clone(&store), &config.lease_namespace()?, lease)?;
    let engine = LifecycleEngine::build(store, config)?;
    info!(
        namespace = scope.as_deref().unwrap_or("*"),
        identity = elector.identity(),
        guards = engine.guards().len(),
        "lifecycle operator starting"
    );

    let exit = elector.gate(&cancel, |token| engine.run(scope, token)).await;
    info!(?exit, "lifecycle operator stopped");
    Ok(exit)
}
