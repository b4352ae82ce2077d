//! Namespace provisioner: support objects for every namespace with sites.
//!
//! A manifest written for a sample namespace is instantiated into each
//! namespace as soon as it gets its first site, and torn down in reverse
//! order once its last site is gone.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info};

use wpo_store::manifest::parse_manifest_for;
use wpo_store::{ManagedObject, ResourceStore, StoreResult};

use crate::population::{NamespaceCallback, NamespacePopulationIndex};

/// Namespace the template manifest is written for.
pub const DEFAULT_SAMPLE_NAMESPACE: &str = "wordpress-test";

/// Creates and deletes per-namespace support objects.
pub struct NamespaceProvisioner {
    store: Arc<dyn ResourceStore>,
    template: String,
    sample_namespace: String,
}

impl NamespaceProvisioner {
    pub fn new(store: Arc<dyn ResourceStore>, template: impl Into<String>) -> Self {
        Self {
            store,
            template: template.into(),
            sample_namespace: DEFAULT_SAMPLE_NAMESPACE.to_string(),
        }
    }

    pub fn with_sample_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.sample_namespace = namespace.into();
        self
    }

    /// The template instantiated for `namespace`, in manifest order.
    pub fn objects_for(&self, namespace: &str) -> StoreResult<Vec<ManagedObject>> {
        parse_manifest_for(&self.template, &self.sample_namespace, namespace)
    }

    /// Create every support object. Already-present objects are fine;
    /// other failures are logged and the remaining objects still get
    /// created. Returns the number of objects actually created.
    pub async fn provision(&self, namespace: &str) -> StoreResult<usize> {
        let mut created = 0;
        for object in self.objects_for(namespace)? {
            match self.store.create(&object).await {
                Ok(_) => {
                    info!(%namespace, object = %object, "support object created");
                    created += 1;
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => error!(%namespace, object = %object, error = %e, "cannot create support object"),
            }
        }
        Ok(created)
    }

    /// Delete every support object, last one first. Returns the number
    /// of delete requests issued.
    pub async fn deprovision(&self, namespace: &str) -> StoreResult<usize> {
        let mut deleted = 0;
        for object in self.objects_for(namespace)?.iter().rev() {
            match self.store.delete_if_exists(object.object_ref()).await {
                Ok(true) => {
                    info!(%namespace, object = %object, "support object deleted");
                    deleted += 1;
                }
                Ok(false) => {}
                Err(e) => error!(%namespace, object = %object, error = %e, "cannot delete support object"),
            }
        }
        Ok(deleted)
    }

    /// Hook this provisioner onto a population index.
    pub fn attach(self: &Arc<Self>, index: NamespacePopulationIndex) -> NamespacePopulationIndex {
        let up = Arc::clone(self);
        let populated: NamespaceCallback = Arc::new(move |namespace: String| {
            let up = Arc::clone(&up);
            async move {
                up.provision(&namespace).await?;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        let down = Arc::clone(self);
        let emptied: NamespaceCallback = Arc::new(move |namespace: String| {
            let down = Arc::clone(&down);
            async move {
                down.deprovision(&namespace).await?;
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        index.on_populated(populated).on_emptied(emptied)
    }
}
