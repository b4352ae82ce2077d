//! Database placer: picks a shard and creates the site's database.
//!
//! Placement is optimistic: the chosen shard is charged in the inventory
//! before the create is issued, so two placements racing in this process
//! spread over different shards. If the create conflicts, the database
//! already exists and its actual shard is read back from the store.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wpo_store::{ApiKind, ManagedObject, OwnerReference, ResourceStore, WatchEvent};

use crate::error::{PlacementError, PlacementResult};
use crate::inventory::{DatabaseRecord, ShardInventory, shard_ref};

/// Static settings for database placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacerConfig {
    pub shard_kind: ApiKind,
    pub database_kind: ApiKind,
    /// Label marking shards open for automatic allocation.
    pub autoallocate_label: String,
    pub database_prefix: String,
    pub character_set: String,
    pub collate: String,
}

impl Default for PlacerConfig {
    fn default() -> Self {
        Self {
            shard_kind: ApiKind::new("k8s.mariadb.com/v1alpha1", "MariaDB"),
            database_kind: ApiKind::new("k8s.mariadb.com/v1alpha1", "Database"),
            autoallocate_label: "wpAutoallocate".to_string(),
            database_prefix: "wp-db-".to_string(),
            character_set: "utf8mb4".to_string(),
            collate: "utf8mb4_unicode_ci".to_string(),
        }
    }
}

/// Result of a placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Shard actually hosting the database.
    pub shard: String,
    pub database: String,
    /// False when the database already existed.
    pub created: bool,
}

/// Places site databases on the least-loaded shard of their namespace.
pub struct DatabasePlacer {
    store: Arc<dyn ResourceStore>,
    config: PlacerConfig,
    inventory: Mutex<ShardInventory>,
}

impl DatabasePlacer {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            config: PlacerConfig::default(),
            inventory: Mutex::new(ShardInventory::new()),
        }
    }

    pub fn with_config(mut self, config: PlacerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PlacerConfig {
        &self.config
    }

    /// Name of the database backing a site.
    pub fn database_name(&self, site_name: &str) -> String {
        format!("{}{}", self.config.database_prefix, site_name)
    }

    pub fn shard_loads(&self, namespace: &str) -> Vec<(String, usize)> {
        self.inventory.lock().expect("inventory lock").shard_loads(namespace)
    }

    pub fn shard_of(&self, namespace: &str, database: &str) -> Option<String> {
        self.inventory
            .lock()
            .expect("inventory lock")
            .shard_of(namespace, database)
    }

    /// Fold a shard or database event into the inventory.
    pub fn apply(&self, event: &WatchEvent) {
        let mut inventory = self.inventory.lock().expect("inventory lock");
        let kind = event.object.kind();
        if *kind == self.config.shard_kind {
            inventory.apply_shard_event(event, &self.config.autoallocate_label);
        } else if *kind == self.config.database_kind {
            inventory.apply_database_event(event);
        }
    }

    /// Choose a shard for `site_name`'s database and create it.
    pub async fn place_and_create(
        &self,
        namespace: &str,
        site_name: &str,
        owner: &OwnerReference,
    ) -> PlacementResult<Placement> {
        let database = self.database_name(site_name);
        let record = DatabaseRecord {
            name: database.clone(),
            namespace: namespace.to_string(),
            spec: json!({}),
        };

        let (shard, optimistic) = {
            let mut inventory = self.inventory.lock().expect("inventory lock");
            match inventory.shard_of(namespace, &database) {
                Some(known) => (known, false),
                None => {
                    let shard = inventory
                        .least_loaded(namespace)
                        .ok_or_else(|| PlacementError::NoShardAvailable(namespace.to_string()))?;
                    inventory.record_database(namespace, &shard, record.clone());
                    (shard, true)
                }
            }
        };
        debug!(%namespace, %database, %shard, "shard chosen");

        let object = self.database_object(namespace, &database, &shard, owner)?;
        match self.store.create(&object).await {
            Ok(_) => {
                info!(%namespace, %database, %shard, "database created");
                Ok(Placement {
                    shard,
                    database,
                    created: true,
                })
            }
            Err(e) if e.is_conflict() => {
                let existing = self.store.get(object.object_ref()).await?;
                let actual = shard_ref(&existing)
                    .ok_or_else(|| PlacementError::MissingShardRef(database.clone()))?
                    .to_string();
                if actual != shard {
                    warn!(%namespace, %database, guessed = %shard, %actual, "database already placed elsewhere");
                }
                self.inventory
                    .lock()
                    .expect("inventory lock")
                    .record_database(namespace, &actual, record);
                Ok(Placement {
                    shard: actual,
                    database,
                    created: false,
                })
            }
            Err(e) => {
                if optimistic {
                    self.inventory
                        .lock()
                        .expect("inventory lock")
                        .forget_database(namespace, &database);
                }
                Err(e.into())
            }
        }
    }

    fn database_object(
        &self,
        namespace: &str,
        database: &str,
        shard: &str,
        owner: &OwnerReference,
    ) -> PlacementResult<ManagedObject> {
        let definition = json!({
            "apiVersion": self.config.database_kind.api_version,
            "kind": self.config.database_kind.kind,
            "metadata": {
                "name": database,
                "namespace": namespace,
                "ownerReferences": [owner],
            },
            "spec": {
                "mariaDbRef": {"name": shard},
                "characterSet": self.config.character_set,
                "collate": self.config.collate,
            },
        });
        Ok(ManagedObject::from_definition(definition)?)
    }

    /// Keep the inventory current from the store until cancelled.
    pub async fn run(self: Arc<Self>, namespace: Option<String>, cancel: CancellationToken) {
        let shards = self.store.watch(&self.config.shard_kind, namespace.as_deref());
        let databases = self.store.watch(&self.config.database_kind, namespace.as_deref());
        let mut events = stream::select(shards, databases);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => self.apply(&event),
                Some(Err(e)) => warn!(error = %e, "inventory watch error"),
                None => {
                    warn!("inventory watch ended");
                    break;
                }
            }
        }
        debug!("database placer stopped");
    }
}
