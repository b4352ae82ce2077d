//! Site controller: turns site watch events into reconciliation passes.
//!
//! Each event is fingerprinted on the parts of the site that matter for
//! convergence (spec plus the plugin, language and unit id status). An
//! event whose fingerprint was already handled is dropped; this keeps the
//! controller's own status patches from retriggering it. Passes run on
//! spawned tasks, bounded by a semaphore and serialised per site.
//!
//! Retryable failures, including failed WordPress commands, forget the
//! fingerprint so the next resync retries. The others keep it, so the site
//! is left alone until it changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wpo_store::{EventType, ManagedObject, ResourceStore, WatchEvent};

use crate::error::SiteResult;
use crate::model::{SiteObservedState, site_kind};
use crate::reconciler::SiteReconciler;

/// Worker and resync settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub max_workers: usize,
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            resync_interval: Duration::from_secs(300),
        }
    }
}

type SiteKey = (String, String);

/// What an event asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteAction {
    /// Create the site if its status says it is not created yet,
    /// reconcile it otherwise.
    Converge,
    Delete,
}

/// An accepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Planned {
    pub action: SiteAction,
    key: SiteKey,
    fingerprint: Option<String>,
}

pub struct SiteController {
    store: Arc<dyn ResourceStore>,
    reconciler: Arc<SiteReconciler>,
    config: ControllerConfig,
    fingerprints: Mutex<HashMap<SiteKey, String>>,
    site_locks: Mutex<HashMap<SiteKey, Arc<tokio::sync::Mutex<()>>>>,
    workers: Arc<Semaphore>,
}

impl SiteController {
    pub fn new(store: Arc<dyn ResourceStore>, reconciler: Arc<SiteReconciler>) -> Self {
        Self::with_config(store, reconciler, ControllerConfig::default())
    }

    pub fn with_config(store: Arc<dyn ResourceStore>, reconciler: Arc<SiteReconciler>, config: ControllerConfig) -> Self {
        let config = ControllerConfig {
            max_workers: config.max_workers.max(1),
            resync_interval: config.resync_interval.max(Duration::from_secs(1)),
        };
        Self {
            store,
            reconciler,
            config,
            fingerprints: Mutex::new(HashMap::new()),
            site_locks: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.max_workers)),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Decide whether `event` needs a pass, recording its fingerprint.
    pub fn plan(&self, event: &WatchEvent) -> Option<Planned> {
        let key = site_key(&event.object)?;
        if event.event_type == EventType::Deleted {
            self.fingerprints.lock().expect("fingerprints lock").remove(&key);
            return Some(Planned {
                action: SiteAction::Delete,
                key,
                fingerprint: None,
            });
        }
        if event.object.is_being_deleted() {
            return None;
        }
        let fingerprint = fingerprint(&event.object);
        let mut fingerprints = self.fingerprints.lock().expect("fingerprints lock");
        if fingerprints.get(&key) == Some(&fingerprint) {
            debug!(namespace = %key.0, site = %key.1, "unchanged, skipping");
            return None;
        }
        fingerprints.insert(key.clone(), fingerprint.clone());
        Some(Planned {
            action: SiteAction::Converge,
            key,
            fingerprint: Some(fingerprint),
        })
    }

    fn site_lock(&self, key: &SiteKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.site_locks.lock().expect("site locks lock");
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Run one planned pass to completion.
    pub async fn execute(&self, planned: Planned, object: ManagedObject) -> SiteResult<()> {
        let lock = self.site_lock(&planned.key);
        let _serial = lock.lock().await;
        let (namespace, name) = &planned.key;

        let result = match planned.action {
            SiteAction::Delete => {
                let result = self.reconciler.delete_site(&object).await;
                self.site_locks.lock().expect("site locks lock").remove(&planned.key);
                result
            }
            SiteAction::Converge => self.converge(&object).await,
        };

        match &result {
            Ok(()) => debug!(%namespace, site = %name, action = ?planned.action, "pass complete"),
            Err(e) if !e.is_retryable() => {
                error!(%namespace, site = %name, error = %e, "pass failed, not retrying until the site changes");
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(%namespace, site = %name, error = %e, "pass failed, will retry on resync");
                } else {
                    warn!(%namespace, site = %name, error = %e, "pass failed, will retry");
                }
                let mut fingerprints = self.fingerprints.lock().expect("fingerprints lock");
                if fingerprints.get(&planned.key) == planned.fingerprint.as_ref() {
                    fingerprints.remove(&planned.key);
                }
            }
        }
        result
    }

    /// Act on the stored state of the site, which may be newer than the
    /// event that scheduled the pass.
    async fn converge(&self, object: &ManagedObject) -> SiteResult<()> {
        let current = match self.store.get(object.object_ref()).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if current.is_being_deleted() {
            return Ok(());
        }
        if SiteObservedState::from_site(&current).is_created() {
            self.reconciler.reconcile_site(&current).await
        } else {
            self.reconciler.create_site(&current).await
        }
    }

    /// Plan and run `event` on the calling task.
    pub async fn handle(&self, event: WatchEvent) -> Option<SiteResult<()>> {
        let planned = self.plan(&event)?;
        Some(self.execute(planned, event.object).await)
    }

    /// Plan `event` and run it on a worker task. Waits for a free worker.
    async fn dispatch(self: &Arc<Self>, event: WatchEvent) {
        let Some(planned) = self.plan(&event) else {
            return;
        };
        let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
            return;
        };
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let _ = controller.execute(planned, event.object).await;
        });
    }

    /// Replay every site through the controller.
    pub async fn resync(self: &Arc<Self>, namespace: Option<&str>) {
        match self.store.list(&site_kind(), namespace).await {
            Ok(sites) => {
                debug!(count = sites.len(), "resync");
                for site in sites {
                    self.dispatch(WatchEvent::new(EventType::Modified, site)).await;
                }
            }
            Err(e) => warn!(error = %e, "resync listing failed"),
        }
    }

    /// Follow site events until cancelled, then wait for running passes.
    pub async fn run(self: Arc<Self>, namespace: Option<String>, cancel: CancellationToken) {
        info!(
            namespace = namespace.as_deref().unwrap_or("*"),
            max_workers = self.config.max_workers,
            resync_secs = self.config.resync_interval.as_secs(),
            "site controller starting"
        );
        let mut events = self.store.watch(&site_kind(), namespace.as_deref());
        let mut resync = tokio::time::interval(self.config.resync_interval);
        // The watch delivers the initial listing.
        resync.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(Ok(event)) => self.dispatch(event).await,
                    Some(Err(e)) => warn!(error = %e, "site watch error"),
                    None => {
                        warn!("site watch ended");
                        break;
                    }
                },
                _ = resync.tick() => self.resync(namespace.as_deref()).await,
            }
        }

        let all = u32::try_from(self.config.max_workers).unwrap_or(u32::MAX);
        let _drained = self.workers.acquire_many(all).await;
        info!("site controller stopped");
    }
}

fn site_key(object: &ManagedObject) -> Option<SiteKey> {
    Some((object.namespace()?.to_string(), object.name().to_string()))
}

/// The parts of a site that a pass converges on.
pub fn fingerprint(site: &ManagedObject) -> String {
    let status = |key: &str| site.field(&["status", "wordpresssite", key]).cloned().unwrap_or(Value::Null);
    json!([
        site.spec().cloned().unwrap_or(Value::Null),
        status("plugins"),
        status("languages"),
        status("unitid"),
    ])
    .to_string()
}
