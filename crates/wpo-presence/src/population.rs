//! Namespace population index: which namespaces hold objects of a kind.
//!
//! Fed from a watch stream, the index keeps `namespace → member names`
//! and fires callbacks on the empty ↔ non-empty edges only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wpo_store::{ApiKind, EventType, ResourceStore, WatchEvent};

/// Callback invoked with the namespace that changed state.
pub type NamespaceCallback =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Namespace edges produced by one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transitions {
    pub populated: Vec<String>,
    pub emptied: Vec<String>,
}

impl Transitions {
    pub fn is_empty(&self) -> bool {
        self.populated.is_empty() && self.emptied.is_empty()
    }
}

/// Live per-namespace membership of one kind.
///
/// Objects carrying a deletion marker still count as members until the
/// store reports them deleted.
pub struct NamespacePopulationIndex {
    kind: ApiKind,
    /// A namespace stays here, possibly with an empty set, once it has
    /// been seen populated.
    members: Mutex<BTreeMap<String, BTreeSet<String>>>,
    on_populated: Vec<NamespaceCallback>,
    on_emptied: Vec<NamespaceCallback>,
}

impl NamespacePopulationIndex {
    pub fn new(kind: ApiKind) -> Self {
        Self {
            kind,
            members: Mutex::new(BTreeMap::new()),
            on_populated: Vec::new(),
            on_emptied: Vec::new(),
        }
    }

    /// Register a callback for the empty → non-empty edge. Callbacks run
    /// in registration order.
    pub fn on_populated(mut self, callback: NamespaceCallback) -> Self {
        self.on_populated.push(callback);
        self
    }

    /// Register a callback for the non-empty → empty edge. Callbacks run
    /// in reverse registration order.
    pub fn on_emptied(mut self, callback: NamespaceCallback) -> Self {
        self.on_emptied.push(callback);
        self
    }

    pub fn kind(&self) -> &ApiKind {
        &self.kind
    }

    pub fn is_populated(&self, namespace: &str) -> bool {
        let members = self.members.lock().expect("members lock");
        members.get(namespace).is_some_and(|set| !set.is_empty())
    }

    /// Namespaces currently holding at least one member.
    pub fn populated_namespaces(&self) -> BTreeSet<String> {
        populated(&self.members.lock().expect("members lock"))
    }

    pub fn members(&self, namespace: &str) -> BTreeSet<String> {
        let members = self.members.lock().expect("members lock");
        members.get(namespace).cloned().unwrap_or_default()
    }

    /// Fold one event into the index and report the edges it caused.
    pub fn apply(&self, event: &WatchEvent) -> Transitions {
        let Some(namespace) = event.object.namespace() else {
            debug!(object = %event.object, "ignoring cluster-scoped object");
            return Transitions::default();
        };
        let name = event.object.name().to_string();

        let mut members = self.members.lock().expect("members lock");
        let before = populated(&members);
        match event.event_type {
            EventType::Added | EventType::Modified => {
                members.entry(namespace.to_string()).or_default().insert(name);
            }
            EventType::Deleted => {
                if let Some(set) = members.get_mut(namespace) {
                    set.remove(&name);
                }
            }
        }
        let after = populated(&members);

        Transitions {
            populated: after.difference(&before).cloned().collect(),
            emptied: before.difference(&after).cloned().collect(),
        }
    }

    /// Apply an event and run the callbacks for its edges. A failing
    /// callback is logged and does not stop the others.
    pub async fn handle(&self, event: &WatchEvent) -> Transitions {
        let transitions = self.apply(event);

        for namespace in &transitions.emptied {
            info!(kind = %self.kind, %namespace, "namespace emptied");
            for callback in self.on_emptied.iter().rev() {
                if let Err(e) = callback(namespace.clone()).await {
                    error!(%namespace, error = %e, "emptied callback failed");
                }
            }
        }
        for namespace in &transitions.populated {
            info!(kind = %self.kind, %namespace, "namespace populated");
            for callback in &self.on_populated {
                if let Err(e) = callback(namespace.clone()).await {
                    error!(%namespace, error = %e, "populated callback failed");
                }
            }
        }

        transitions
    }

    /// Consume the watch stream for this kind until cancelled.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn ResourceStore>,
        namespace: Option<String>,
        cancel: CancellationToken,
    ) {
        let mut events = store.watch(&self.kind, namespace.as_deref());
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    self.handle(&event).await;
                }
                Some(Err(e)) => warn!(kind = %self.kind, error = %e, "watch error"),
                None => {
                    warn!(kind = %self.kind, "watch stream ended");
                    break;
                }
            }
        }
        debug!(kind = %self.kind, "population index stopped");
    }
}

fn populated(members: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
    members
        .iter()
        .filter(|(_, set)| !set.is_empty())
        .map(|(ns, _)| ns.clone())
        .collect()
}
