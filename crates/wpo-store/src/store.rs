//! ResourceStore: the operator's view of the cluster object API.
//!
//! Every component talks to the cluster through the [`ResourceStore`]
//! trait. Two backends exist: [`InMemoryStore`] (process-local, used by
//! tests and dry runs) and [`crate::KubeStore`] (a live API server).

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::types::*;

/// Stream of change notifications. The initial listing arrives as
/// `Added` events before any live change.
pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Typed access to cluster objects.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch one object. Absent objects yield [`StoreError::NotFound`].
    async fn get(&self, target: &ObjectRef) -> StoreResult<ManagedObject>;

    /// List objects of a kind, optionally restricted to a namespace.
    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> StoreResult<Vec<ManagedObject>>;

    /// Create an object. An existing object yields [`StoreError::Conflict`].
    async fn create(&self, object: &ManagedObject) -> StoreResult<ManagedObject>;

    /// Replace an object. When the definition carries a
    /// `metadata.resourceVersion` that is no longer current the write is
    /// rejected with [`StoreError::Conflict`].
    async fn replace(&self, object: &ManagedObject) -> StoreResult<ManagedObject>;

    /// Request deletion. Objects holding finalizers only get a deletion
    /// marker until the finalizers are cleared.
    async fn delete(&self, target: &ObjectRef) -> StoreResult<()>;

    /// JSON-merge-patch the status subresource.
    async fn patch_status(&self, target: &ObjectRef, status: &Value) -> StoreResult<ManagedObject>;

    /// Watch a kind, optionally restricted to a namespace.
    fn watch(&self, kind: &ApiKind, namespace: Option<&str>) -> WatchStream;

    /// Whether the object is currently present.
    async fn exists(&self, target: &ObjectRef) -> StoreResult<bool> {
        match self.get(target).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete, treating an already-absent object as success. Returns true
    /// if a delete was actually issued.
    async fn delete_if_exists(&self, target: &ObjectRef) -> StoreResult<bool> {
        match self.delete(target).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Process-local object store with API-server-like semantics.
///
/// Assigns uids and resource versions, honours finalizers on delete,
/// normalises Secret `stringData` into base64 `data`, and broadcasts
/// changes to watchers. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    create_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, ManagedObject>,
    revision: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(1024)
    }

    /// Store whose watchers fall behind after `capacity` unread events
    /// and then re-list.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State::default()),
                events,
                create_calls: AtomicUsize::new(0),
                get_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of `create` calls issued so far, successful or not.
    pub fn create_calls(&self) -> usize {
        self.inner.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `get` calls issued so far.
    pub fn get_calls(&self) -> usize {
        self.inner.get_calls.load(Ordering::SeqCst)
    }

    /// Number of stored objects of every kind.
    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("store lock").objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, event_type: EventType, object: &ManagedObject) {
        // No receivers is fine.
        let _ = self.inner.events.send(WatchEvent::new(event_type, object.clone()));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, target: &ObjectRef) -> StoreResult<ManagedObject> {
        self.inner.get_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.state.lock().expect("store lock");
        state
            .objects
            .get(target)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(target.to_string()))
    }

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> StoreResult<Vec<ManagedObject>> {
        let state = self.inner.state.lock().expect("store lock");
        Ok(state
            .objects
            .values()
            .filter(|o| in_scope(o, kind, namespace))
            .cloned()
            .collect())
    }

    async fn create(&self, object: &ManagedObject) -> StoreResult<ManagedObject> {
        self.inner.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().expect("store lock");
        let key = object.object_ref().clone();
        if state.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }
        state.revision += 1;
        let revision = state.revision;
        let stored = object.map_definition(|def| {
            if let Some(meta) = metadata_mut(def) {
                meta.entry("uid")
                    .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
                meta.insert("resourceVersion".into(), Value::String(revision.to_string()));
                meta.entry("creationTimestamp")
                    .or_insert_with(|| Value::String(now_rfc3339()));
                meta.remove("deletionTimestamp");
            }
            normalize_secret(def);
        })?;
        state.objects.insert(key, stored.clone());
        self.publish(EventType::Added, &stored);
        debug!(object = %stored, "object created");
        Ok(stored)
    }

    async fn replace(&self, object: &ManagedObject) -> StoreResult<ManagedObject> {
        let mut state = self.inner.state.lock().expect("store lock");
        let key = object.object_ref().clone();
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(rv) = object.resource_version() {
            if Some(rv) != existing.resource_version() {
                return Err(StoreError::Conflict(format!(
                    "{key} was modified (resourceVersion {rv} is stale)"
                )));
            }
        }
        state.revision += 1;
        let revision = state.revision;
        let stored = object.map_definition(|def| {
            if let Some(meta) = metadata_mut(def) {
                for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
                    match existing.field(&["metadata", field]) {
                        Some(v) => meta.insert(field.into(), v.clone()),
                        None => meta.remove(field),
                    };
                }
                meta.insert("resourceVersion".into(), Value::String(revision.to_string()));
            }
            normalize_secret(def);
        })?;
        if stored.is_being_deleted() && stored.finalizers().is_empty() {
            state.objects.remove(&key);
            self.publish(EventType::Deleted, &stored);
            debug!(object = %stored, "finalizers cleared, object removed");
        } else {
            state.objects.insert(key, stored.clone());
            self.publish(EventType::Modified, &stored);
        }
        Ok(stored)
    }

    async fn delete(&self, target: &ObjectRef) -> StoreResult<()> {
        let mut state = self.inner.state.lock().expect("store lock");
        let existing = state
            .objects
            .get(target)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
        if !existing.finalizers().is_empty() {
            if !existing.is_being_deleted() {
                state.revision += 1;
                let revision = state.revision;
                let marked = existing.map_definition(|def| {
                    if let Some(meta) = metadata_mut(def) {
                        meta.insert("deletionTimestamp".into(), Value::String(now_rfc3339()));
                        meta.insert("resourceVersion".into(), Value::String(revision.to_string()));
                    }
                })?;
                state.objects.insert(target.clone(), marked.clone());
                self.publish(EventType::Modified, &marked);
                debug!(object = %marked, "deletion marker set");
            }
            return Ok(());
        }
        state.objects.remove(target);
        self.publish(EventType::Deleted, &existing);
        debug!(object = %existing, "object deleted");
        Ok(())
    }

    async fn patch_status(&self, target: &ObjectRef, status: &Value) -> StoreResult<ManagedObject> {
        let mut state = self.inner.state.lock().expect("store lock");
        let existing = state
            .objects
            .get(target)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
        state.revision += 1;
        let revision = state.revision;
        let patched = existing.map_definition(|def| {
            if let Some(obj) = def.as_object_mut() {
                let current = obj.entry("status").or_insert(Value::Null);
                merge_patch(current, status);
            }
            if let Some(meta) = metadata_mut(def) {
                meta.insert("resourceVersion".into(), Value::String(revision.to_string()));
            }
        })?;
        state.objects.insert(target.clone(), patched.clone());
        self.publish(EventType::Modified, &patched);
        Ok(patched)
    }

    fn watch(&self, kind: &ApiKind, namespace: Option<&str>) -> WatchStream {
        let mut cursor = WatchCursor {
            shared: Arc::clone(&self.inner),
            receiver: self.inner.events.subscribe(),
            kind: kind.clone(),
            namespace: namespace.map(str::to_string),
            known: BTreeMap::new(),
            pending: VecDeque::new(),
        };
        cursor.relist();

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(event) = cursor.pending.pop_front() {
                    cursor.track(&event);
                    return Some((Ok(event), cursor));
                }
                match cursor.receiver.recv().await {
                    Ok(event) if in_scope(&event.object, &cursor.kind, cursor.namespace.as_deref()) => {
                        cursor.pending.push_back(event);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = %cursor.kind, skipped, "watch fell behind, relisting");
                        cursor.relist();
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Per-watch state: what the consumer has been told so far.
struct WatchCursor {
    shared: Arc<Shared>,
    receiver: broadcast::Receiver<WatchEvent>,
    kind: ApiKind,
    namespace: Option<String>,
    known: BTreeMap<ObjectRef, ManagedObject>,
    pending: VecDeque<WatchEvent>,
}

impl WatchCursor {
    /// Queue the difference between what the consumer knows and the
    /// current listing, and resubscribe. Both happen under the store lock
    /// so no change falls between the listing and the live feed.
    fn relist(&mut self) {
        let state = self.shared.state.lock().expect("store lock");
        self.receiver = self.shared.events.subscribe();
        self.pending.clear();
        let current: BTreeMap<&ObjectRef, &ManagedObject> = state
            .objects
            .iter()
            .filter(|(_, o)| in_scope(o, &self.kind, self.namespace.as_deref()))
            .collect();
        for (target, object) in &self.known {
            if !current.contains_key(target) {
                self.pending.push_back(WatchEvent::new(EventType::Deleted, object.clone()));
            }
        }
        for (target, object) in current {
            let event_type = match self.known.get(target) {
                None => EventType::Added,
                Some(seen) if seen.resource_version() == object.resource_version() => continue,
                Some(_) => EventType::Modified,
            };
            self.pending.push_back(WatchEvent::new(event_type, object.clone()));
        }
    }

    fn track(&mut self, event: &WatchEvent) {
        let target = event.object.object_ref().clone();
        if event.event_type == EventType::Deleted {
            self.known.remove(&target);
        } else {
            self.known.insert(target, event.object.clone());
        }
    }
}

fn in_scope(object: &ManagedObject, kind: &ApiKind, namespace: Option<&str>) -> bool {
    object.kind() == kind && namespace.is_none_or(|ns| object.namespace() == Some(ns))
}

fn metadata_mut(definition: &mut Value) -> Option<&mut Map<String, Value>> {
    definition.get_mut("metadata").and_then(Value::as_object_mut)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Fold Secret `stringData` into base64 `data`, the way the API server
/// stores it.
fn normalize_secret(definition: &mut Value) {
    let is_secret = definition.get("kind").and_then(Value::as_str) == Some("Secret");
    let Some(obj) = definition.as_object_mut().filter(|_| is_secret) else {
        return;
    };
    let Some(Value::Object(string_data)) = obj.remove("stringData") else {
        return;
    };
    let data = obj
        .entry("data")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(data) = data.as_object_mut() {
        for (key, value) in string_data {
            if let Some(plain) = value.as_str() {
                let encoded = base64::engine::general_purpose::STANDARD.encode(plain);
                data.insert(key, Value::String(encoded));
            }
        }
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Merge patch turning `current` into `desired`. Keys missing from
/// `desired` are nulled out; nested objects are diffed recursively.
pub fn replacement_patch(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) if previous == value => {}
                    Some(previous) => {
                        patch.insert(key.clone(), replacement_patch(previous, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use serde_json::json;

    fn secret_kind() -> ApiKind {
        ApiKind::new("v1", "Secret")
    }

    fn secret(ns: &str, name: &str) -> ManagedObject {
        ManagedObject::from_definition(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": name, "namespace": ns},
            "stringData": {"password": "hunter2"},
        }))
        .unwrap()
    }

    fn guarded(ns: &str, name: &str) -> ManagedObject {
        ManagedObject::from_definition(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns, "finalizers": ["example.com/hold"]},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = InMemoryStore::new();
        let created = store.create(&secret("ns", "s1")).await.unwrap();
        assert!(created.uid().is_some());
        assert!(created.resource_version().is_some());

        let err = store.create(&secret("ns", "s1")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.create_calls(), 2);
    }

    #[tokio::test]
    async fn secret_string_data_is_encoded() {
        let store = InMemoryStore::new();
        store.create(&secret("ns", "s1")).await.unwrap();
        let fetched = store
            .get(&ObjectRef::namespaced(secret_kind(), "ns", "s1"))
            .await
            .unwrap();
        assert_eq!(
            fetched.field(&["data", "password"]).and_then(Value::as_str),
            Some("aHVudGVyMg==")
        );
        assert!(fetched.field(&["stringData"]).is_none());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryStore::new();
        let target = ObjectRef::namespaced(secret_kind(), "ns", "nope");
        assert!(store.get(&target).await.unwrap_err().is_not_found());
        assert!(!store.exists(&target).await.unwrap());
        assert!(!store.delete_if_exists(&target).await.unwrap());
    }

    #[tokio::test]
    async fn replace_with_stale_version_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create(&secret("ns", "s1")).await.unwrap();
        store.replace(&created).await.unwrap();
        let err = store.replace(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn finalizers_defer_removal() {
        let store = InMemoryStore::new();
        let created = store.create(&guarded("ns", "cm")).await.unwrap();
        store.delete(created.object_ref()).await.unwrap();

        let marked = store.get(created.object_ref()).await.unwrap();
        assert!(marked.is_being_deleted());

        let released = marked
            .map_definition(|def| {
                def["metadata"]["finalizers"] = json!([]);
            })
            .unwrap();
        store.replace(&released).await.unwrap();
        assert!(!store.exists(created.object_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn patch_status_merges() {
        let store = InMemoryStore::new();
        let created = store.create(&secret("ns", "s1")).await.unwrap();
        store
            .patch_status(created.object_ref(), &json!({"a": {"x": 1}, "b": 2}))
            .await
            .unwrap();
        let patched = store
            .patch_status(created.object_ref(), &json!({"a": {"y": 3}, "b": null}))
            .await
            .unwrap();
        assert_eq!(patched.status(), Some(&json!({"a": {"x": 1, "y": 3}})));
    }

    #[tokio::test]
    async fn watch_replays_then_follows() {
        let store = InMemoryStore::new();
        store.create(&secret("ns", "before")).await.unwrap();
        store.create(&secret("other", "ignored")).await.unwrap();

        let mut events = store.watch(&secret_kind(), Some("ns"));
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, EventType::Added);
        assert_eq!(first.object.name(), "before");

        store.create(&secret("other", "still-ignored")).await.unwrap();
        store.create(&secret("ns", "after")).await.unwrap();
        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.object.name(), "after");

        store
            .delete(&ObjectRef::namespaced(secret_kind(), "ns", "after"))
            .await
            .unwrap();
        let third = events.next().await.unwrap().unwrap();
        assert_eq!(third.event_type, EventType::Deleted);
    }

    #[test]
    fn replacement_patch_removes_stale_keys() {
        let current = json!({"state": "created", "plugins": {"b": {}, "c": {"v": 1}}});
        let desired = json!({"state": "created", "plugins": {"a": {}, "b": {}}});
        let patch = replacement_patch(&current, &desired);
        assert_eq!(patch, json!({"plugins": {"c": null, "a": {}}}));

        let mut applied = current.clone();
        merge_patch(&mut applied, &patch);
        assert_eq!(applied, desired);
    }

    #[tokio::test]
    async fn lagging_watch_relists_and_reports_missed_deletions() {
        let store = InMemoryStore::with_event_capacity(2);
        store.create(&secret("ns", "gone")).await.unwrap();
        store.create(&secret("ns", "kept")).await.unwrap();

        let mut events = store.watch(&secret_kind(), Some("ns"));
        for _ in 0..2 {
            events.next().await.unwrap().unwrap();
        }

        store
            .delete(&ObjectRef::namespaced(secret_kind(), "ns", "gone"))
            .await
            .unwrap();
        for name in ["a", "b", "c", "d"] {
            store.create(&secret("ns", name)).await.unwrap();
        }

        let mut added = BTreeSet::new();
        let mut deleted = BTreeSet::new();
        for _ in 0..5 {
            let event = events.next().await.unwrap().unwrap();
            match event.event_type {
                EventType::Added => added.insert(event.object.name().to_string()),
                EventType::Deleted => deleted.insert(event.object.name().to_string()),
                EventType::Modified => panic!("unexpected {event:?}"),
            };
        }
        assert_eq!(deleted, BTreeSet::from(["gone".to_string()]));
        assert_eq!(added, ["a", "b", "c", "d"].into_iter().map(String::from).collect());
    }
}
