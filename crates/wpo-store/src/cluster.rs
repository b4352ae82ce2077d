//! KubeStore: [`ResourceStore`] backed by a live Kubernetes API server.
//!
//! Objects travel as `DynamicObject`s so that custom resources (sites,
//! MariaDB databases, routes) need no generated bindings.

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams, TypeMeta,
};
use kube::runtime::{WatchStreamExt, watcher};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{ResourceStore, WatchStream};
use crate::types::*;

/// Store talking to the cluster through kube-rs.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration or the local kubeconfig.
    pub async fn connect() -> StoreResult<Self> {
        let client = Client::try_default().await.map_err(map_kube_error)?;
        debug!("kubernetes client connected");
        Ok(Self::new(client))
    }

    fn api(&self, kind: &ApiKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), &kind.kind);
        let resource = ApiResource::from_gvk(&gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, target: &ObjectRef) -> StoreResult<ManagedObject> {
        let api = self.api(&target.kind, target.namespace.as_deref());
        let obj = api.get(&target.name).await.map_err(map_kube_error)?;
        to_managed(&target.kind, obj)
    }

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> StoreResult<Vec<ManagedObject>> {
        let api = self.api(kind, namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(map_kube_error)?;
        list.items.into_iter().map(|o| to_managed(kind, o)).collect()
    }

    async fn create(&self, object: &ManagedObject) -> StoreResult<ManagedObject> {
        let api = self.api(object.kind(), object.namespace());
        let created = api
            .create(&PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(map_kube_error)?;
        to_managed(object.kind(), created)
    }

    async fn replace(&self, object: &ManagedObject) -> StoreResult<ManagedObject> {
        let api = self.api(object.kind(), object.namespace());
        let replaced = api
            .replace(object.name(), &PostParams::default(), &to_dynamic(object)?)
            .await
            .map_err(map_kube_error)?;
        to_managed(object.kind(), replaced)
    }

    async fn delete(&self, target: &ObjectRef) -> StoreResult<()> {
        let api = self.api(&target.kind, target.namespace.as_deref());
        api.delete(&target.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }

    async fn patch_status(&self, target: &ObjectRef, status: &Value) -> StoreResult<ManagedObject> {
        let api = self.api(&target.kind, target.namespace.as_deref());
        let patch = serde_json::json!({ "status": status });
        let patched = api
            .patch_status(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)?;
        to_managed(&target.kind, patched)
    }

    fn watch(&self, kind: &ApiKind, namespace: Option<&str>) -> WatchStream {
        let api = self.api(kind, namespace);
        let kind = kind.clone();
        watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| {
                let kind = kind.clone();
                async move {
                    match event {
                        Ok(watcher::Event::InitApply(obj)) => {
                            Some(to_managed(&kind, obj).map(|o| WatchEvent::new(EventType::Added, o)))
                        }
                        Ok(watcher::Event::Apply(obj)) => Some(
                            to_managed(&kind, obj).map(|o| WatchEvent::new(EventType::Modified, o)),
                        ),
                        Ok(watcher::Event::Delete(obj)) => Some(
                            to_managed(&kind, obj).map(|o| WatchEvent::new(EventType::Deleted, o)),
                        ),
                        Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                        Err(e) => Some(Err(StoreError::Transport(e.to_string()))),
                    }
                }
            })
            .boxed()
    }
}

/// List responses omit per-item type information, so it is restored from
/// the requested kind.
fn to_managed(kind: &ApiKind, mut obj: DynamicObject) -> StoreResult<ManagedObject> {
    obj.types = Some(TypeMeta {
        api_version: kind.api_version.clone(),
        kind: kind.kind.clone(),
    });
    let definition = serde_json::to_value(&obj).map_err(|e| StoreError::Serialize(e.to_string()))?;
    ManagedObject::from_definition(definition)
}

fn to_dynamic(object: &ManagedObject) -> StoreResult<DynamicObject> {
    serde_json::from_value(object.definition().clone())
        .map_err(|e| StoreError::Deserialize(e.to_string()))
}

fn map_kube_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message),
        kube::Error::Api(resp) => StoreError::Api {
            code: resp.code,
            message: resp.message,
        },
        other => StoreError::Transport(other.to_string()),
    }
}
