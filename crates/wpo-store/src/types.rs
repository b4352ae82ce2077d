//! Object model shared by every component of the operator.
//!
//! A [`ManagedObject`] is an immutable snapshot of a cluster object's full
//! JSON definition. Identity (and equality) is the pair
//! `(namespace, name)`; everything else is payload.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Group/version/kind of a cluster object, e.g. `k8s.mariadb.com/v1alpha1`
/// and `Database`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiKind {
    pub api_version: String,
    pub kind: String,
}

impl ApiKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// API group, empty for the core group (`v1`).
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// API version without the group.
    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, version)) => version,
            None => &self.api_version,
        }
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Pointer to a single object: kind plus `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ApiKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ApiKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(kind: ApiKind, namespace: &str, name: &str) -> Self {
        Self::new(kind, Some(namespace), name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind.kind, self.name),
        }
    }
}

/// Owner reference stamped onto dependent objects so the cluster garbage
/// collects them together with their owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// One entry of `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Immutable snapshot of a cluster object.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    identity: ObjectRef,
    definition: Value,
}

impl ManagedObject {
    /// Wrap a full definition. It must carry `apiVersion`, `kind` and
    /// `metadata.name`.
    pub fn from_definition(definition: Value) -> StoreResult<Self> {
        let api_version = str_at(&definition, &["apiVersion"])
            .ok_or_else(|| StoreError::Invalid("definition lacks apiVersion".into()))?;
        let kind = str_at(&definition, &["kind"])
            .ok_or_else(|| StoreError::Invalid("definition lacks kind".into()))?;
        let name = str_at(&definition, &["metadata", "name"])
            .ok_or_else(|| StoreError::Invalid(format!("{kind} definition lacks metadata.name")))?;
        let namespace = str_at(&definition, &["metadata", "namespace"]);
        let identity = ObjectRef {
            kind: ApiKind::new(api_version, kind),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        Ok(Self {
            identity,
            definition,
        })
    }

    /// An identity-only object, usable for lookups and equality checks.
    pub fn dud(target: &ObjectRef) -> Self {
        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(target.name.clone()));
        if let Some(ns) = &target.namespace {
            metadata.insert("namespace".into(), Value::String(ns.clone()));
        }
        let definition = serde_json::json!({
            "apiVersion": target.kind.api_version,
            "kind": target.kind.kind,
            "metadata": Value::Object(metadata),
        });
        Self {
            identity: target.clone(),
            definition,
        }
    }

    pub fn object_ref(&self) -> &ObjectRef {
        &self.identity
    }

    pub fn kind(&self) -> &ApiKind {
        &self.identity.kind
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.identity.namespace.as_deref()
    }

    /// Human-readable `Kind namespace/name`.
    pub fn moniker(&self) -> String {
        self.identity.to_string()
    }

    pub fn definition(&self) -> &Value {
        &self.definition
    }

    pub fn into_definition(self) -> Value {
        self.definition
    }

    /// Look up a nested field by path segments.
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        value_at(&self.definition, path)
    }

    pub fn spec(&self) -> Option<&Value> {
        self.field(&["spec"])
    }

    pub fn status(&self) -> Option<&Value> {
        self.field(&["status"])
    }

    pub fn uid(&self) -> Option<&str> {
        str_at(&self.definition, &["metadata", "uid"])
    }

    pub fn resource_version(&self) -> Option<&str> {
        str_at(&self.definition, &["metadata", "resourceVersion"])
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map_at(&self.definition, &["metadata", "labels"])
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map_at(&self.definition, &["metadata", "annotations"])
    }

    /// Uid of the first owner reference, if any.
    pub fn owner_uid(&self) -> Option<&str> {
        self.field(&["metadata", "ownerReferences"])
            .and_then(Value::as_array)
            .and_then(|refs| refs.first())
            .and_then(|r| r.get("uid"))
            .and_then(Value::as_str)
    }

    /// Whether the object carries a deletion marker (it is being deleted
    /// but finalizers still hold it).
    pub fn is_being_deleted(&self) -> bool {
        self.field(&["metadata", "deletionTimestamp"])
            .is_some_and(|v| !v.is_null())
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.field(&["metadata", "finalizers"])
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parsed `status.conditions`; malformed entries are skipped.
    pub fn conditions(&self) -> Vec<Condition> {
        self.field(&["status", "conditions"])
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Owner reference pointing at this object.
    pub fn owner_reference(&self) -> StoreResult<OwnerReference> {
        let uid = self
            .uid()
            .ok_or_else(|| StoreError::Invalid(format!("{} has no uid", self.moniker())))?;
        Ok(OwnerReference {
            api_version: self.identity.kind.api_version.clone(),
            kind: self.identity.kind.kind.clone(),
            name: self.identity.name.clone(),
            uid: uid.to_string(),
        })
    }

    /// Copy of this object moved to another namespace. Server-assigned
    /// metadata is dropped so the copy can be created afresh.
    pub fn in_namespace(&self, namespace: &str) -> Self {
        let mut definition = self.definition.clone();
        if let Some(meta) = definition.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("namespace".into(), Value::String(namespace.to_string()));
            for key in ["uid", "resourceVersion", "creationTimestamp", "deletionTimestamp"] {
                meta.remove(key);
            }
        }
        let mut identity = self.identity.clone();
        identity.namespace = Some(namespace.to_string());
        Self {
            identity,
            definition,
        }
    }

    /// Copy of this object with its definition transformed. Identity is
    /// re-derived from the result.
    pub fn map_definition(&self, f: impl FnOnce(&mut Value)) -> StoreResult<Self> {
        let mut definition = self.definition.clone();
        f(&mut definition);
        Self::from_definition(definition)
    }
}

impl PartialEq for ManagedObject {
    fn eq(&self, other: &Self) -> bool {
        self.identity.name == other.identity.name
            && self.identity.namespace == other.identity.namespace
    }
}

impl Eq for ManagedObject {}

impl fmt::Display for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.identity.fmt(f)
    }
}

/// Kind of change carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// One change notification from a watch stream.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub object: ManagedObject,
}

impl WatchEvent {
    pub fn new(event_type: EventType, object: ManagedObject) -> Self {
        Self { event_type, object }
    }
}

pub(crate) fn value_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

pub(crate) fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    value_at(value, path).and_then(Value::as_str)
}

fn string_map_at(value: &Value, path: &[&str]) -> BTreeMap<String, String> {
    value_at(value, path)
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
