//! Route table: known routes per namespace and parent resolution.
//!
//! Routes are kept in the order they were first seen. Updates merge the
//! observed spec into the stored one key by key, so a partial update
//! never erases fields it does not mention.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::debug;

use wpo_store::{EventType, WatchEvent};

/// A known route, as last observed.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub name: String,
    pub spec: Map<String, Value>,
}

impl RouteEntry {
    pub fn host(&self) -> &str {
        self.spec.get("host").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.spec.get("path").and_then(Value::as_str).unwrap_or_default()
    }

    /// Service the route sends traffic to.
    pub fn service(&self) -> Option<&str> {
        self.spec
            .get("to")
            .and_then(|to| to.get("name"))
            .and_then(Value::as_str)
    }

    /// `host` immediately followed by `path`.
    pub fn url(&self) -> String {
        format!("{}{}", self.host(), self.path())
    }
}

/// Whether `candidate_url` is `site_url` or one of its ancestors, compared
/// segment by segment. `/foo` is a parent of `/foo/bar` but not of
/// `/foobar`; empty segments (doubled or trailing slashes) are ignored.
pub fn is_parent_route(site_url: &str, candidate_url: &str) -> bool {
    let site: Vec<&str> = site_url.split('/').filter(|s| !s.is_empty()).collect();
    let candidate: Vec<&str> = candidate_url.split('/').filter(|s| !s.is_empty()).collect();
    candidate.len() <= site.len() && candidate.iter().zip(&site).all(|(c, s)| c == s)
}

/// Routes per namespace, shareable across tasks.
#[derive(Clone, Default)]
pub struct RouteTable {
    namespaces: Arc<RwLock<BTreeMap<String, Vec<RouteEntry>>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route or merge `spec` into the known one.
    pub fn upsert(&self, namespace: &str, name: &str, spec: &Value) {
        let mut namespaces = self.namespaces.write().expect("routes lock");
        let routes = namespaces.entry(namespace.to_string()).or_default();
        let fields = spec.as_object().cloned().unwrap_or_default();
        match routes.iter_mut().find(|r| r.name == name) {
            Some(entry) => entry.spec.extend(fields),
            None => routes.push(RouteEntry {
                name: name.to_string(),
                spec: fields,
            }),
        }
        debug!(%namespace, route = name, "route recorded");
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let mut namespaces = self.namespaces.write().expect("routes lock");
        if let Some(routes) = namespaces.get_mut(namespace) {
            routes.retain(|r| r.name != name);
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<RouteEntry> {
        let namespaces = self.namespaces.read().expect("routes lock");
        namespaces
            .get(namespace)?
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn len(&self, namespace: &str) -> usize {
        let namespaces = self.namespaces.read().expect("routes lock");
        namespaces.get(namespace).map(Vec::len).unwrap_or(0)
    }

    /// Fold a route event into the table.
    pub fn apply(&self, event: &WatchEvent) {
        let Some(namespace) = event.object.namespace() else {
            return;
        };
        match event.event_type {
            EventType::Deleted => self.remove(namespace, event.object.name()),
            EventType::Added | EventType::Modified => {
                let spec = event.object.spec().cloned().unwrap_or(Value::Null);
                self.upsert(namespace, event.object.name(), &spec);
            }
        }
    }

    /// The route with the longest URL among those that are parents of
    /// `host` + `path`. Equal lengths resolve to the route seen first.
    pub fn closest_parent(&self, namespace: &str, host: &str, path: &str) -> Option<RouteEntry> {
        let site_url = format!("{host}{path}");
        let namespaces = self.namespaces.read().expect("routes lock");
        let mut best: Option<(&RouteEntry, usize)> = None;
        for route in namespaces.get(namespace)? {
            let url = route.url();
            if !is_parent_route(&site_url, &url) {
                continue;
            }
            if best.is_none_or(|(_, len)| url.len() > len) {
                best = Some((route, url.len()));
            }
        }
        best.map(|(route, _)| route.clone())
    }
}
