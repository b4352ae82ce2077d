//! Route resolver: creates a site's public route unless a parent route
//! already serves the same backend.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wpo_store::{ApiKind, ManagedObject, OwnerReference, ResourceStore};

use crate::error::RouteResult;
use crate::table::{RouteEntry, RouteTable};

/// Route naming and labelling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub route_kind: ApiKind,
    pub name_prefix: String,
    /// Hosts fronted by an external proxy; their routes get
    /// `external_label` instead of `default_label`.
    pub external_hosts: Vec<String>,
    pub external_label: String,
    pub default_label: String,
    pub app_label: String,
    pub target_port: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            route_kind: ApiKind::new("route.openshift.io/v1", "Route"),
            name_prefix: "wp-route-".to_string(),
            external_hosts: Vec::new(),
            external_label: "public-cf".to_string(),
            default_label: "public".to_string(),
            app_label: "wp-nginx".to_string(),
            target_port: "80".to_string(),
        }
    }
}

/// What a site needs routed.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub namespace: String,
    pub site_name: String,
    pub host: String,
    pub path: String,
    pub service: String,
    pub owner: OwnerReference,
}

/// Result of [`RouteResolver::create_route`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Created { name: String },
    /// A parent route already sends this URL to the same service.
    Covered { parent: String },
    AlreadyExists { name: String },
}

/// Decides whether sites need their own route and creates it.
pub struct RouteResolver {
    store: Arc<dyn ResourceStore>,
    table: RouteTable,
    config: RouteConfig,
}

impl RouteResolver {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            table: RouteTable::new(),
            config: RouteConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RouteConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn route_name(&self, site_name: &str) -> String {
        format!("{}{}", self.config.name_prefix, site_name)
    }

    pub fn closest_parent_route(&self, namespace: &str, host: &str, path: &str) -> Option<RouteEntry> {
        self.table.closest_parent(namespace, host, path)
    }

    /// Create the route for a site unless a parent route covers it.
    pub async fn create_route(&self, request: &RouteRequest) -> RouteResult<RouteOutcome> {
        if let Some(parent) = self.closest_parent_route(&request.namespace, &request.host, &request.path) {
            if parent.service() == Some(request.service.as_str()) {
                info!(
                    namespace = %request.namespace,
                    site = %request.site_name,
                    parent = %parent.name,
                    "parent route already serves this site, skipping"
                );
                return Ok(RouteOutcome::Covered { parent: parent.name });
            }
        }

        let name = self.route_name(&request.site_name);
        let object = self.route_object(&name, request)?;
        let outcome = match self.store.create(&object).await {
            Ok(_) => {
                info!(namespace = %request.namespace, route = %name, host = %request.host, "route created");
                RouteOutcome::Created { name: name.clone() }
            }
            Err(e) if e.is_conflict() => {
                debug!(namespace = %request.namespace, route = %name, "route already exists");
                RouteOutcome::AlreadyExists { name: name.clone() }
            }
            Err(e) => return Err(e.into()),
        };
        let spec = object.spec().cloned().unwrap_or(Value::Null);
        self.table.upsert(&request.namespace, &name, &spec);
        Ok(outcome)
    }

    fn route_label(&self, host: &str) -> &str {
        if self.config.external_hosts.iter().any(|h| h == host) {
            &self.config.external_label
        } else {
            &self.config.default_label
        }
    }

    fn route_object(&self, name: &str, request: &RouteRequest) -> RouteResult<ManagedObject> {
        let definition = json!({
            "apiVersion": self.config.route_kind.api_version,
            "kind": self.config.route_kind.kind,
            "metadata": {
                "name": name,
                "namespace": request.namespace,
                "ownerReferences": [request.owner],
                "labels": {
                    "app": self.config.app_label,
                    "route": self.route_label(&request.host),
                },
                "annotations": {
                    "haproxy.router.openshift.io/balance": "roundrobin",
                    "haproxy.router.openshift.io/disable_cookies": "true",
                },
            },
            "spec": {
                "host": request.host,
                "path": request.path,
                "port": {"targetPort": self.config.target_port},
                "tls": {
                    "termination": "edge",
                    "insecureEdgeTerminationPolicy": "Redirect",
                    "destinationCACertificate": "",
                },
                "to": {"kind": "Service", "name": request.service, "weight": 100},
                "alternateBackends": [],
                "wildcardPolicy": "None",
            },
        });
        Ok(ManagedObject::from_definition(definition)?)
    }

    /// Keep the route table current from the store until cancelled.
    pub async fn run(self: Arc<Self>, namespace: Option<String>, cancel: CancellationToken) {
        let mut events = self.store.watch(&self.config.route_kind, namespace.as_deref());
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => self.table.apply(&event),
                Some(Err(e)) => warn!(error = %e, "route watch error"),
                None => {
                    warn!("route watch ended");
                    break;
                }
            }
        }
        debug!("route resolver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpo_store::{InMemoryStore, ObjectRef};

    const NS: &str = "namespace-test";

    fn request(site: &str, host: &str, path: &str, service: &str) -> RouteRequest {
        RouteRequest {
            namespace: NS.into(),
            site_name: site.into(),
            host: host.into(),
            path: path.into(),
            service: service.into(),
            owner: OwnerReference {
                api_version: "wordpress.epfl.ch/v2".into(),
                kind: "WordpressSite".into(),
                name: site.into(),
                uid: format!("{site}-uid"),
            },
        }
    }

    fn resolver(store: &InMemoryStore) -> RouteResolver {
        RouteResolver::new(Arc::new(store.clone())).with_config(RouteConfig {
            external_hosts: vec!["www.epfl.ch".into()],
            ..RouteConfig::default()
        })
    }

    fn route_ref(name: &str) -> ObjectRef {
        ObjectRef::namespaced(RouteConfig::default().route_kind, NS, name)
    }

    #[tokio::test]
    async fn first_site_gets_a_route() {
        let store = InMemoryStore::new();
        let resolver = resolver(&store);

        let outcome = resolver
            .create_route(&request("root", "www.example.com", "", "wp-nginx"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Created { name: "wp-route-root".into() });

        let route = store.get(&route_ref("wp-route-root")).await.unwrap();
        assert_eq!(route.labels().get("route").map(String::as_str), Some("public"));
        assert_eq!(route.owner_uid(), Some("root-uid"));
    }

    #[tokio::test]
    async fn child_site_on_same_service_is_covered() {
        let store = InMemoryStore::new();
        let resolver = resolver(&store);
        resolver
            .create_route(&request("root", "www.example.com", "", "wp-nginx"))
            .await
            .unwrap();

        let outcome = resolver
            .create_route(&request("lab", "www.example.com", "/research/lab", "wp-nginx"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Covered { parent: "wp-route-root".into() });
        assert!(!store.exists(&route_ref("wp-route-lab")).await.unwrap());
    }

    #[tokio::test]
    async fn child_site_on_other_service_gets_its_own_route() {
        let store = InMemoryStore::new();
        let resolver = resolver(&store);
        resolver
            .create_route(&request("root", "www.example.com", "", "legacy-apache"))
            .await
            .unwrap();

        let outcome = resolver
            .create_route(&request("lab", "www.example.com", "/research/lab", "wp-nginx"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Created { name: "wp-route-lab".into() });
    }

    #[tokio::test]
    async fn allowlisted_host_gets_external_label() {
        let store = InMemoryStore::new();
        let resolver = resolver(&store);
        resolver
            .create_route(&request("home", "www.epfl.ch", "/", "wp-nginx"))
            .await
            .unwrap();
        let route = store.get(&route_ref("wp-route-home")).await.unwrap();
        assert_eq!(route.labels().get("route").map(String::as_str), Some("public-cf"));
    }

    #[tokio::test]
    async fn existing_route_is_not_an_error() {
        let store = InMemoryStore::new();
        let first = resolver(&store);
        first
            .create_route(&request("blog", "blog.example.com", "", "wp-nginx"))
            .await
            .unwrap();

        // A fresh resolver has not seen the route yet.
        let second = resolver(&store);
        let outcome = second
            .create_route(&request("blog", "blog.example.com", "", "wp-nginx"))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::AlreadyExists { name: "wp-route-blog".into() });
    }
}
