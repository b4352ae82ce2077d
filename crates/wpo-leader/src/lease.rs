//! Lease object: settings and the holder record kept in its spec.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use wpo_store::{ApiKind, ManagedObject, ObjectRef, StoreResult};

use crate::error::{LeaderError, LeaderResult};

pub fn lease_kind() -> ApiKind {
    ApiKind::new("coordination.k8s.io/v1", "Lease")
}

/// Leader election timing. Read from the `[leader]` section of the
/// operator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub lock_name: String,
    /// Namespace holding the lease. Defaults to the operator namespace.
    pub namespace: Option<String>,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lock_name: "wp-operator-lock".to_string(),
            namespace: None,
            lease_duration_secs: 17,
            renew_deadline_secs: 15,
            retry_period_secs: 5,
        }
    }
}

impl LeaseConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.renew_deadline_secs)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period_secs)
    }

    /// The holder must be able to renew several times before others may
    /// take the lease over.
    pub fn validate(&self) -> LeaderResult<()> {
        if self.lock_name.is_empty() {
            return Err(LeaderError::Config("lock name is empty".into()));
        }
        if self.retry_period_secs == 0 {
            return Err(LeaderError::Config("retry period must be positive".into()));
        }
        if self.renew_deadline_secs >= self.lease_duration_secs {
            return Err(LeaderError::Config(format!(
                "renew deadline ({}s) must be shorter than the lease duration ({}s)",
                self.renew_deadline_secs, self.lease_duration_secs
            )));
        }
        if self.retry_period_secs >= self.renew_deadline_secs {
            return Err(LeaderError::Config(format!(
                "retry period ({}s) must be shorter than the renew deadline ({}s)",
                self.retry_period_secs, self.renew_deadline_secs
            )));
        }
        Ok(())
    }
}

/// Holder state recorded in a Lease's spec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub lease_duration_secs: i64,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub transitions: i64,
}

impl LeaseRecord {
    pub fn from_object(lease: &ManagedObject) -> LeaderResult<Self> {
        let spec = lease.spec().and_then(Value::as_object).cloned().unwrap_or_default();
        let time = |key: &str| -> LeaderResult<Option<DateTime<Utc>>> {
            match spec.get(key).and_then(Value::as_str) {
                None => Ok(None),
                Some(raw) => DateTime::parse_from_rfc3339(raw)
                    .map(|t| Some(t.with_timezone(&Utc)))
                    .map_err(|e| LeaderError::MalformedLease {
                        lease: lease.moniker(),
                        message: format!("{key}: {e}"),
                    }),
            }
        };
        Ok(Self {
            holder: spec
                .get("holderIdentity")
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
                .map(str::to_string),
            lease_duration_secs: spec.get("leaseDurationSeconds").and_then(Value::as_i64).unwrap_or(0),
            acquire_time: time("acquireTime")?,
            renew_time: time("renewTime")?,
            transitions: spec.get("leaseTransitions").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder.as_deref() == Some(identity)
    }

    /// A lease with no holder, or whose holder stopped renewing for longer
    /// than the lease duration, is free.
    pub fn is_free_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.holder, self.renew_time) {
            (None, _) | (_, None) => true,
            (Some(_), Some(renewed)) => renewed + chrono::Duration::seconds(self.lease_duration_secs) <= now,
        }
    }

    fn spec(&self) -> Value {
        let mut spec = Map::new();
        spec.insert(
            "holderIdentity".into(),
            self.holder.clone().map(Value::String).unwrap_or(Value::Null),
        );
        spec.insert("leaseDurationSeconds".into(), json!(self.lease_duration_secs));
        if let Some(t) = self.acquire_time {
            spec.insert("acquireTime".into(), json!(micro_time(t)));
        }
        if let Some(t) = self.renew_time {
            spec.insert("renewTime".into(), json!(micro_time(t)));
        }
        spec.insert("leaseTransitions".into(), json!(self.transitions));
        Value::Object(spec)
    }

    /// A new Lease carrying this record.
    pub fn to_object(&self, target: &ObjectRef) -> StoreResult<ManagedObject> {
        let mut metadata = Map::new();
        metadata.insert("name".into(), json!(target.name));
        if let Some(ns) = &target.namespace {
            metadata.insert("namespace".into(), json!(ns));
        }
        ManagedObject::from_definition(json!({
            "apiVersion": target.kind.api_version,
            "kind": target.kind.kind,
            "metadata": metadata,
            "spec": self.spec(),
        }))
    }

    /// `current` with its spec replaced by this record. Metadata, including
    /// the resource version, is kept for optimistic concurrency.
    pub fn apply_to(&self, current: &ManagedObject) -> StoreResult<ManagedObject> {
        let spec = self.spec();
        current.map_definition(|d| d["spec"] = spec)
    }
}

/// Kubernetes `MicroTime` rendering.
fn micro_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}
