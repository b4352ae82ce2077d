//! Multi-document YAML manifests.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::types::ManagedObject;

/// Parse every non-empty document of a YAML stream into an object.
pub fn parse_manifest(text: &str) -> StoreResult<Vec<ManagedObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document).map_err(|e| StoreError::Deserialize(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        objects.push(ManagedObject::from_definition(value)?);
    }
    Ok(objects)
}

/// Read and parse a manifest file.
pub fn load_manifest(path: &Path) -> StoreResult<Vec<ManagedObject>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Invalid(format!("cannot read {}: {e}", path.display())))?;
    parse_manifest(&text)
}

/// Parse a manifest written for `sample_namespace` as if it had been
/// written for `namespace`. Substitution is textual so that names derived
/// from the namespace (role bindings, cluster-scoped objects) follow too.
pub fn parse_manifest_for(text: &str, sample_namespace: &str, namespace: &str) -> StoreResult<Vec<ManagedObject>> {
    parse_manifest(&text.replace(sample_namespace, namespace))
}
