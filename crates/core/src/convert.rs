//! One-way conversion between the two workload-like kinds.

use serde_json::{json, Map, Value as Json};

use crate::{reference, Definition, DefinitionError, DefinitionKind, API_VERSION};

/// Convert a `WorkloadDefinition` into a `ComponentDefinition`.
///
/// The referenced workload name becomes `spec.workload.type`; the schematic is
/// carried over and every other spec field is dropped. There is no inverse.
pub fn workload_to_component(def: &Definition) -> Result<Definition, DefinitionError> {
    if def.kind()? != DefinitionKind::Workload {
        return Err(DefinitionError::UnsupportedKind(format!(
            "{} cannot be converted to ComponentDefinition",
            def.kind_str()
        )));
    }
    let spec = def.spec();
    let mut out_spec = Map::new();
    if let Some(r) = reference::resolve_optional(spec)? {
        out_spec.insert("workload".into(), json!({ "type": r.name }));
    }
    if let Some(s) = spec.get("schematic").filter(|v| !v.is_null()) {
        out_spec.insert("schematic".into(), s.clone());
    }
    let metadata = def.as_value().get("metadata").cloned().unwrap_or_else(|| json!({}));
    Definition::from_value(json!({
        "apiVersion": API_VERSION,
        "kind": DefinitionKind::Component.as_str(),
        "metadata": metadata,
        "spec": Json::Object(out_spec),
    }))
}
