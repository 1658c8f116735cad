//! Cross-definition references (`spec.reference` / `spec.definitionRef`).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::DefinitionError;

/// Name of a referenced definition; an empty `version` means "latest".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl DefinitionReference {
    pub fn is_latest(&self) -> bool { self.version.is_empty() }
}

/// Lookup order; `reference` wins when both are set.
const REFERENCE_FIELDS: [&str; 2] = ["reference", "definitionRef"];

fn string_field(block: &Json, parent: &str, key: &str) -> Result<Option<String>, DefinitionError> {
    match block.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DefinitionError::InvalidField {
            field: format!("spec.{}.{}", parent, key),
            reason: "expected a string".into(),
        }),
    }
}

/// Like [`resolve_reference`] but absence of both forms is `Ok(None)`.
pub fn resolve_optional(spec: &Json) -> Result<Option<DefinitionReference>, DefinitionError> {
    for field in REFERENCE_FIELDS {
        let Some(block) = spec.get(field).filter(|v| v.is_object()) else { continue };
        let name = string_field(block, field, "name")?.unwrap_or_default();
        if name.is_empty() { continue; }
        let version = string_field(block, field, "version")?.unwrap_or_default();
        return Ok(Some(DefinitionReference { name, version }));
    }
    Ok(None)
}

pub fn resolve_reference(spec: &Json) -> Result<DefinitionReference, DefinitionError> {
    resolve_optional(spec)?.ok_or(DefinitionError::ReferenceNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_both_field_names() {
        let a = resolve_reference(&json!({ "reference": { "name": "deployments.apps" } })).unwrap();
        assert_eq!(a.name, "deployments.apps");
        assert!(a.is_latest());
        let b = resolve_reference(&json!({ "definitionRef": { "name": "foo.example.com", "version": "v1" } })).unwrap();
        assert_eq!(b, DefinitionReference { name: "foo.example.com".into(), version: "v1".into() });
    }

    #[test]
    fn prefers_reference_over_definition_ref() {
        let spec = json!({
            "definitionRef": { "name": "second" },
            "reference": { "name": "first" },
        });
        assert_eq!(resolve_reference(&spec).unwrap().name, "first");
    }

    #[test]
    fn empty_name_falls_through() {
        let spec = json!({ "reference": { "name": "" }, "definitionRef": { "name": "fallback" } });
        assert_eq!(resolve_reference(&spec).unwrap().name, "fallback");
    }

    #[test]
    fn missing_reference_is_an_error_only_when_required() {
        let spec = json!({ "schematic": { "cue": { "template": "x: 1" } } });
        assert_eq!(resolve_reference(&spec).unwrap_err(), DefinitionError::ReferenceNotFound);
        assert_eq!(resolve_optional(&spec).unwrap(), None);
    }

    #[test]
    fn non_string_version_is_invalid() {
        let err = resolve_reference(&json!({ "reference": { "name": "a", "version": 2 } })).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidField { .. }));
    }
}
