//! Typed schematic payloads and their extraction from a definition `spec`.
//!
//! Engines are checked in a fixed priority order (CUE, Helm, Kube, Terraform).
//! Template text is carried opaquely; nothing here interprets it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

use crate::error::DefinitionError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SchematicEngine {
    Cue,
    Helm,
    Kube,
    Terraform,
}

impl SchematicEngine {
    /// Priority order used by [`extract`].
    pub const PRIORITY: [SchematicEngine; 4] = [
        SchematicEngine::Cue,
        SchematicEngine::Helm,
        SchematicEngine::Kube,
        SchematicEngine::Terraform,
    ];

    /// Key of this engine's block under `spec.schematic`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cue => "cue",
            Self::Helm => "helm",
            Self::Kube => "kube",
            Self::Terraform => "terraform",
        }
    }
}

impl std::fmt::Display for SchematicEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cue => "CUE",
            Self::Helm => "Helm",
            Self::Kube => "Kube",
            Self::Terraform => "Terraform",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CueTemplate {
    #[serde(default)]
    pub template: String,
}

/// Helm release coordinates. Optional keys stay `None` when absent so an
/// explicitly empty value survives a round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HelmChart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

impl HelmChart {
    /// Top-level `chart`, else the release's `chart.spec.chart`.
    pub fn chart_name(&self) -> &str {
        if let Some(c) = self.chart.as_deref().filter(|c| !c.is_empty()) {
            return c;
        }
        self.release
            .as_ref()
            .and_then(|r| r.pointer("/chart/spec/chart"))
            .and_then(Json::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KubeTemplate {
    #[serde(default)]
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<Parameter>>,
}

impl KubeTemplate {
    pub fn parameters(&self) -> &[Parameter] { self.parameters.as_deref().unwrap_or(&[]) }
}

/// A declared parameter of a raw manifest template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Declared value type (`string`, `number`, `boolean`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `fieldPaths` and any other keys.
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

impl Parameter {
    pub fn is_required(&self) -> bool { self.required.unwrap_or(false) }
}

/// Terraform module coordinates. Keys other than the modeled ones are kept
/// in `extra` so the block round-trips unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TerraformModule {
    #[serde(default)]
    pub configuration: String,
    /// `hcl` (default), `json` or `remote`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

impl TerraformModule {
    pub fn is_remote(&self) -> bool { self.source_type.as_deref() == Some("remote") }
}

/// Exactly one engine payload. Serializes to the `{cue|helm|kube|terraform: {..}}` layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Schematic {
    Cue(CueTemplate),
    Helm(HelmChart),
    Kube(KubeTemplate),
    Terraform(TerraformModule),
}

impl Schematic {
    pub fn engine(&self) -> SchematicEngine {
        match self {
            Self::Cue(_) => SchematicEngine::Cue,
            Self::Helm(_) => SchematicEngine::Helm,
            Self::Kube(_) => SchematicEngine::Kube,
            Self::Terraform(_) => SchematicEngine::Terraform,
        }
    }

    pub fn cue_template(&self) -> Option<&str> {
        match self {
            Self::Cue(c) => Some(c.template.as_str()),
            _ => None,
        }
    }

    /// Check the engine's required fields.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        match self {
            Self::Cue(c) => require(SchematicEngine::Cue, "template", &c.template),
            Self::Helm(h) => require(SchematicEngine::Helm, "chart", h.chart_name()),
            Self::Kube(k) => {
                require(SchematicEngine::Kube, "template", &k.template)?;
                let mut seen: Vec<&str> = Vec::with_capacity(k.parameters().len());
                for (i, p) in k.parameters().iter().enumerate() {
                    if p.name.is_empty() {
                        return Err(DefinitionError::InvalidField {
                            field: format!("spec.schematic.kube.parameters[{}].name", i),
                            reason: "parameter name must be non-empty".into(),
                        });
                    }
                    if seen.contains(&p.name.as_str()) {
                        return Err(DefinitionError::InvalidField {
                            field: format!("spec.schematic.kube.parameters[{}].name", i),
                            reason: format!("duplicate parameter `{}`", p.name),
                        });
                    }
                    seen.push(&p.name);
                }
                Ok(())
            }
            Self::Terraform(t) => require(SchematicEngine::Terraform, "configuration", &t.configuration),
        }
    }

    pub fn to_value(&self) -> Json {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Stable 64-bit FNV-1a digest of the canonical JSON form, hex encoded.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut h: u64 = 0xcbf29ce484222325;
        for b in bytes { h ^= b as u64; h = h.wrapping_mul(0x100000001b3); }
        format!("{:016x}", h)
    }
}

fn require(engine: SchematicEngine, field: &'static str, value: &str) -> Result<(), DefinitionError> {
    if value.is_empty() {
        return Err(DefinitionError::MissingField { engine, field });
    }
    Ok(())
}

/// The `spec.schematic` map, or `None` when absent or null.
fn schematic_section(spec: &Json) -> Result<Option<&Map<String, Json>>, DefinitionError> {
    match spec.get("schematic") {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Object(m)) => Ok(Some(m)),
        Some(_) => Err(DefinitionError::InvalidField {
            field: "spec.schematic".into(),
            reason: "expected an object".into(),
        }),
    }
}

fn engine_block(section: &Map<String, Json>, engine: SchematicEngine) -> Option<&Json> {
    section.get(engine.as_str()).filter(|v| !v.is_null())
}

fn decode_block(engine: SchematicEngine, block: &Json) -> Result<Schematic, DefinitionError> {
    let invalid = |e: serde_json::Error| DefinitionError::InvalidField {
        field: format!("spec.schematic.{}", engine.as_str()),
        reason: e.to_string(),
    };
    let schematic = match engine {
        SchematicEngine::Cue => Schematic::Cue(CueTemplate::deserialize(block).map_err(invalid)?),
        SchematicEngine::Helm => Schematic::Helm(HelmChart::deserialize(block).map_err(invalid)?),
        SchematicEngine::Kube => Schematic::Kube(KubeTemplate::deserialize(block).map_err(invalid)?),
        SchematicEngine::Terraform => Schematic::Terraform(TerraformModule::deserialize(block).map_err(invalid)?),
    };
    schematic.validate()?;
    Ok(schematic)
}

/// Engines populated under `spec.schematic`, in priority order.
pub fn present_engines(spec: &Json) -> Result<SmallVec<[SchematicEngine; 4]>, DefinitionError> {
    let mut out = SmallVec::new();
    if let Some(section) = schematic_section(spec)? {
        for engine in SchematicEngine::PRIORITY {
            if engine_block(section, engine).is_some() { out.push(engine); }
        }
    }
    Ok(out)
}

/// Return the first engine block present, probing in [`SchematicEngine::PRIORITY`] order.
///
/// `Ok(None)` means the definition has no `schematic` at all; callers that
/// need one raise their own kind-specific error.
pub fn extract(spec: &Json) -> Result<Option<Schematic>, DefinitionError> {
    let Some(section) = schematic_section(spec)? else { return Ok(None) };
    for engine in SchematicEngine::PRIORITY {
        if let Some(block) = engine_block(section, engine) {
            return decode_block(engine, block).map(Some);
        }
    }
    Err(DefinitionError::NoSupportedSchematic)
}

/// Validating variant of [`extract`]: more than one populated engine is rejected.
pub fn decode_schematic(spec: &Json) -> Result<Option<Schematic>, DefinitionError> {
    let engines = present_engines(spec)?;
    if engines.len() > 1 {
        return Err(DefinitionError::MultipleSchematics { engines });
    }
    extract(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cue_template_is_returned_verbatim() {
        let tpl = "parameter: {\n\timage: string\n}\noutput: {}\n  ";
        let spec = json!({ "schematic": { "cue": { "template": tpl } } });
        let s = extract(&spec).unwrap().unwrap();
        assert_eq!(s.cue_template(), Some(tpl));
    }

    #[test]
    fn absent_schematic_is_not_an_error() {
        assert_eq!(extract(&json!({ "reference": { "name": "x" } })).unwrap(), None);
        assert_eq!(extract(&json!({ "schematic": null })).unwrap(), None);
    }

    #[test]
    fn unknown_engine_keys_fail() {
        let err = extract(&json!({ "schematic": { "jsonnet": { "template": "x" } } })).unwrap_err();
        assert_eq!(err, DefinitionError::NoSupportedSchematic);
        let err = extract(&json!({ "schematic": {} })).unwrap_err();
        assert_eq!(err, DefinitionError::NoSupportedSchematic);
    }

    #[test]
    fn required_fields_are_checked_per_engine() {
        let err = extract(&json!({ "schematic": { "cue": {} } })).unwrap_err();
        assert_eq!(err, DefinitionError::MissingField { engine: SchematicEngine::Cue, field: "template" });
        let err = extract(&json!({ "schematic": { "helm": { "repository": "https://charts" } } })).unwrap_err();
        assert_eq!(err, DefinitionError::MissingField { engine: SchematicEngine::Helm, field: "chart" });
        let err = extract(&json!({ "schematic": { "kube": { "template": "kind: x", "parameters": [{ "required": true }] } } })).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidField { ref field, .. } if field.ends_with("parameters[0].name")));
    }

    #[test]
    fn wrong_types_are_reported_with_the_field() {
        let err = extract(&json!({ "schematic": { "cue": { "template": 42 } } })).unwrap_err();
        match err {
            DefinitionError::InvalidField { field, .. } => assert_eq!(field, "spec.schematic.cue"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn extract_prefers_cue_then_helm_then_kube() {
        let spec = json!({ "schematic": {
            "kube": { "template": "kind: ConfigMap" },
            "helm": { "chart": "nginx" },
        }});
        assert_eq!(extract(&spec).unwrap().unwrap().engine(), SchematicEngine::Helm);
    }

    #[test]
    fn decode_rejects_multiple_engines_naming_them() {
        let spec = json!({ "schematic": {
            "cue": { "template": "output: {}" },
            "helm": { "chart": "nginx" },
        }});
        let err = decode_schematic(&spec).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cue") && msg.contains("helm"), "msg={}", msg);
    }

    #[test]
    fn terraform_round_trips_unknown_keys() {
        let block = json!({
            "configuration": "variable \"x\" {}",
            "type": "hcl",
            "providerRef": { "name": "aws", "namespace": "default" },
            "writeConnectionSecretToRef": { "name": "conn" },
        });
        let spec = json!({ "schematic": { "terraform": block.clone() } });
        let s = extract(&spec).unwrap().unwrap();
        assert_eq!(s.to_value(), json!({ "terraform": block }));
    }

    #[test]
    fn explicitly_empty_optional_keys_survive() {
        let tf = json!({ "terraform": { "configuration": "variable \"x\" {}", "type": "", "path": "" } });
        let s = extract(&json!({ "schematic": tf.clone() })).unwrap().unwrap();
        assert_eq!(s.to_value(), tf);

        let helm = json!({ "helm": {
            "release": { "chart": { "spec": { "chart": "podinfo", "version": "5.1.4" } } },
            "repository": { "url": "http://stefanprodan.github.io/podinfo" },
            "version": "",
        }});
        let s = extract(&json!({ "schematic": helm.clone() })).unwrap().unwrap();
        assert_eq!(s.to_value(), helm);
        match &s {
            Schematic::Helm(h) => assert_eq!(h.chart_name(), "podinfo"),
            other => panic!("unexpected {:?}", other),
        }

        let kube = json!({ "kube": { "template": "kind: Deployment", "parameters": [
            { "name": "image", "required": false, "type": "string", "description": "", "fieldPaths": ["spec.image"] },
        ]}});
        let s = extract(&json!({ "schematic": kube.clone() })).unwrap().unwrap();
        assert_eq!(s.to_value(), kube);
    }

    #[test]
    fn fingerprint_tracks_structural_changes() {
        let a = Schematic::Cue(CueTemplate { template: "a: 1".into() });
        let b = Schematic::Cue(CueTemplate { template: "a: 2".into() });
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }
}
