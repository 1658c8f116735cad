use smallvec::SmallVec;
use thiserror::Error;

use crate::schematic::SchematicEngine;

/// Errors raised while classifying or decoding a definition record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("not a definition object: {kind}")]
    NotADefinition { kind: String },
    #[error("unsupported definition kind: {0}")]
    UnsupportedKind(String),
    #[error("unsupported definition type: {0}")]
    UnsupportedType(String),
    #[error("{engine} schematic is missing required field `{field}`")]
    MissingField { engine: SchematicEngine, field: &'static str },
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("schematic does not declare a supported engine (expected one of cue, helm, kube, terraform)")]
    NoSupportedSchematic,
    #[error("schematic declares multiple engines ({}); exactly one is allowed", join_engines(.engines))]
    MultipleSchematics { engines: SmallVec<[SchematicEngine; 4]> },
    #[error("definition reference not found (tried spec.reference.name and spec.definitionRef.name)")]
    ReferenceNotFound,
    #[error("{kind} {namespace}/{name} does not have a {engine} template")]
    MissingSchematic { kind: String, namespace: String, name: String, engine: SchematicEngine },
    #[error("malformed object: {0}")]
    MalformedObject(String),
}

fn join_engines(engines: &[SchematicEngine]) -> String {
    engines.iter().map(|e| e.as_str()).collect::<Vec<_>>().join(", ")
}
