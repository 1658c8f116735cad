//! Kind classification over the five definition variants.

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// Closed set of definition kinds understood by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    #[serde(rename = "WorkloadDefinition")]
    Workload,
    #[serde(rename = "ComponentDefinition")]
    Component,
    #[serde(rename = "TraitDefinition")]
    Trait,
    #[serde(rename = "PolicyDefinition")]
    Policy,
    #[serde(rename = "WorkflowStepDefinition")]
    WorkflowStep,
}

impl DefinitionKind {
    pub const ALL: [DefinitionKind; 5] = [
        DefinitionKind::Workload,
        DefinitionKind::Component,
        DefinitionKind::Trait,
        DefinitionKind::Policy,
        DefinitionKind::WorkflowStep,
    ];

    /// Map a raw `kind` string to its variant. Exact, case-sensitive match.
    pub fn classify(kind: &str) -> Result<Self, DefinitionError> {
        match kind {
            "WorkloadDefinition" => Ok(Self::Workload),
            "ComponentDefinition" => Ok(Self::Component),
            "TraitDefinition" => Ok(Self::Trait),
            "PolicyDefinition" => Ok(Self::Policy),
            "WorkflowStepDefinition" => Ok(Self::WorkflowStep),
            other => Err(DefinitionError::UnsupportedKind(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workload => "WorkloadDefinition",
            Self::Component => "ComponentDefinition",
            Self::Trait => "TraitDefinition",
            Self::Policy => "PolicyDefinition",
            Self::WorkflowStep => "WorkflowStepDefinition",
        }
    }

    /// Lowercase capability type, used as the schema artifact kind prefix
    /// and as the `definitionType` of revisions.
    pub fn capability_type(&self) -> &'static str {
        match self {
            Self::Workload => "workload",
            Self::Component => "component",
            Self::Trait => "trait",
            Self::Policy => "policy",
            Self::WorkflowStep => "workflowstep",
        }
    }

    pub fn from_capability_type(ty: &str) -> Result<Self, DefinitionError> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.capability_type() == ty)
            .ok_or_else(|| DefinitionError::UnsupportedType(ty.to_string()))
    }

    /// Workload and component definitions share one schematic surface.
    pub fn is_workload_like(&self) -> bool {
        matches!(self, Self::Workload | Self::Component)
    }
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DefinitionKind {
    type Err = DefinitionError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::classify(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_exactly_five_kinds() {
        for k in DefinitionKind::ALL {
            assert_eq!(DefinitionKind::classify(k.as_str()), Ok(k));
        }
        let err = DefinitionKind::classify("traitdefinition").unwrap_err();
        assert_eq!(err, DefinitionError::UnsupportedKind("traitdefinition".into()));
        assert!(err.to_string().contains("traitdefinition"));
        assert!(DefinitionKind::classify("Deployment").is_err());
        assert!(DefinitionKind::classify("").is_err());
    }

    #[test]
    fn capability_type_round_trips() {
        for k in DefinitionKind::ALL {
            assert_eq!(DefinitionKind::from_capability_type(k.capability_type()), Ok(k));
        }
        let e = DefinitionKind::from_capability_type("invalid").unwrap_err();
        assert!(e.to_string().contains("unsupported definition type"));
    }

    #[test]
    fn serializes_as_the_record_kind() {
        assert_eq!(serde_json::to_value(DefinitionKind::WorkflowStep).unwrap(), "WorkflowStepDefinition");
        let k: DefinitionKind = serde_json::from_str("\"TraitDefinition\"").unwrap();
        assert_eq!(k, DefinitionKind::Trait);
    }

    #[test]
    fn only_workload_and_component_are_convertible() {
        assert!(DefinitionKind::Workload.is_workload_like());
        assert!(DefinitionKind::Component.is_workload_like());
        assert!(!DefinitionKind::Trait.is_workload_like());
        assert!(!DefinitionKind::WorkflowStep.is_workload_like());
    }
}
