//! Machine Custom Resource Definition
//!
//! A Machine is the desired-state record for one cluster member. The
//! controller compares it against the EC2 instance that backs it and
//! converges the two.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, MachinePhase, MachineProviderConfig, MachineVersions};

/// Specification for a Machine
///
/// A machine is either a control-plane member (non-empty control-plane
/// version in `versions`) or a worker. Its `providerConfig` carries the
/// desired EC2 attributes; unset fields are unconstrained.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gantry.dev",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    shortname = "mc",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.providerConfig.instanceType"}"#,
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".status.instanceId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Component versions; the control-plane version marks the role
    pub versions: MachineVersions,

    /// Desired EC2 attributes
    pub provider_config: MachineProviderConfig,
}

impl MachineSpec {
    /// Returns true if this machine is a control-plane member
    pub fn is_control_plane(&self) -> bool {
        self.versions.is_control_plane()
    }

    /// Validate the machine specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.versions.validate()
    }
}

/// Status for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Current phase of the machine lifecycle
    #[serde(default)]
    pub phase: MachinePhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the machine state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// ID of the backing EC2 instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Last observed EC2 lifecycle state (e.g., "pending", "running")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,
}

impl MachineStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: MachinePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: MachinePhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the backing instance identity and return self for chaining
    pub fn instance(mut self, id: impl Into<String>, state: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self.instance_state = Some(state.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Remove existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}
