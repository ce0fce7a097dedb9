//! Supporting types for the Machine CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Component versions for a cluster member
///
/// The control-plane version doubles as the role marker: a machine with a
/// non-empty `controlPlane` version hosts control-plane components, one
/// without it is a worker. An empty string is treated the same as absent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MachineVersions {
    /// Kubelet version to run on the node (e.g., "v1.13.0")
    pub kubelet: String,

    /// Control-plane version, present only on control-plane members
    #[serde(
        rename = "controlPlane",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub control_plane: Option<String>,
}

impl MachineVersions {
    /// Returns true if these versions mark a control-plane member
    pub fn is_control_plane(&self) -> bool {
        self.control_plane.as_deref().is_some_and(|v| !v.is_empty())
    }

    /// Validates the version record
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.kubelet.is_empty() {
            return Err(crate::Error::validation("kubelet version must not be empty"));
        }
        Ok(())
    }
}

/// Reference to an existing subnet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SubnetReference {
    /// Subnet ID (e.g., "subnet-abcdef")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Desired EC2 attributes for a machine
///
/// Every field is optional: an unset field means "no constraint" and is
/// never enforced against the running instance. Only fields the operator
/// actually set participate in drift detection. This keeps partial specs
/// honest instead of smuggling defaults in through empty strings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineProviderConfig {
    // ==========================================================================
    // Image and Sizing
    // ==========================================================================
    /// AMI ID to launch from (required at create time)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<String>,

    /// EC2 instance type (e.g., "t2.micro"); immutable once launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    /// Root volume size in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_device_size: Option<i64>,

    // ==========================================================================
    // Identity and Access
    // ==========================================================================
    /// IAM instance profile name; immutable once launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<String>,

    /// SSH key-pair name; immutable once launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    // ==========================================================================
    // Networking
    // ==========================================================================
    /// Whether the instance must have a public IP address
    ///
    /// `true` requires one, `false` forbids one, unset means "don't care".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<bool>,

    /// Subnet to place the instance in; immutable once launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<SubnetReference>,

    /// Security group IDs to attach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,

    // ==========================================================================
    // Tagging
    // ==========================================================================
    /// Tags applied to the instance in addition to the identity tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,
}

impl MachineProviderConfig {
    /// Returns the desired subnet ID, if one was specified
    pub fn subnet_id(&self) -> Option<&str> {
        self.subnet.as_ref().and_then(|s| s.id.as_deref())
    }

    /// Validates that the config is sufficient to launch an instance
    ///
    /// Lookup and drift detection tolerate a fully-empty config, but a
    /// create call needs at least an image and a size.
    pub fn validate_for_create(&self, machine: &str) -> Result<(), crate::Error> {
        if self.ami.as_deref().is_none_or(str::is_empty) {
            return Err(crate::Error::validation_for_field(
                machine,
                "spec.providerConfig.ami",
                "an AMI is required to create an instance",
            ));
        }
        if self.instance_type.as_deref().is_none_or(str::is_empty) {
            return Err(crate::Error::validation_for_field(
                machine,
                "spec.providerConfig.instanceType",
                "an instance type is required to create an instance",
            ));
        }
        Ok(())
    }
}

/// Machine lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum MachinePhase {
    /// Machine is waiting to be reconciled
    #[default]
    Pending,
    /// Backing instance is being created or is booting
    Provisioning,
    /// Backing instance is running and matches the spec
    Running,
    /// Machine was deleted; instance teardown in progress
    Deleting,
    /// Machine has encountered an error
    Failed,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Running => write!(f, "Running"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., InstanceReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}
