//! Pure reconciliation core: identity, role, drift, and the next action.
//!
//! Everything here is a total function over its inputs. No I/O, no
//! logging, no shared state, so reconciliation passes for different
//! machines can evaluate concurrently without coordination. The impure
//! parts of a pass (instance lookups, launches, terminations) live in
//! [`crate::provider`] and [`crate::actuator`].
//!
//! The drift rules are deliberately asymmetric: a desired field that is
//! absent or empty never counts as drift, whatever the instance shows.
//! A spec is a partial statement of intent and only the fields the
//! operator actually set are enforced.

use crate::crd::{Machine, MachineProviderConfig};
use crate::provider::Instance;

/// Immutable instance attribute that no longer matches the spec
///
/// These attributes cannot be changed on a live instance; the only fix
/// is termination and relaunch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftField {
    /// EC2 instance type
    InstanceType,
    /// IAM instance profile
    IamProfile,
    /// SSH key-pair name
    KeyName,
    /// Public IP association
    PublicIp,
    /// Subnet placement
    Subnet,
}

impl std::fmt::Display for DriftField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstanceType => write!(f, "instance type"),
            Self::IamProfile => write!(f, "iam profile"),
            Self::KeyName => write!(f, "key pair"),
            Self::PublicIp => write!(f, "public ip"),
            Self::Subnet => write!(f, "subnet"),
        }
    }
}

/// The action a reconciliation pass settled on
///
/// One decision per pass. The controller invokes the action and requeues;
/// nothing here loops or retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineOp {
    /// No live instance backs the machine, launch one
    Create,
    /// Instance matches the spec, nothing to do
    NoOp,
    /// An immutable attribute drifted, terminate and relaunch
    Recreate,
}

impl std::fmt::Display for MachineOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::NoOp => write!(f, "no-op"),
            Self::Recreate => write!(f, "recreate"),
        }
    }
}

/// Whether two machine records refer to the same logical machine
///
/// Identity is the `(name, namespace)` pair and nothing else: two
/// records with different specs still describe the same machine.
/// Comparison is exact, case-sensitive, with no trimming; absent
/// metadata compares as the empty string.
pub fn machines_equal(a: &Machine, b: &Machine) -> bool {
    a.metadata.name.as_deref().unwrap_or_default()
        == b.metadata.name.as_deref().unwrap_or_default()
        && a.metadata.namespace.as_deref().unwrap_or_default()
            == b.metadata.namespace.as_deref().unwrap_or_default()
}

/// The control-plane members of a machine collection
///
/// A machine qualifies iff its control-plane version is a non-empty
/// string. The result is always a (possibly empty) vector; callers
/// should treat it as a set and not depend on ordering.
pub fn control_plane_machines(machines: &[Machine]) -> Vec<&Machine> {
    machines.iter().filter(|m| m.spec.is_control_plane()).collect()
}

/// True when the desired value is set, non-empty, and disagrees
fn desired_differs(desired: Option<&str>, observed: &str) -> bool {
    desired.is_some_and(|d| !d.is_empty() && d != observed)
}

/// First immutable attribute where the instance disagrees with the spec
///
/// Attributes are OR-combined; any single mismatch means the instance
/// must be replaced, so evaluation stops at the first one. The returned
/// field is diagnostic only and callers must not depend on which of
/// several simultaneous mismatches is reported.
///
/// Mismatch rules per attribute:
/// - instance type, IAM profile, key pair, subnet: non-empty desired
///   value differs from the observed string. An instance launched
///   without a key pair observes as the empty string.
/// - public IP: `Some(true)` requires a non-empty observed address,
///   `Some(false)` requires an empty one, `None` never mismatches.
pub fn immutable_drift(desired: &MachineProviderConfig, observed: &Instance) -> Option<DriftField> {
    if desired_differs(desired.instance_type.as_deref(), &observed.instance_type) {
        return Some(DriftField::InstanceType);
    }
    if desired_differs(desired.iam_instance_profile.as_deref(), &observed.iam_profile) {
        return Some(DriftField::IamProfile);
    }
    if desired_differs(
        desired.key_name.as_deref(),
        observed.key_name.as_deref().unwrap_or_default(),
    ) {
        return Some(DriftField::KeyName);
    }
    match desired.public_ip {
        Some(true) if observed.public_ip.is_empty() => return Some(DriftField::PublicIp),
        Some(false) if !observed.public_ip.is_empty() => return Some(DriftField::PublicIp),
        _ => {}
    }
    if desired_differs(desired.subnet_id(), &observed.subnet_id) {
        return Some(DriftField::Subnet);
    }
    None
}

/// Boolean form of [`immutable_drift`]
pub fn immutable_state_changed(desired: &MachineProviderConfig, observed: &Instance) -> bool {
    immutable_drift(desired, observed).is_some()
}

/// Decide the next action for a machine given its observed instance
///
/// `observed` must be `None` only on a positive "no instance" answer;
/// a failed lookup has to surface as an error upstream, never as an
/// absence, or an outage turns into duplicate instances.
pub fn plan(desired: &MachineProviderConfig, observed: Option<&Instance>) -> MachineOp {
    match observed {
        None => MachineOp::Create,
        Some(instance) => match immutable_drift(desired, instance) {
            Some(_) => MachineOp::Recreate,
            None => MachineOp::NoOp,
        },
    }
}
