//! Custom Resource Definitions for Gantry
//!
//! This module contains the Machine CRD and its supporting types.

mod machine;
mod types;

pub use machine::{Machine, MachineSpec, MachineStatus};
pub use types::{
    Condition, ConditionStatus, MachinePhase, MachineProviderConfig, MachineVersions,
    SubnetReference,
};
