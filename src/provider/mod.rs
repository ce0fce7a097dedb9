//! EC2 instance provider abstraction
//!
//! This module defines the boundary between the reconciliation logic and
//! the cloud provider. The [`InstanceService`] trait covers the four
//! operations reconciliation needs: describe, create, terminate, and tag.
//! [`AwsCliInstanceService`] implements it by shelling out to the `aws`
//! CLI, which keeps the operator free of SDK credential plumbing (the CLI
//! resolves region, profile, and credentials the same way operators do by
//! hand).
//!
//! The describe contract is deliberately strict: `Ok(None)` means the
//! provider positively reported no instance. A lookup that *fails* is an
//! error, and callers must never treat it as absence — doing so would
//! launch a duplicate instance during an API outage.

mod aws_cli;

pub use aws_cli::AwsCliInstanceService;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::crd::Machine;
use crate::Result;

/// EC2 instance lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Instance is launching
    Pending,
    /// Instance is up
    Running,
    /// Termination requested, instance still winding down
    ShuttingDown,
    /// Instance is gone
    Terminated,
    /// Stop requested, instance still winding down
    Stopping,
    /// Instance is stopped but still exists
    Stopped,
}

impl InstanceState {
    /// Returns true if the instance is on its way out
    ///
    /// A terminal instance counts as absent for reconciliation: there is
    /// nothing left worth comparing against and a replacement is due.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl std::str::FromStr for InstanceState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            _ => Err(crate::Error::validation(format!(
                "unknown instance state: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Terminated => write!(f, "terminated"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time snapshot of the EC2 instance backing a machine
///
/// The observed counterpart to
/// [`MachineProviderConfig`](crate::crd::MachineProviderConfig). String
/// fields that EC2 can omit are carried as empty strings, matching how
/// the drift rules treat "no value".
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    /// EC2 instance ID
    pub id: String,
    /// Lifecycle state at observation time
    pub state: InstanceState,
    /// Instance type (e.g., "t2.micro")
    pub instance_type: String,
    /// IAM instance profile name; empty when none is attached
    pub iam_profile: String,
    /// SSH key-pair name, when one was assigned at launch
    pub key_name: Option<String>,
    /// Public IP address; empty when none is assigned
    pub public_ip: String,
    /// Subnet the instance lives in
    pub subnet_id: String,
    /// Instance tags
    pub tags: BTreeMap<String, String>,
}

/// Provider operations needed to reconcile machines
///
/// Implementations talk to the cloud; the trait exists so reconciliation
/// logic can be exercised against mocks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceService: Send + Sync {
    /// Find the instance backing a machine, if one exists
    ///
    /// Returns `Ok(None)` only on a positive "no such instance" answer.
    /// Failed lookups are errors, never `None`.
    async fn describe_instance(&self, machine: &Machine) -> Result<Option<Instance>>;

    /// Launch a new instance for a machine
    async fn create_instance(&self, machine: &Machine) -> Result<Instance>;

    /// Terminate the instance with the given ID
    ///
    /// Terminating an instance that is already gone is not an error.
    async fn terminate_instance(&self, machine: &Machine, instance_id: &str) -> Result<()>;

    /// Apply the given tags to an instance
    async fn update_tags(
        &self,
        machine: &Machine,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    mod instance_state {
        use super::*;

        #[test]
        fn test_from_str_valid() {
            assert_eq!(
                "pending".parse::<InstanceState>().unwrap(),
                InstanceState::Pending
            );
            assert_eq!(
                "running".parse::<InstanceState>().unwrap(),
                InstanceState::Running
            );
            assert_eq!(
                "shutting-down".parse::<InstanceState>().unwrap(),
                InstanceState::ShuttingDown
            );
            assert_eq!(
                "terminated".parse::<InstanceState>().unwrap(),
                InstanceState::Terminated
            );
            assert_eq!(
                "stopping".parse::<InstanceState>().unwrap(),
                InstanceState::Stopping
            );
            assert_eq!(
                "stopped".parse::<InstanceState>().unwrap(),
                InstanceState::Stopped
            );
        }

        #[test]
        fn test_from_str_invalid() {
            let result = "hibernating".parse::<InstanceState>();
            assert!(result.is_err());
            assert!(result
                .unwrap_err()
                .to_string()
                .contains("unknown instance state"));
        }

        #[test]
        fn test_display_matches_ec2_names() {
            assert_eq!(InstanceState::Pending.to_string(), "pending");
            assert_eq!(InstanceState::Running.to_string(), "running");
            assert_eq!(InstanceState::ShuttingDown.to_string(), "shutting-down");
            assert_eq!(InstanceState::Terminated.to_string(), "terminated");
            assert_eq!(InstanceState::Stopping.to_string(), "stopping");
            assert_eq!(InstanceState::Stopped.to_string(), "stopped");
        }

        #[test]
        fn test_display_roundtrips_through_from_str() {
            let states = [
                InstanceState::Pending,
                InstanceState::Running,
                InstanceState::ShuttingDown,
                InstanceState::Terminated,
                InstanceState::Stopping,
                InstanceState::Stopped,
            ];
            for state in states {
                assert_eq!(state.to_string().parse::<InstanceState>().unwrap(), state);
            }
        }

        /// Story: only instances on their way out count as terminal
        ///
        /// A stopped instance still exists and keeps its attributes, so
        /// reconciliation still has something to compare against. Only
        /// shutting-down and terminated instances are beyond recovery.
        #[test]
        fn story_terminal_states_are_shutting_down_and_terminated() {
            assert!(InstanceState::ShuttingDown.is_terminal());
            assert!(InstanceState::Terminated.is_terminal());

            assert!(!InstanceState::Pending.is_terminal());
            assert!(!InstanceState::Running.is_terminal());
            assert!(!InstanceState::Stopping.is_terminal());
            assert!(!InstanceState::Stopped.is_terminal());
        }
    }
}
