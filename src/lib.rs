//! Gantry - CRD-driven Kubernetes operator for EC2 machine lifecycle management
//!
//! Gantry keeps a declared set of cluster machines in step with the EC2
//! instances that back them. Each Machine resource names one desired
//! node; the controller launches an instance for it, watches for drift
//! from the spec, and replaces or retags the instance as needed.
//!
//! # Architecture
//!
//! Reconciliation is split into three layers:
//! - The controller (Kubernetes-facing): finalizers, status, requeue policy
//! - The actuator (provider-facing): exists/create/update/delete on instances
//! - The planner (pure): compares a spec with an observed instance and
//!   decides create, no-op, or recreate without any I/O
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Machine and supporting types)
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`machine`] - Pure comparison and planning over machines and instances
//! - [`actuator`] - Provider-facing machine operations
//! - [`provider`] - Instance service abstraction and the AWS CLI backend
//! - [`retry`] - Bounded retry with exponential backoff
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod actuator;
pub mod controller;
pub mod crd;
pub mod error;
pub mod machine;
pub mod provider;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Instance Identity Tags
// =============================================================================
// Instances carry no Kubernetes identity of their own; these tags tie an
// EC2 instance back to the Machine that owns it. Lookup filters on both,
// so two machines with the same name in different namespaces never see
// each other's instances.

/// Tag holding the owning machine's name
pub const MACHINE_NAME_TAG: &str = "Name";

/// Tag holding the owning machine's namespace
pub const MACHINE_NAMESPACE_TAG: &str = "gantry.dev/namespace";
