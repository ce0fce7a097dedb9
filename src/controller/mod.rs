//! Controller implementations for Gantry CRDs
//!
//! This module contains the reconciliation logic for Gantry custom resources.
//! Controllers follow the Kubernetes controller pattern with observe-diff-act loops.

mod machine;

pub use machine::{
    error_policy, reconcile, Context, ContextBuilder, MachineClient, MachineClientImpl,
    MACHINE_FINALIZER,
};
