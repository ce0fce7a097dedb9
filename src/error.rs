//! Error types for the Gantry operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant carries contextual information like the machine
//! name, the failing field, and whether the failure is worth retrying.
//!
//! One distinction matters more than any other here: a provider lookup
//! that *fails* is an [`Error::Provider`], never an absent instance.
//! Callers that conflate the two will happily create duplicate
//! infrastructure during an API outage.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Gantry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for Machine specs
    #[error("validation error for {machine}: {message}")]
    Validation {
        /// Name of the machine with invalid configuration
        machine: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.providerConfig.instanceType")
        field: Option<String>,
    },

    /// Infrastructure provider error
    ///
    /// Covers failed instance lookups, creates, terminations, and tag
    /// updates against EC2.
    #[error("provider error for {machine}: {message}")]
    Provider {
        /// Name of the machine being reconciled
        machine: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Recreate was required but refused by the control-plane guard
    #[error("recreate blocked for {machine}: control plane would lose its last member")]
    RecreateBlocked {
        /// Name of the machine whose replacement was refused
        machine: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "actuator")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without machine context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            machine: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with machine context
    pub fn validation_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            machine: machine.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with machine context and field path
    pub fn validation_for_field(
        machine: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            machine: machine.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provider error with the given message
    ///
    /// For simple provider errors without machine context.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            machine: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a provider error with machine context
    pub fn provider_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            machine: machine.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., malformed API response)
    pub fn provider_permanent(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            machine: machine.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a recreate-blocked error for the given machine
    pub fn recreate_blocked(machine: impl Into<String>) -> Self {
        Self::RecreateBlocked {
            machine: machine.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors are not retryable (require a spec fix).
    /// Provider errors carry their own retryability. Recreate-blocked
    /// errors retry because the peer set can change underneath us.
    /// Kubernetes errors depend on the error type.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout)
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::RecreateBlocked { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the machine name if this error is associated with a specific machine
    pub fn machine(&self) -> Option<&str> {
        match self {
            Error::Kube { .. } => None,
            Error::Validation { machine, .. } => Some(machine),
            Error::Provider { machine, .. } => Some(machine),
            Error::RecreateBlocked { machine } => Some(machine),
            Error::Internal { .. } => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
