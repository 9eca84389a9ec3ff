//! Common error types shared across crates.

use thiserror::Error;

/// Top-level topology build error.
///
/// Every variant names the failing entity and the invariant it violated (or the
/// reason it was rejected). Variants map to process exit codes:
/// - [`TopologyError::Config`] → 2
/// - [`TopologyError::Capacity`] → 3
/// - [`TopologyError::Validation`] → 4
/// - [`TopologyError::Substrate`] → 5
/// - [`TopologyError::Timeout`] → 6
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// The caller-supplied topology violates an invariant.
    #[error("config error: {entity}: {invariant}")]
    Config { entity: String, invariant: String },

    /// The requested sizing cannot be satisfied (e.g. CIDR block too small).
    #[error("capacity error: {entity}: {reason}")]
    Capacity { entity: String, reason: String },

    /// A field of an entity is malformed.
    #[error("validation error: {entity}: {reason}")]
    Validation { entity: String, reason: String },

    /// An external collaborator rejected a request. Propagated verbatim.
    #[error("substrate error: {entity}: [{code}] {message}")]
    Substrate {
        entity: String,
        code: String,
        message: String,
    },

    /// A bounded wait elapsed and the build was abandoned.
    #[error("timeout: {entity}: {reason}")]
    Timeout { entity: String, reason: String },
}

impl TopologyError {
    pub fn config(entity: impl Into<String>, invariant: impl Into<String>) -> Self {
        Self::Config {
            entity: entity.into(),
            invariant: invariant.into(),
        }
    }

    pub fn capacity(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Capacity {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn substrate(
        entity: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Substrate {
            entity: entity.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Timeout {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// The entity the error was raised for.
    pub fn entity(&self) -> &str {
        match self {
            TopologyError::Config { entity, .. }
            | TopologyError::Capacity { entity, .. }
            | TopologyError::Validation { entity, .. }
            | TopologyError::Substrate { entity, .. }
            | TopologyError::Timeout { entity, .. } => entity,
        }
    }

    /// Short machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            TopologyError::Config { .. } => "config_error",
            TopologyError::Capacity { .. } => "capacity_error",
            TopologyError::Validation { .. } => "validation_error",
            TopologyError::Substrate { .. } => "substrate_error",
            TopologyError::Timeout { .. } => "timeout_error",
        }
    }

    /// Returns the process exit code that should be used for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            TopologyError::Config { .. } => 2,
            TopologyError::Capacity { .. } => 3,
            TopologyError::Validation { .. } => 4,
            TopologyError::Substrate { .. } => 5,
            TopologyError::Timeout { .. } => 6,
        }
    }
}

/// Result alias used by every topology component.
pub type Result<T, E = TopologyError> = std::result::Result<T, E>;
