//! Custom error types for the sequencer.
//!
//! This module defines the primary error type, `DaqError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while resolving and executing scans,
//! from structural problems in a step to transient instrument communication failures.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the scan execution taxonomy with the ambient errors of the
//! application:
//!
//! - **`Capability`**: The operation is not permitted by the axis' declared capability
//!   set (e.g. writing a read-only sensor). Never retried; aborts the run.
//! - **`Validation`**: A value falls outside the axis' declared type or domain. Never
//!   retried; aborts the run.
//! - **`StepValidation`**: A step is structurally invalid (e.g. two intents against the
//!   same axis). Raised before any I/O for the step; aborts the run.
//! - **`Driver`**: A transient communication or hardware failure reported by the driver
//!   layer, or an intent timeout. Retried with bounded backoff by the run engine.
//! - **`UnknownAxis`**: A step references an axis path that is not registered. Aborts
//!   the run, since topology errors cannot be repaired mid-run.
//! - **`Config`** / **`Configuration`**: Configuration file parsing and semantic
//!   validation failures.
//! - **`Io`**, **`Serialization`**, **`Persistence`**: Failures while storing records.
//! - **`FeatureNotEnabled`**: A storage backend was configured but compiled out.
//! - **`Engine`**: Misuse of the run engine state machine (starting while running,
//!   starting with an empty queue).
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a driver-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// Lost or garbled communication with the instrument
    Communication,
    /// The operation did not complete within its time budget
    Timeout,
    /// The instrument reported a fault
    Hardware,
    /// The axis did not report settled within the settle budget
    Settle,
    /// Anything the driver could not categorize
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Settle => "settle",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured error reported by the instrument driver layer.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Name of the driver adapter that failed (e.g. "mock", "esp300")
    pub driver_type: String,
    /// Failure category
    pub kind: DriverErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a communication failure.
    pub fn communication(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Communication, message)
    }

    /// Shorthand for a timeout.
    pub fn timeout(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Timeout, message)
    }
}

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the sequencer.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Operation outside the axis' declared capability set.
    #[error("Axis '{axis}' does not support {operation}")]
    Capability {
        /// Axis path
        axis: String,
        /// Rejected operation ("read" or "write")
        operation: &'static str,
    },

    /// Value outside the axis' declared type or domain.
    #[error("Invalid value for axis '{axis}': {reason}")]
    Validation {
        /// Axis path
        axis: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Structurally invalid step, detected before any I/O.
    #[error("Invalid step: {0}")]
    StepValidation(String),

    /// Transient driver failure.
    #[error("{0}")]
    Driver(#[from] DriverError),

    /// Step references an axis path missing from the registry.
    #[error("Unknown axis '{0}'")]
    UnknownAxis(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistence backend failed to store a run.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configured functionality was compiled out.
    #[error("Feature '{0}' is not enabled")]
    FeatureNotEnabled(String),

    /// Run engine used in the wrong state.
    #[error("Run engine error: {0}")]
    Engine(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

/// Serializable classification of a failure, stored in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// See [`DaqError::Capability`]
    Capability,
    /// See [`DaqError::Validation`]
    Validation,
    /// See [`DaqError::StepValidation`]
    StepValidation,
    /// See [`DaqError::Driver`]
    Driver,
    /// See [`DaqError::UnknownAxis`]
    UnknownAxis,
    /// Any ambient error (I/O, configuration, persistence)
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Capability => "capability",
            FailureKind::Validation => "validation",
            FailureKind::StepValidation => "step_validation",
            FailureKind::Driver => "driver",
            FailureKind::UnknownAxis => "unknown_axis",
            FailureKind::Other => "other",
        };
        write!(f, "{}", label)
    }
}

impl DaqError {
    /// Whether the run engine may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, DaqError::Driver(_))
    }

    /// Classification stored alongside recorded failures.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DaqError::Capability { .. } => FailureKind::Capability,
            DaqError::Validation { .. } => FailureKind::Validation,
            DaqError::StepValidation(_) => FailureKind::StepValidation,
            DaqError::Driver(_) => FailureKind::Driver,
            DaqError::UnknownAxis(_) => FailureKind::UnknownAxis,
            _ => FailureKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_are_transient() {
        let err: DaqError = DriverError::communication("mock", "port closed").into();
        assert!(err.is_transient());
        assert_eq!(err.failure_kind(), FailureKind::Driver);
        assert_eq!(
            err.to_string(),
            "Driver 'mock' communication error: port closed"
        );
    }

    #[test]
    fn logic_errors_are_not_transient() {
        let cap = DaqError::Capability {
            axis: "sensor.value".into(),
            operation: "write",
        };
        assert!(!cap.is_transient());
        assert_eq!(cap.failure_kind(), FailureKind::Capability);

        let val = DaqError::Validation {
            axis: "mc.x".into(),
            reason: "out of range".into(),
        };
        assert!(!val.is_transient());
        assert_eq!(val.failure_kind(), FailureKind::Validation);

        assert!(!DaqError::UnknownAxis("nope".into()).is_transient());
        assert!(!DaqError::StepValidation("dup".into()).is_transient());
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::UnknownAxis).unwrap();
        assert_eq!(json, "\"unknown_axis\"");
    }
}
