//! Error types for block middleware.
//!
//! This module defines the primary error type, `DaqError`, shared by every
//! crate in the workspace. Using the `thiserror` crate, it provides one
//! consistent place for the failures that requests, sessions and the scan
//! state machine can produce.
//!
//! ## Error Hierarchy
//!
//! The request-level taxonomy:
//!
//! - **`NoSuchPath`**: a request path did not resolve inside a block.
//! - **`NotWritable`**: target exists but is read-only (or a method is currently
//!   disabled by the state machine).
//! - **`NotInvocable`**: `post` addressed something that is not a Method.
//! - **`TypeMismatch`**: a value did not fit the attribute or parameter meta.
//! - **`AmbiguousPut`**: an external write resolved to zero or several fields.
//! - **`UnknownUnit`**: no controller is registered under the MRI.
//! - **`Timeout`**: a lifecycle callback or hook exceeded its bound.
//! - **`Fault`**: the scan state machine entered Fault; carries the cause.
//!
//! Ambient variants cover configuration, I/O, serialization, hardware channels
//! and shutdown. Every variant maps to an [`ErrorKind`], which is what travels
//! inside a `Response::Error`; [`DaqError::from_info`] rebuilds the variant on
//! the receiving side so a parent controller can re-raise a child's exact cause.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type AppResult<T> = std::result::Result<T, DaqError>;

// =============================================================================
// Error Kind
// =============================================================================

/// Transport-neutral discriminant of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoSuchPath,
    NotWritable,
    NotInvocable,
    TypeMismatch,
    AmbiguousPut,
    UnknownUnit,
    Timeout,
    Fault,
    BadValue,
    Aborted,
    InvalidTransition,
    Configuration,
    Channel,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Serializable error payload carried by terminal error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Which variant produced this error.
    pub kind: ErrorKind,
    /// Variant payload, enough to rebuild the original error.
    pub detail: String,
    /// Human-readable message (the `Display` of the original error).
    pub message: String,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// =============================================================================
// DaqError
// =============================================================================

/// The primary error type for block middleware.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Request path does not resolve inside the addressed block.
    ///
    /// Payload is the dotted path that failed, e.g. `"DET.nope.value"`.
    #[error("No such path {0}")]
    NoSuchPath(String),

    /// Attribute is read-only, or method is not writeable in the current state.
    #[error("{0} is not writeable")]
    NotWritable(String),

    /// A `post` addressed a field that is not a Method.
    #[error("{0} is not a Method so cannot be invoked")]
    NotInvocable(String),

    /// Value does not match the declared meta of its target.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// External write touched zero or more than one puttable field.
    #[error("{0}")]
    AmbiguousPut(String),

    /// No controller registered under this MRI.
    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    /// A bounded wait expired. Payload names what was being waited on.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Scan state machine entered Fault.
    ///
    /// `cause` is the message of the error that drove it there. When that
    /// error was itself a child's fault, the child's cause is kept verbatim.
    #[error("Fault: {cause}")]
    Fault {
        /// Originating cause of the fault.
        cause: String,
    },

    /// A value failed a check, e.g. a watched attribute reached a bad state.
    #[error("Bad value: {0}")]
    BadValue(String),

    /// A pending wait or hook was cancelled.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// State machine was asked to move along an edge it does not have.
    #[error("Cannot transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Semantic configuration error, found during validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be parsed or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// File or network I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of a block or request failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hardware channel backend reported a failure.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Anything else; also what ambient errors turn into across a boundary.
    #[error("Internal error: {0}")]
    Internal(String),

    /// One or more participants failed while the process was stopping.
    #[error("Shutdown failed with {} error(s): {}", .0.len(), join_messages(.0))]
    ShutdownFailed(Vec<DaqError>),
}

fn join_messages(errors: &[DaqError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Discriminant used on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::NoSuchPath(_) => ErrorKind::NoSuchPath,
            DaqError::NotWritable(_) => ErrorKind::NotWritable,
            DaqError::NotInvocable(_) => ErrorKind::NotInvocable,
            DaqError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            DaqError::AmbiguousPut(_) => ErrorKind::AmbiguousPut,
            DaqError::UnknownUnit(_) => ErrorKind::UnknownUnit,
            DaqError::Timeout(_) => ErrorKind::Timeout,
            DaqError::Fault { .. } => ErrorKind::Fault,
            DaqError::BadValue(_) => ErrorKind::BadValue,
            DaqError::Aborted(_) => ErrorKind::Aborted,
            DaqError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DaqError::Configuration(_) | DaqError::Config(_) => ErrorKind::Configuration,
            DaqError::Channel(_) => ErrorKind::Channel,
            DaqError::Io(_)
            | DaqError::Serialization(_)
            | DaqError::Internal(_)
            | DaqError::ShutdownFailed(_) => ErrorKind::Internal,
        }
    }

    /// Flatten into the payload carried by `Response::Error`.
    pub fn to_info(&self) -> ErrorInfo {
        let detail = match self {
            DaqError::NoSuchPath(s)
            | DaqError::NotWritable(s)
            | DaqError::NotInvocable(s)
            | DaqError::TypeMismatch(s)
            | DaqError::AmbiguousPut(s)
            | DaqError::UnknownUnit(s)
            | DaqError::Timeout(s)
            | DaqError::BadValue(s)
            | DaqError::Aborted(s)
            | DaqError::Configuration(s)
            | DaqError::Channel(s)
            | DaqError::Internal(s) => s.clone(),
            DaqError::Fault { cause } => cause.clone(),
            DaqError::InvalidTransition { from, to } => format!("{from}->{to}"),
            other => other.to_string(),
        };
        ErrorInfo {
            kind: self.kind(),
            detail,
            message: self.to_string(),
        }
    }

    /// Rebuild an error received from another controller.
    pub fn from_info(info: ErrorInfo) -> Self {
        let ErrorInfo { kind, detail, .. } = info;
        match kind {
            ErrorKind::NoSuchPath => DaqError::NoSuchPath(detail),
            ErrorKind::NotWritable => DaqError::NotWritable(detail),
            ErrorKind::NotInvocable => DaqError::NotInvocable(detail),
            ErrorKind::TypeMismatch => DaqError::TypeMismatch(detail),
            ErrorKind::AmbiguousPut => DaqError::AmbiguousPut(detail),
            ErrorKind::UnknownUnit => DaqError::UnknownUnit(detail),
            ErrorKind::Timeout => DaqError::Timeout(detail),
            ErrorKind::Fault => DaqError::Fault { cause: detail },
            ErrorKind::BadValue => DaqError::BadValue(detail),
            ErrorKind::Aborted => DaqError::Aborted(detail),
            ErrorKind::InvalidTransition => match detail.split_once("->") {
                Some((from, to)) => DaqError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                },
                None => DaqError::Internal(detail),
            },
            ErrorKind::Configuration => DaqError::Configuration(detail),
            ErrorKind::Channel => DaqError::Channel(detail),
            ErrorKind::Internal => DaqError::Internal(detail),
        }
    }

    /// The message a Fault should carry when this error drives a state
    /// machine into Fault. A child's fault keeps its own cause.
    pub fn fault_cause(&self) -> String {
        match self {
            DaqError::Fault { cause } => cause.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_rebuilds_same_variant() {
        let err = DaqError::Fault {
            cause: "DET overheated at step 3".into(),
        };
        let info = err.to_info();
        assert_eq!(info.kind, ErrorKind::Fault);
        assert_eq!(info.message, "Fault: DET overheated at step 3");

        match DaqError::from_info(info) {
            DaqError::Fault { cause } => assert_eq!(cause, "DET overheated at step 3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ambient_errors_cross_as_internal() {
        let io = DaqError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let info = io.to_info();
        assert_eq!(info.kind, ErrorKind::Internal);
        assert!(matches!(DaqError::from_info(info), DaqError::Internal(m) if m.contains("disk gone")));
    }

    #[test]
    fn transition_round_trips() {
        let err = DaqError::InvalidTransition {
            from: "Ready".into(),
            to: "Running".into(),
        };
        let rebuilt = DaqError::from_info(err.to_info());
        assert_eq!(rebuilt.to_string(), "Cannot transition from Ready to Running");
    }

    #[test]
    fn fault_cause_is_not_double_wrapped() {
        let child = DaqError::Fault { cause: "boom".into() };
        assert_eq!(child.fault_cause(), "boom");
        assert_eq!(DaqError::BadValue("x".into()).fault_cause(), "Bad value: x");
    }
}
