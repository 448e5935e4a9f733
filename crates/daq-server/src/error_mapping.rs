//! Mapping from `DaqError` to boundary faults.
//!
//! Errors never leave a session as structured internal objects. Whatever the
//! boundary adapter puts on its wire is built from a [`BoundaryFault`]: a
//! coarse status code plus a human-readable message.
//!
//! # Mapping Philosophy
//!
//! - **NotFound**: the request addressed something that does not exist
//! - **InvalidArgument**: client sent bad input (wrong type, ambiguous put, bad value)
//! - **PermissionDenied**: target exists but does not accept the operation now
//! - **FailedPrecondition**: the state machine does not allow the transition
//! - **Unavailable**: hardware channel unreachable
//! - **DeadlineExceeded**: a lifecycle callback or hook exceeded its bound
//! - **Aborted**: the operation was interrupted by an abort or a fault
//! - **Internal**: server-side failures

use std::fmt;

use serde::{Deserialize, Serialize};

use daq_core::error::{DaqError, ErrorKind};

/// Coarse status of a failed boundary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    NotFound,
    InvalidArgument,
    PermissionDenied,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    Aborted,
    Internal,
}

/// Failure as presented to a remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryFault {
    /// Status code.
    pub code: FaultCode,
    /// `"<Kind>: <message>"`.
    pub message: String,
}

impl fmt::Display for BoundaryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for BoundaryFault {}

/// Map a DaqError to the fault a remote client sees.
///
/// # Examples
///
/// ```
/// use daq_core::error::DaqError;
/// use daq_server::error_mapping::{map_daq_error_to_fault, FaultCode};
///
/// let fault = map_daq_error_to_fault(&DaqError::NotInvocable("MOTOR.position".into()));
/// assert_eq!(fault.code, FaultCode::InvalidArgument);
/// assert_eq!(
///     fault.message,
///     "NotInvocable: MOTOR.position is not a Method so cannot be invoked"
/// );
/// ```
pub fn map_daq_error_to_fault(err: &DaqError) -> BoundaryFault {
    let kind = err.kind();
    let code = match kind {
        ErrorKind::NoSuchPath | ErrorKind::UnknownUnit => FaultCode::NotFound,

        ErrorKind::NotInvocable
        | ErrorKind::TypeMismatch
        | ErrorKind::AmbiguousPut
        | ErrorKind::BadValue
        | ErrorKind::Configuration => FaultCode::InvalidArgument,

        ErrorKind::NotWritable => FaultCode::PermissionDenied,
        ErrorKind::InvalidTransition => FaultCode::FailedPrecondition,
        ErrorKind::Channel => FaultCode::Unavailable,
        ErrorKind::Timeout => FaultCode::DeadlineExceeded,
        ErrorKind::Fault | ErrorKind::Aborted => FaultCode::Aborted,
        ErrorKind::Internal => FaultCode::Internal,
    };
    BoundaryFault {
        code,
        message: stringify_error(err),
    }
}

/// `"<Kind>: <message>"`, the only form errors take past the boundary.
pub fn stringify_error(err: &DaqError) -> String {
    format!("{}: {}", err.kind(), err)
}

/// Extension trait for converting `Result<T, DaqError>` to `Result<T, BoundaryFault>`
pub trait DaqResultExt<T> {
    /// Convert a DaqError result to a boundary fault result
    fn map_daq_err(self) -> Result<T, BoundaryFault>;
}

impl<T> DaqResultExt<T> for Result<T, DaqError> {
    fn map_daq_err(self) -> Result<T, BoundaryFault> {
        self.map_err(|err| map_daq_error_to_fault(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_map_to_client_codes() {
        let cases = [
            (DaqError::NoSuchPath("A.x".into()), FaultCode::NotFound),
            (DaqError::UnknownUnit("A".into()), FaultCode::NotFound),
            (DaqError::AmbiguousPut("two fields".into()), FaultCode::InvalidArgument),
            (DaqError::NotWritable("A.x".into()), FaultCode::PermissionDenied),
            (DaqError::Timeout("disconnect".into()), FaultCode::DeadlineExceeded),
            (DaqError::Fault { cause: "overheated".into() }, FaultCode::Aborted),
        ];
        for (err, code) in cases {
            assert_eq!(map_daq_error_to_fault(&err).code, code, "{err}");
        }
    }

    #[test]
    fn fault_message_keeps_the_cause() {
        let fault = map_daq_error_to_fault(&DaqError::Fault {
            cause: "DET overheated at step 3".into(),
        });
        assert!(fault.message.starts_with("Fault: "));
        assert!(fault.message.ends_with("DET overheated at step 3"));
    }

    #[test]
    fn shutdown_failures_are_joined() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Timeout("a".into()),
            DaqError::Internal("b".into()),
        ]);
        let msg = stringify_error(&err);
        assert!(msg.starts_with("Internal: "));
        assert!(msg.contains("; "));
    }
}
