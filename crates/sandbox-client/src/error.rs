//! Error taxonomy and the single translation point for status signals.
//!
//! Every wire status and every control-plane HTTP status is mapped here and
//! nowhere else; no other module interprets raw codes.

use std::time::Duration;

use sandbox_proto::{Status, WireError};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the SDK.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid user: {0}")]
    InvalidUser(String),

    #[error("not enough disk space: {0}")]
    NotEnoughDiskSpace(String),

    /// A per-call deadline elapsed on the client side.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// An overall operation deadline (e.g. a watch duration) elapsed.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The remote sandbox itself timed out or was paused, as opposed to a
    /// generic connectivity failure.
    #[error("{0}; the sandbox has likely reached its timeout; extend it with set_timeout")]
    SandboxExpired(String),

    /// A foreground `run` completed with a nonzero exit code.
    #[error("command exited with code {exit_code}: {stderr}")]
    CommandExit {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// An operation was attempted on a handle after its terminal `stop`.
    #[error("{0} handle is closed")]
    HandleClosed(&'static str),

    /// The connection was explicitly closed by this client.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection failed and could not be re-established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Catch-all for unmapped daemon or control-plane failures.
    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl Error {
    /// Translate a wire-level error into the public taxonomy.
    ///
    /// The match is exhaustive over [`Status`]: adding a status code without
    /// deciding its mapping is a compile error.
    pub(crate) fn from_wire(err: WireError) -> Self {
        match err.status() {
            Status::InvalidArgument => Error::InvalidArgument(err.message),
            Status::Authentication => Error::Authentication(err.message),
            Status::NotFound => Error::NotFound(err.message),
            Status::InvalidPath => Error::InvalidPath(err.message),
            Status::InvalidUser => Error::InvalidUser(err.message),
            Status::NotEnoughDiskSpace => Error::NotEnoughDiskSpace(err.message),
            Status::SandboxGone => Error::SandboxExpired(err.message),
            Status::Internal => Error::Sandbox(err.message),
            Status::Other(code) => {
                Error::Sandbox(format!("unmapped status {code}: {}", err.message))
            }
        }
    }

    /// Translate a control-plane HTTP status into the public taxonomy.
    pub(crate) fn from_http(status: u16, message: String) -> Self {
        match status {
            400 => Error::InvalidArgument(message),
            401 | 403 => Error::Authentication(message),
            404 => Error::NotFound(message),
            507 => Error::NotEnoughDiskSpace(message),
            other => Error::Sandbox(format!("api error (status {other}): {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_proto::Status;

    fn wire(status: Status) -> Error {
        Error::from_wire(WireError::new(status, "boom"))
    }

    #[test]
    fn wire_status_mapping() {
        assert!(matches!(wire(Status::InvalidArgument), Error::InvalidArgument(_)));
        assert!(matches!(wire(Status::Authentication), Error::Authentication(_)));
        assert!(matches!(wire(Status::NotFound), Error::NotFound(_)));
        assert!(matches!(wire(Status::InvalidPath), Error::InvalidPath(_)));
        assert!(matches!(wire(Status::InvalidUser), Error::InvalidUser(_)));
        assert!(matches!(
            wire(Status::NotEnoughDiskSpace),
            Error::NotEnoughDiskSpace(_)
        ));
        assert!(matches!(wire(Status::SandboxGone), Error::SandboxExpired(_)));
        assert!(matches!(wire(Status::Internal), Error::Sandbox(_)));
    }

    #[test]
    fn unknown_status_preserved_in_message() {
        let err = wire(Status::Other(4242));
        match err {
            Error::Sandbox(msg) => {
                assert!(msg.contains("4242"));
                assert!(msg.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn http_status_mapping() {
        assert!(matches!(
            Error::from_http(400, String::new()),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            Error::from_http(401, String::new()),
            Error::Authentication(_)
        ));
        assert!(matches!(
            Error::from_http(403, String::new()),
            Error::Authentication(_)
        ));
        assert!(matches!(
            Error::from_http(404, String::new()),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::from_http(507, String::new()),
            Error::NotEnoughDiskSpace(_)
        ));
        assert!(matches!(
            Error::from_http(500, String::new()),
            Error::Sandbox(_)
        ));
    }

    #[test]
    fn expired_message_points_at_timeout_setting() {
        let err = wire(Status::SandboxGone);
        assert!(err.to_string().contains("set_timeout"));
    }
}
