//! Error types for the SFTP test fixture

use thiserror::Error;

/// Result type alias for fixture operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fixture error types
///
/// Filesystem failures carry the virtual path they refer to so tests can
/// assert on the exact location that misbehaved.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error, e.g. from reading an upload stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The managed scope has ended; the facade must not be used anymore
    #[error("failed to {action} because the SFTP server scope is already finished")]
    Finished {
        /// The operation that was attempted on the finished scope
        action: &'static str,
    },

    /// Port outside the valid range was requested
    #[error("port cannot be set to {port} because only ports between 1 and 65535 are valid")]
    InvalidPort {
        /// The rejected port value
        port: u16,
    },

    /// No file or directory exists at the given virtual path
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// A node already exists at the given virtual path
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// A path component that must be a directory is a regular file
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation was attempted on a directory
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A directory slated for removal still has children
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// The operation is not allowed, e.g. removing a filesystem root
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The virtual filesystem has been closed by scope teardown
    #[error("the virtual filesystem is closed")]
    FilesystemClosed,

    /// Invalid or already-closed SFTP handle
    #[error("invalid file handle: {0}")]
    InvalidHandle(String),

    /// SFTP protocol violation or malformed packet
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// The listener is gone because an earlier restart failed
    #[error("the SFTP server is not running because an earlier restart failed")]
    NotRunning,

    /// `stop` or `start` failed while changing the port
    #[error("the SFTP server cannot be restarted")]
    Restart(#[source] Box<Error>),
}

impl Error {
    /// Check whether the error means "no such file or directory".
    ///
    /// Tests use this to assert on file-absent scenarios without matching
    /// on message text.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check whether the error is a lifecycle state error.
    pub fn is_state_error(&self) -> bool {
        matches!(self, Error::Finished { .. } | Error::NotRunning | Error::Restart(_))
    }

    /// Get the error code for an SFTP STATUS message
    pub fn to_status_code(&self) -> u32 {
        use crate::protocol::StatusCode;

        match self {
            Error::NotFound(_) => StatusCode::NoSuchFile as u32,
            Error::PermissionDenied(_) => StatusCode::PermissionDenied as u32,
            Error::Protocol(_) | Error::InvalidHandle(_) => StatusCode::BadMessage as u32,
            Error::Ssh(_) => StatusCode::ConnectionLost as u32,
            _ => StatusCode::Failure as u32,
        }
    }

    /// Create a restart error wrapping the underlying failure
    pub fn restart(cause: Error) -> Self {
        Error::Restart(Box::new(cause))
    }

    /// Create an invalid handle error
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("/a".into()).is_not_found());
        assert!(!Error::IsADirectory("/a".into()).is_not_found());
        assert!(!Error::FilesystemClosed.is_not_found());
    }

    #[test]
    fn test_is_state_error() {
        assert!(Error::Finished { action: "set port" }.is_state_error());
        assert!(Error::NotRunning.is_state_error());
        assert!(Error::restart(Error::NotRunning).is_state_error());
        assert!(!Error::NotFound("/a".into()).is_state_error());
    }

    #[test]
    fn test_finished_message_names_the_action() {
        let err = Error::Finished { action: "upload file" };
        assert_eq!(
            err.to_string(),
            "failed to upload file because the SFTP server scope is already finished"
        );
    }

    #[test]
    fn test_invalid_port_message_states_value_and_range() {
        let err = Error::InvalidPort { port: 0 };
        let msg = err.to_string();
        assert!(msg.contains("0"));
        assert!(msg.contains("between 1 and 65535"));
    }

    #[test]
    fn test_to_status_code() {
        use crate::protocol::StatusCode;

        assert_eq!(
            Error::NotFound("/x".into()).to_status_code(),
            StatusCode::NoSuchFile as u32
        );
        assert_eq!(
            Error::PermissionDenied("/".into()).to_status_code(),
            StatusCode::PermissionDenied as u32
        );
        assert_eq!(
            Error::invalid_handle("gone").to_status_code(),
            StatusCode::BadMessage as u32
        );
        assert_eq!(
            Error::FilesystemClosed.to_status_code(),
            StatusCode::Failure as u32
        );
    }
}
