//! Unified error types for the hatchway core crate.
//!
//! The server binary maps these onto session exit codes and one-line
//! diagnostics; inside the core they are propagated with `?`.

use thiserror::Error;

/// Top-level error type encompassing all core error categories.
#[derive(Error, Debug)]
pub enum CoreError {
    /// An instance-manager API error.
    #[error("instance manager: {0}")]
    Incus(#[from] IncusError),

    /// An in-instance exec error.
    #[error("exec: {0}")]
    Exec(#[from] ExecError),

    /// A file push/pull error.
    #[error("file: {0}")]
    File(#[from] FileError),

    /// A configuration error (invalid values, missing fields, parse failures).
    #[error("config error: {0}")]
    Config(String),

    /// A low-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that don't fit other categories.
    #[error("{0}")]
    Other(String),
}

/// Errors talking to the instance manager.
#[derive(Error, Debug)]
pub enum IncusError {
    /// The endpoint could not be reached at all.
    #[error("cannot connect to instance manager: {0}")]
    Connect(String),

    /// Certificate or key material could not be loaded or parsed.
    #[error("client certificate: {0}")]
    Certificate(String),

    /// The API answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The requested instance does not exist.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The requested project does not exist.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// A background operation finished with a failure.
    #[error("operation failed: {0}")]
    Operation(String),

    /// A websocket attached to an operation failed.
    #[error("websocket: {0}")]
    Websocket(String),

    /// The response body could not be decoded.
    #[error("unexpected API response: {0}")]
    Decode(String),

    /// A low-level I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the exec engine.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The exec operation could not be created.
    #[error("failed to start command: {0}")]
    Spawn(String),

    /// A data or control stream broke mid-flight.
    #[error("stream error: {0}")]
    Stream(String),

    /// The remote command failed and left something on stderr.
    #[error("command failed: {stderr}")]
    Remote { exit_code: i32, stderr: String },

    /// The user inside the instance could not be resolved.
    #[error("instance user not found: {0}")]
    UserNotFound(String),
}

/// Errors during instance file transfer.
#[derive(Error, Debug)]
pub enum FileError {
    /// The remote path does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Pushing a file into the instance failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Pulling a file out of the instance failed.
    #[error("download failed: {0}")]
    Download(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incus_error_display() {
        let err = IncusError::InstanceNotFound("web".into());
        assert_eq!(err.to_string(), "instance not found: web");

        let err = IncusError::Api {
            status: 404,
            message: "not found".into(),
        };
        assert_eq!(err.to_string(), "API error (404): not found");
    }

    #[test]
    fn core_error_from_exec_error() {
        let exec_err = ExecError::UserNotFound("dev".into());
        let core_err: CoreError = exec_err.into();
        assert_eq!(core_err.to_string(), "exec: instance user not found: dev");
    }

    #[test]
    fn remote_error_carries_stderr() {
        let err = ExecError::Remote {
            exit_code: 2,
            stderr: "no such file".into(),
        };
        assert_eq!(err.to_string(), "command failed: no such file");
    }
}
