//! Error types for the session automation engine.
//!
//! This module defines all errors that can occur while scheduling jobs,
//! acquiring credentials, recognizing devices and talking to them.

use thiserror::Error;

/// Errors that can occur while automating device sessions.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The connection did not produce the expected data in time.
    ///
    /// Timeouts are enforced by the [`Connection`](crate::connection::Connection)
    /// implementation. The error carries the partial output received so far.
    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    /// The remote side closed the stream while we were waiting for data.
    #[error("channel disconnect on wait prompt")]
    ChannelDisconnect,

    /// The device kept asking for credentials, or rejected them.
    #[error("authentication failed for user '{user}'")]
    AuthenticationFailure { user: String },

    /// No driver scored above the selection threshold for a banner.
    ///
    /// Driver selection never fails because of this; it is reported for
    /// diagnostics only and a generic driver is used instead.
    #[error("no driver matches banner: {0}")]
    DriverMismatch(String),

    /// A driver was requested by a name that is not registered.
    #[error("driver not found: {0}")]
    DriverNotFound(String),

    /// A driver with the same name is already registered.
    #[error("driver already registered: {0}")]
    DriverAlreadyRegistered(String),

    /// A driver definition contains invalid patterns or values.
    #[error("invalid driver config: {0}")]
    InvalidDriverConfig(String),

    /// An account identity was requested that the pool does not know.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// An account was requested from a pool that has no accounts.
    #[error("account pool is empty")]
    EmptyAccountPool,

    /// A blocked account acquisition was woken by a shutdown.
    #[error("account acquisition interrupted")]
    AcquisitionInterrupted,

    /// The device answered a command with an error message.
    #[error("command '{command}' failed: {output}")]
    CommandFailed { command: String, output: String },

    /// The job's action returned an error or panicked.
    #[error("job failed: {0}")]
    JobFailure(String),

    /// A job with the same name is already queued or running.
    #[error("job '{0}' is already queued")]
    DuplicateJob(String),

    /// The pipeline no longer accepts work.
    #[error("pipeline closed")]
    PipelineClosed,

    /// Invalid engine configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Invalid regular expression.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    InternalServerError(String),
}

impl FleetError {
    /// Returns true for errors that a retry may resolve.
    ///
    /// Structural errors (unknown account, bad configuration, duplicate
    /// submissions) are surfaced to the caller and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::ConnectionTimeout(_)
                | FleetError::ChannelDisconnect
                | FleetError::AuthenticationFailure { .. }
                | FleetError::CommandFailed { .. }
                | FleetError::JobFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::FleetError;

    #[test]
    fn timeouts_and_job_failures_are_transient() {
        assert!(FleetError::ConnectionTimeout(String::new()).is_transient());
        assert!(FleetError::JobFailure("boom".to_string()).is_transient());
        assert!(
            FleetError::AuthenticationFailure {
                user: "admin".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn structural_errors_are_not_transient() {
        assert!(!FleetError::UnknownAccount("x".to_string()).is_transient());
        assert!(!FleetError::InvalidConfig("x".to_string()).is_transient());
        assert!(!FleetError::DuplicateJob("x".to_string()).is_transient());
        assert!(!FleetError::AcquisitionInterrupted.is_transient());
    }

    #[test]
    fn error_messages_name_the_subject() {
        let err = FleetError::AuthenticationFailure {
            user: "admin".to_string(),
        };
        assert_eq!(err.to_string(), "authentication failed for user 'admin'");
    }
}
