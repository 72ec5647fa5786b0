use std::io;
use std::time::Duration;

use thiserror::Error;
use tonic::Status;

use crate::service::ErrorKind;

pub type RelayResult<T> = Result<T, RelayError>;

/// Errors raised by the relay. Everything except `Config` is local to one
/// session and never takes the server down.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to start transcoder: {reason}")]
    ProcessSpawn { reason: String },

    #[error("input queue full ({capacity} chunks), {dropped} chunk(s) dropped so far")]
    BackpressureOverflow { capacity: usize, dropped: u64 },

    #[error("transcoder exited unexpectedly with {}", describe_exit(.code))]
    UnexpectedProcessExit { code: Option<i32> },

    #[error("transcoder ignored end-of-input, terminated forcibly within {grace:?}")]
    TeardownTimeout { grace: Duration },

    #[error("transcoder input closed: {0}")]
    InputClosed(#[source] io::Error),

    #[error("invalid configuration for {key}: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("upload processing failed: {reason}")]
    Upload { reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    pub fn config(key: &'static str, reason: impl Into<String>) -> Self {
        RelayError::Config {
            key,
            reason: reason.into(),
        }
    }

    pub fn upload(reason: impl Into<String>) -> Self {
        RelayError::Upload {
            reason: reason.into(),
        }
    }

    /// Wire representation reported to the client on the session stream.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::ProcessSpawn { .. } => ErrorKind::ProcessSpawn,
            RelayError::BackpressureOverflow { .. } => ErrorKind::BackpressureOverflow,
            RelayError::UnexpectedProcessExit { .. } => ErrorKind::UnexpectedProcessExit,
            RelayError::TeardownTimeout { .. } => ErrorKind::TeardownTimeout,
            RelayError::InputClosed(_) => ErrorKind::InputClosed,
            RelayError::Config { .. } | RelayError::Upload { .. } | RelayError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl From<RelayError> for Status {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Upload { reason } => {
                Status::internal(format!("Processing failed: {}", reason))
            }
            RelayError::Config { .. } => Status::failed_precondition(err.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}
