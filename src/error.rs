//! Error types shared by the broker and the probe workers

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::ParamError;

/// HTTP-style code used for locally generated timeouts
pub const TIMEOUT_CODE: i32 = 504;

/// HTTP-style code used when the collector could not be reached at all
pub const INTERNAL_CODE: i32 = 500;

/// HTTP-style code used when a request could not be encoded
pub const BAD_REQUEST_CODE: i32 = 400;

/// Error object as it travels on the wire: `{"code": .., "message": ..}`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RuntimeError {
    #[serde(default)]
    pub code: i32,

    #[serde(default)]
    pub message: String,
}

impl RuntimeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(TIMEOUT_CODE, "time out")
    }

    /// An error object with neither code nor message carries no error
    pub fn is_empty(&self) -> bool {
        self.code == 0 && self.message.is_empty()
    }
}

pub type SamplingResult<T> = Result<T, SamplingError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplingError {
    #[error("it is already closed.")]
    Closed,

    #[error("it is already exists.")]
    AlreadyExists,

    #[error("time out")]
    Timeout,

    /// Relayed verbatim from the collector or the probe medium
    #[error(transparent)]
    Transport(#[from] RuntimeError),

    #[error("'{0}' is required.")]
    Required(String),

    #[error("{0}")]
    BadRequest(String),

    /// Not a failure: no data yet, retry later
    #[error("sampled is pending.")]
    Pending,
}

impl SamplingError {
    pub fn is_pending(&self) -> bool {
        matches!(self, SamplingError::Pending)
    }

    /// HTTP-style code, for callers that report errors as status codes
    pub fn code(&self) -> i32 {
        match self {
            SamplingError::Closed => 503,
            SamplingError::AlreadyExists => 409,
            SamplingError::Timeout => TIMEOUT_CODE,
            SamplingError::Transport(e) => e.code,
            SamplingError::Required(_) | SamplingError::BadRequest(_) => BAD_REQUEST_CODE,
            SamplingError::Pending => 202,
        }
    }
}

impl From<ParamError> for SamplingError {
    fn from(err: ParamError) -> Self {
        match err {
            ParamError::NotFound(key) => SamplingError::Required(key),
            e @ ParamError::TypeMismatch { .. } => SamplingError::BadRequest(e.to_string()),
        }
    }
}
