use thiserror::Error;

use marionette::ClientError;

#[derive(Debug, Error)]
pub enum CtlError {
    /// Bad command line. Exits with status 2.
    #[error("{0}")]
    Usage(String),

    #[error("params must be a JSON object: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl CtlError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::InvalidParams(_) => 2,
            Self::Client(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CtlError>;
