use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestraError {
    /// Short error code string for operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestraError::Config(_) => "CONFIG_ERROR",
            OrchestraError::Serialization(_) => "SERIALIZATION_ERROR",
            OrchestraError::Io(_) => "IO_ERROR",
            OrchestraError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestraError>;
