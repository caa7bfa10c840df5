use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] chainvalue_core::ValidationError),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("fixture error: {0}")]
    Fixture(String),

    #[error(transparent)]
    Store(#[from] chainvalue_store::DuckStoreError),

    #[error(transparent)]
    Engine(#[from] chainvalue_core::EngineError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Usage(_) => 2,
            Self::Fixture(_) => 2,
            Self::Serialization(_) => 4,
            Self::Store(_) => 6,
            Self::Engine(_) => 7,
            Self::Io(_) => 10,
        }
    }
}
