use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Collect(#[from] statflow_core::CollectError),

    #[error(transparent)]
    Store(#[from] statflow_warehouse::WarehouseError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 2,
            Self::Collect(_) => 4,
            Self::Store(_) | Self::Serialization(_) | Self::Io(_) => 10,
        }
    }
}
