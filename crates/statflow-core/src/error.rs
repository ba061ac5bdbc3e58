use thiserror::Error;

/// Errors surfaced by provider API calls after transport and retry handling.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The request could not be completed even after retries.
    #[error("transport failure talking to {provider}: {message}")]
    Transport { provider: String, message: String },
    /// The provider answered but reported an application-level error.
    #[error("{provider} rejected the request (code {code}): {message}")]
    Upstream {
        provider: String,
        code: String,
        message: String,
    },
    /// The provider's error ceiling tripped and calls are locked out.
    #[error("{provider} is locked out for {remaining_secs}s after repeated errors")]
    ProviderLockout {
        provider: String,
        remaining_secs: u64,
    },
    /// The response body could not be decoded into observations.
    #[error("could not decode {provider} response: {message}")]
    Decode { provider: String, message: String },
}

impl ApiError {
    /// Lockouts poison every subsequent call in a run, so the caller should
    /// stop instead of walking the remaining entries into the same wall.
    pub const fn is_systemic(&self) -> bool {
        matches!(self, Self::ProviderLockout { .. })
    }
}

/// Errors surfaced by collection runs and the task runner.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] statflow_warehouse::WarehouseError),
    #[error("dataset '{dataset}' already has run {run_id} in flight")]
    AlreadyRunning { dataset: String, run_id: String },
    #[error("no run found with id '{run_id}'")]
    RunNotFound { run_id: String },
    #[error("dataset '{dataset}' is not registered with the runner")]
    UnknownDataset { dataset: String },
}
