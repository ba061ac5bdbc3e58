//! Provider endpoint descriptions and their published quotas.

use std::env;
use std::time::Duration;

use crate::rate_limit::RateCeilings;
use crate::retry::RetryConfig;

/// Everything needed to talk to one upstream statistical agency: endpoint,
/// credentials, quotas, and retry behavior. Rate limits are per provider,
/// so every dataset hitting the same provider shares one limiter built from
/// these ceilings.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub id: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub ceilings: RateCeilings,
    pub retry: RetryConfig,
}

impl ProviderSpec {
    /// The Bureau of Economic Analysis API. Published limits: 100 requests
    /// and 100MB per minute, 30 errors per minute, one-hour lockout on
    /// breach.
    pub fn bea() -> Self {
        Self {
            id: String::from("bea"),
            base_url: String::from("https://apps.bea.gov/api/data"),
            api_key: env::var("STATFLOW_BEA_API_KEY").ok(),
            timeout_ms: 30_000,
            ceilings: RateCeilings {
                max_requests_per_minute: 100,
                max_bytes_per_minute: 100 * 1024 * 1024,
                max_errors_per_minute: 30,
                lockout: Duration::from_secs(60 * 60),
            },
            retry: RetryConfig::default(),
        }
    }

    /// The Bureau of Labor Statistics API. BLS publishes a daily quota
    /// rather than a per-minute one, so the per-minute ceilings here are
    /// self-imposed pacing.
    pub fn bls() -> Self {
        Self {
            id: String::from("bls"),
            base_url: String::from("https://api.bls.gov/publicAPI/v2/timeseries/data"),
            api_key: env::var("STATFLOW_BLS_API_KEY").ok(),
            timeout_ms: 30_000,
            ceilings: RateCeilings {
                max_requests_per_minute: 30,
                max_bytes_per_minute: 20 * 1024 * 1024,
                max_errors_per_minute: 10,
                lockout: Duration::from_secs(30 * 60),
            },
            retry: RetryConfig::default(),
        }
    }

    /// Look a built-in provider up by id.
    pub fn builtin(id: &str) -> Option<Self> {
        match id {
            "bea" => Some(Self::bea()),
            "bls" => Some(Self::bls()),
            _ => None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}
