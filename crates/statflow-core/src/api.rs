//! Typed provider client: request building, response decoding, and usage
//! accounting over the retrying transport.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use statflow_warehouse::{now_rfc3339, UsageRow, Warehouse};

use crate::domain::{CatalogEntry, Granularity, Observation, SeriesKey, TimeWindow};
use crate::error::ApiError;
use crate::http_client::{HttpClient, HttpRequest};
use crate::provider::ProviderSpec;
use crate::rate_limit::RateLimiter;
use crate::transport::{RetryingClient, TransportError};

/// Accounting record for one logical API call, retries folded in.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub provider: String,
    pub dataset: Option<String>,
    pub entry_id: Option<String>,
    pub attempts: i64,
    pub bytes: i64,
    pub errored: bool,
}

/// Destination for usage events. The warehouse is the production sink;
/// tests substitute an in-memory one.
pub trait UsageSink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

impl UsageSink for Warehouse {
    fn record(&self, event: UsageEvent) {
        let row = UsageRow {
            provider: event.provider,
            dataset: event.dataset,
            entry_id: event.entry_id,
            recorded_at: now_rfc3339(),
            attempts: event.attempts,
            bytes: event.bytes,
            errored: event.errored,
        };
        if let Err(error) = self.record_usage(&row) {
            tracing::warn!(%error, "failed to record usage event");
        }
    }
}

/// No-op sink for callers that do not keep a ledger.
#[derive(Debug, Default)]
pub struct DiscardUsage;

impl UsageSink for DiscardUsage {
    fn record(&self, _event: UsageEvent) {}
}

/// Provider response envelope. Agencies wrap results and errors in one
/// shape, and an application-level error can arrive under a 200 status,
/// so both arms are decoded before anything else looks at the body.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    observations: Vec<WireObservation>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireObservation {
    series_key: String,
    period: String,
    value: f64,
    #[serde(default)]
    annotation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: String,
    message: String,
}

/// Typed client for one provider: one method per logical upstream
/// operation, each returning normalized observations or a typed error.
/// Retry and rate limiting live below this layer.
pub struct ProviderClient {
    spec: ProviderSpec,
    transport: RetryingClient,
    usage: Arc<dyn UsageSink>,
}

impl ProviderClient {
    pub fn new(spec: ProviderSpec, http: Arc<dyn HttpClient>, usage: Arc<dyn UsageSink>) -> Self {
        let limiter = Arc::new(RateLimiter::new(spec.ceilings));
        let transport = RetryingClient::new(http, limiter, spec.retry.clone());
        Self {
            spec,
            transport,
            usage,
        }
    }

    /// Build a client sharing an existing limiter. Every dataset hitting
    /// the same provider must go through the same limiter instance.
    pub fn with_limiter(
        spec: ProviderSpec,
        http: Arc<dyn HttpClient>,
        limiter: Arc<RateLimiter>,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        let transport = RetryingClient::new(http, limiter, spec.retry.clone());
        Self {
            spec,
            transport,
            usage,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.spec.id
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.transport.limiter()
    }

    /// All observations for one catalog entry over a year window at one
    /// granularity.
    pub async fn fetch_table(
        &self,
        entry: &CatalogEntry,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<Vec<Observation>, ApiError> {
        let url = format!(
            "{}?method=GetData&dataset={}&table={}&frequency={}&year_start={}&year_end={}{}",
            self.spec.base_url,
            urlencoding::encode(&entry.dataset),
            urlencoding::encode(&entry.entry_id),
            granularity.code(),
            window.start_year,
            window.end_year,
            self.key_param(),
        );
        // Wide windows over many series come back big; quarterly tables
        // routinely run to a few MB.
        let request = HttpRequest::get(url)
            .with_timeout_ms(self.spec.timeout_ms)
            .with_size_hint(2 * 1024 * 1024);
        self.call(request, Some(&entry.dataset), Some(&entry.entry_id))
            .await
    }

    /// Recent observations for one series, newest periods only. Used by
    /// sentinel checks, which never need full history.
    pub async fn fetch_series_recent(
        &self,
        dataset: &str,
        series_key: &SeriesKey,
        recent_years: i32,
    ) -> Result<Vec<Observation>, ApiError> {
        let window = TimeWindow::recent(recent_years);
        let url = format!(
            "{}?method=GetSeries&dataset={}&series={}&year_start={}&year_end={}{}",
            self.spec.base_url,
            urlencoding::encode(dataset),
            urlencoding::encode(series_key.as_str()),
            window.start_year,
            window.end_year,
            self.key_param(),
        );
        let request = HttpRequest::get(url)
            .with_timeout_ms(self.spec.timeout_ms)
            .with_size_hint(64 * 1024);
        self.call(request, Some(dataset), None).await
    }

    fn key_param(&self) -> String {
        self.spec
            .api_key
            .as_deref()
            .map(|key| format!("&api_key={}", urlencoding::encode(key)))
            .unwrap_or_default()
    }

    async fn call(
        &self,
        request: HttpRequest,
        dataset: Option<&str>,
        entry_id: Option<&str>,
    ) -> Result<Vec<Observation>, ApiError> {
        // A locked-out provider fails every reserve for up to an hour.
        // Surface that as a systemic error instead of silently blocking.
        if let Some(remaining) = self.transport.limiter().lockout_remaining() {
            return Err(ApiError::ProviderLockout {
                provider: self.spec.id.clone(),
                remaining_secs: remaining.as_secs(),
            });
        }

        let mut event = UsageEvent {
            provider: self.spec.id.clone(),
            dataset: dataset.map(str::to_string),
            entry_id: entry_id.map(str::to_string),
            attempts: 0,
            bytes: 0,
            errored: false,
        };

        let outcome = self.transport.execute(request).await;
        let result = match outcome {
            Ok(exchange) => {
                event.attempts = i64::from(exchange.attempts);
                event.bytes = exchange.response.body.len() as i64;
                self.decode(&exchange.response.body)
            }
            Err(TransportError::FatalStatus {
                status,
                body,
                attempts,
            }) => {
                event.attempts = i64::from(attempts);
                event.errored = true;
                Err(ApiError::Upstream {
                    provider: self.spec.id.clone(),
                    code: status.to_string(),
                    message: truncate(&body, 200),
                })
            }
            Err(error @ TransportError::RetriesExhausted { attempts, .. }) => {
                event.attempts = i64::from(attempts);
                event.errored = true;
                Err(ApiError::Transport {
                    provider: self.spec.id.clone(),
                    message: error.to_string(),
                })
            }
        };

        if result.is_err() {
            event.errored = true;
        }
        self.usage.record(event);
        result
    }

    fn decode(&self, body: &str) -> Result<Vec<Observation>, ApiError> {
        let envelope: WireEnvelope =
            serde_json::from_str(body).map_err(|error| ApiError::Decode {
                provider: self.spec.id.clone(),
                message: error.to_string(),
            })?;

        if let Some(error) = envelope.error {
            return Err(ApiError::Upstream {
                provider: self.spec.id.clone(),
                code: error.code,
                message: error.message,
            });
        }

        let mut observations = Vec::with_capacity(envelope.observations.len());
        for wire in envelope.observations {
            let series_key =
                SeriesKey::new(&wire.series_key).ok_or_else(|| ApiError::Decode {
                    provider: self.spec.id.clone(),
                    message: format!("invalid series key '{}'", wire.series_key),
                })?;
            let period =
                crate::domain::TimePeriod::from_str(&wire.period).map_err(|error| {
                    ApiError::Decode {
                        provider: self.spec.id.clone(),
                        message: error.to_string(),
                    }
                })?;
            observations.push(Observation {
                series_key,
                period,
                value: wire.value,
                annotation: wire.annotation,
            });
        }
        Ok(observations)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}
