//! Shared fixtures for the behavior tests: a temp-dir warehouse, scripted
//! HTTP transports, and catalog builders.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use statflow_core::{
    HttpClient, HttpError, HttpRequest, HttpResponse, ProviderSpec, RateCeilings, RetryConfig,
};
use statflow_warehouse::{CatalogRow, Warehouse};
use tempfile::TempDir;

pub use std::sync::Arc;

/// Fresh warehouse in a temp dir. Keep the `TempDir` alive for the test's
/// duration.
pub fn open_temp_store() -> (TempDir, Warehouse) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Warehouse::open_in_dir(temp.path()).expect("warehouse open");
    (temp, store)
}

/// Provider spec pointing at a fake endpoint with ceilings roomy enough
/// that tests never sleep on the limiter.
pub fn test_provider() -> ProviderSpec {
    ProviderSpec::bea()
        .with_base_url("https://provider.test/api")
        .with_api_key("test-key")
}

/// Same endpoint but with a hair-trigger error ceiling, for lockout tests.
pub fn trigger_happy_provider() -> ProviderSpec {
    let mut spec = test_provider();
    spec.ceilings = RateCeilings {
        max_requests_per_minute: 1_000,
        max_bytes_per_minute: u64::MAX,
        max_errors_per_minute: 1,
        lockout: Duration::from_secs(3_600),
    };
    spec.retry = RetryConfig {
        max_retries: 0,
        ..RetryConfig::default()
    };
    spec
}

/// JSON body in the provider envelope shape.
pub fn observation_body(rows: &[(&str, &str, f64)]) -> String {
    let observations: Vec<serde_json::Value> = rows
        .iter()
        .map(|(series_key, period, value)| {
            serde_json::json!({
                "series_key": series_key,
                "period": period,
                "value": value,
            })
        })
        .collect();
    serde_json::json!({ "observations": observations }).to_string()
}

pub fn upstream_error_body(code: &str, message: &str) -> String {
    serde_json::json!({ "error": { "code": code, "message": message } }).to_string()
}

/// Catalog rows `T01..Tnn`, each with one series `T..-S1`, annual and
/// quarterly, first one marked headline.
pub fn seed_catalog(store: &Warehouse, dataset: &str, entries: usize) -> Vec<CatalogRow> {
    let rows: Vec<CatalogRow> = (1..=entries)
        .map(|i| CatalogRow {
            dataset: dataset.to_string(),
            entry_id: format!("T{i:02}"),
            title: format!("Table {i}"),
            series_keys: vec![format!("T{i:02}-S1")],
            granularities: String::from("A,Q"),
            is_headline: i == 1,
            group_dim: Some(String::from(["east", "west", "north"][i % 3])),
        })
        .collect();
    store.import_catalog(&rows).expect("catalog import");
    rows
}

struct Route {
    needle: String,
    responses: VecDeque<Result<HttpResponse, HttpError>>,
}

/// Scripted transport keyed by URL substring. Each matching request pops
/// the next queued response; the last queued response is sticky so repeat
/// calls keep getting it. Unmatched requests 404.
#[derive(Default)]
pub struct RoutedHttpClient {
    routes: Mutex<Vec<Route>>,
    calls: AtomicUsize,
}

impl RoutedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ok(&self, needle: impl Into<String>, body: impl Into<String>) {
        self.push(needle.into(), Ok(HttpResponse::ok_json(body.into())));
    }

    pub fn on_status(&self, needle: impl Into<String>, status: u16, body: impl Into<String>) {
        self.push(
            needle.into(),
            Ok(HttpResponse::with_status(status, body.into())),
        );
    }

    pub fn on_transport_error(&self, needle: impl Into<String>, error: HttpError) {
        self.push(needle.into(), Err(error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, needle: String, response: Result<HttpResponse, HttpError>) {
        let mut routes = self.routes.lock().expect("routes poisoned");
        if let Some(route) = routes.iter_mut().find(|route| route.needle == needle) {
            route.responses.push_back(response);
        } else {
            routes.push(Route {
                needle,
                responses: VecDeque::from([response]),
            });
        }
    }
}

impl HttpClient for RoutedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut routes = self.routes.lock().expect("routes poisoned");
        let response = routes
            .iter_mut()
            .find(|route| request.url.contains(&route.needle))
            .map(|route| {
                if route.responses.len() > 1 {
                    route.responses.pop_front().expect("len checked")
                } else {
                    route
                        .responses
                        .front()
                        .cloned()
                        .expect("routes are never registered empty")
                }
            })
            .unwrap_or_else(|| Ok(HttpResponse::with_status(404, "no route")));
        Box::pin(async move { response })
    }
}

/// Transport that answers any series request with one observation for that
/// series at a configurable period/value. Used by sentinel tests, where
/// wiring a route per sampled series would be unmanageable.
pub struct SeriesEchoClient {
    state: Mutex<(String, f64)>,
}

impl SeriesEchoClient {
    pub fn new(period: impl Into<String>, value: f64) -> Self {
        Self {
            state: Mutex::new((period.into(), value)),
        }
    }

    /// Change what the fake upstream reports from now on.
    pub fn publish(&self, period: impl Into<String>, value: f64) {
        *self.state.lock().expect("echo state poisoned") = (period.into(), value);
    }
}

impl HttpClient for SeriesEchoClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        let (period, value) = self.state.lock().expect("echo state poisoned").clone();
        let series_key = request
            .url
            .split("series=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap_or("UNKNOWN")
            .to_string();
        let body = observation_body(&[(series_key.as_str(), period.as_str(), value)]);
        Box::pin(async move { Ok(HttpResponse::ok_json(body)) })
    }
}

/// Transport that panics on any call. Exercises the runner's panic cleanup.
pub struct PanickingClient;

impl HttpClient for PanickingClient {
    fn execute<'a>(
        &'a self,
        _request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move { panic!("transport blew up") })
    }
}

/// Transport that succeeds after an artificial delay, keeping a run busy
/// long enough for concurrency assertions.
pub struct SlowClient {
    pub delay: Duration,
    pub body: String,
}

impl HttpClient for SlowClient {
    fn execute<'a>(
        &'a self,
        _request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        let delay = self.delay;
        let body = self.body.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(HttpResponse::ok_json(body))
        })
    }
}
