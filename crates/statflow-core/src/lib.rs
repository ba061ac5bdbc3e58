//! # Statflow Core
//!
//! The rate-limited collection engine for statistical-agency time series.
//!
//! ## Overview
//!
//! This crate provides the moving parts of the collector:
//!
//! - **Domain types** for periods, windows, catalog entries, and observations
//! - **Sliding-window rate limiting** with per-provider ceilings and lockout
//! - **Retrying transport** with exponential backoff and `Retry-After` support
//! - **Typed provider client** that decodes responses at the boundary
//! - **Collection runs** with partial-failure semantics and progress tracking
//! - **Sentinel freshness detection** via stratified sampling
//! - **Task runner** enforcing at most one worker per dataset
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Typed provider client and usage accounting |
//! | [`collector`] | Multi-entry collection runs |
//! | [`domain`] | Periods, windows, catalog entries, observations |
//! | [`error`] | API and collection error types |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`progress`] | Run lifecycle and in-flight statistics |
//! | [`provider`] | Provider endpoints and quotas |
//! | [`rate_limit`] | Sliding-window rate limiter |
//! | [`retry`] | Backoff policy |
//! | [`runner`] | Per-dataset single-flight scheduling |
//! | [`sentinel`] | Sentinel-based freshness detection |
//! | [`transport`] | Rate-limited retrying request execution |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use statflow_core::{
//!     Granularity, ProviderClient, ProviderSpec, ReqwestClient, TaskRunner,
//! };
//! use statflow_warehouse::Warehouse;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Warehouse::open_default()?;
//!     let client = Arc::new(ProviderClient::new(
//!         ProviderSpec::bea(),
//!         Arc::new(ReqwestClient::new()),
//!         Arc::new(store.clone()),
//!     ));
//!
//!     let runner = TaskRunner::new(store);
//!     runner.register_dataset("nipa", client);
//!     let run_id = runner.start_backfill("nipa", None, Granularity::Quarterly, None)?;
//!     println!("started run {run_id}");
//!     runner.wait_until_idle().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod collector;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod progress;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod runner;
pub mod sentinel;
pub mod transport;

pub use api::{DiscardUsage, ProviderClient, UsageEvent, UsageSink};
pub use collector::{Collector, RunParams};
pub use domain::{
    CatalogEntry, Granularity, Observation, PeriodError, SeriesKey, TimePeriod, TimeWindow,
};
pub use error::{ApiError, CollectError};
pub use http_client::{
    HttpClient, HttpError, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse, ReqwestClient,
};
pub use progress::{CollectionProgress, EntryError, RunMode, RunStatus};
pub use provider::ProviderSpec;
pub use rate_limit::{LimiterSnapshot, RateCeilings, RateLimiter};
pub use retry::{BackoffPolicy, RetryConfig};
pub use runner::TaskRunner;
pub use sentinel::{CheckReport, FreshnessDetector, SentinelConfig};
pub use transport::{AttemptError, Exchange, RetryingClient, TransportError};
