//! Per-dataset run scheduling with a single-flight guarantee.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use statflow_warehouse::{now_rfc3339, RunCounters, RunRow, Warehouse};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::ProviderClient;
use crate::collector::{Collector, RunParams};
use crate::domain::{Granularity, TimeWindow};
use crate::error::CollectError;
use crate::progress::{RunMode, RunStatus};

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

struct RunnerInner {
    store: Warehouse,
    clients: Mutex<HashMap<String, Arc<ProviderClient>>>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

/// Removes the dataset from the active registry when dropped, so a worker
/// that panics or is aborted can never leave its dataset marked busy.
struct ActiveGuard {
    inner: Arc<RunnerInner>,
    dataset: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner
            .active
            .lock()
            .expect("active registry poisoned")
            .remove(&self.dataset);
    }
}

/// Launches collection workers, at most one per dataset at a time.
/// Multiple datasets run concurrently as independent workers.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    pub fn new(store: Warehouse) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                clients: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Associate a dataset with the provider client its runs will use.
    /// Datasets sharing a provider should share one client, so they share
    /// that provider's rate limiter.
    pub fn register_dataset(&self, dataset: impl Into<String>, client: Arc<ProviderClient>) {
        self.inner
            .clients
            .lock()
            .expect("client registry poisoned")
            .insert(dataset.into(), client);
    }

    /// Queue and launch a full historical backfill.
    pub fn start_backfill(
        &self,
        dataset: &str,
        window: Option<TimeWindow>,
        granularity: Granularity,
        entry_filter: Option<Vec<String>>,
    ) -> Result<String, CollectError> {
        self.start(RunParams {
            dataset: dataset.to_string(),
            mode: RunMode::Backfill,
            window: window.unwrap_or_else(TimeWindow::backfill_default),
            granularity,
            entry_filter,
        })
    }

    /// Queue and launch an incremental update over recent years.
    pub fn start_update(
        &self,
        dataset: &str,
        granularity: Granularity,
        entry_filter: Option<Vec<String>>,
    ) -> Result<String, CollectError> {
        self.start(RunParams {
            dataset: dataset.to_string(),
            mode: RunMode::Update,
            window: TimeWindow::recent(2),
            granularity,
            entry_filter,
        })
    }

    /// The single-flight gate: the queued row is only persisted and the
    /// worker only launched while this call holds the registry lock and
    /// has confirmed the dataset idle.
    fn start(&self, params: RunParams) -> Result<String, CollectError> {
        let client = self
            .inner
            .clients
            .lock()
            .expect("client registry poisoned")
            .get(&params.dataset)
            .cloned()
            .ok_or_else(|| CollectError::UnknownDataset {
                dataset: params.dataset.clone(),
            })?;

        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        {
            let mut active = self.inner.active.lock().expect("active registry poisoned");
            if let Some(existing) = active.get(&params.dataset) {
                return Err(CollectError::AlreadyRunning {
                    dataset: params.dataset.clone(),
                    run_id: existing.run_id.clone(),
                });
            }

            self.inner.store.insert_run(&RunRow {
                run_id: run_id.clone(),
                dataset: params.dataset.clone(),
                mode: params.mode.as_str().to_string(),
                window_start: params.window.start_year,
                window_end: params.window.end_year,
                granularity: params.granularity.code().to_string(),
                entry_filter: params
                    .entry_filter
                    .as_ref()
                    .and_then(|filter| serde_json::to_string(filter).ok()),
                status: RunStatus::Queued.as_str().to_string(),
                queued_at: now_rfc3339(),
                started_at: None,
                completed_at: None,
                counters: RunCounters::default(),
                error_summary: None,
            })?;

            active.insert(
                params.dataset.clone(),
                ActiveRun {
                    run_id: run_id.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        self.spawn_worker(run_id.clone(), params, client, cancel);
        Ok(run_id)
    }

    fn spawn_worker(
        &self,
        run_id: String,
        params: RunParams,
        client: Arc<ProviderClient>,
        cancel: CancellationToken,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = ActiveGuard {
                inner: inner.clone(),
                dataset: params.dataset.clone(),
            };

            // The collector runs in its own task so a panic inside it
            // surfaces as a join error here instead of unwinding past the
            // guard, and the run row still reaches a terminal state.
            let store = inner.store.clone();
            let dataset = params.dataset.clone();
            let worker_run_id = run_id.clone();
            let worker = tokio::spawn(async move {
                let collector = Collector::new(store, client);
                collector.execute(&worker_run_id, &params, &cancel).await
            });

            match worker.await {
                Ok(Ok(status)) => {
                    tracing::debug!(%run_id, %status, "worker finished");
                }
                Ok(Err(error)) => {
                    tracing::error!(%run_id, %error, "worker failed");
                    let _ = inner
                        .store
                        .fail_run(&run_id, &now_rfc3339(), &error.to_string());
                    clear_update_flag(&inner.store, &dataset);
                }
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        "worker panicked"
                    } else {
                        "worker aborted"
                    };
                    tracing::error!(%run_id, reason, "worker died");
                    let _ = inner.store.fail_run(&run_id, &now_rfc3339(), reason);
                    clear_update_flag(&inner.store, &dataset);
                }
            }
        });
    }

    pub fn is_running(&self, dataset: &str) -> bool {
        self.inner
            .active
            .lock()
            .expect("active registry poisoned")
            .contains_key(dataset)
    }

    /// Datasets with a worker in flight, sorted for stable display.
    pub fn running_datasets(&self) -> Vec<String> {
        let mut datasets: Vec<String> = self
            .inner
            .active
            .lock()
            .expect("active registry poisoned")
            .keys()
            .cloned()
            .collect();
        datasets.sort();
        datasets
    }

    /// Ask the dataset's worker to stop at the next entry boundary. Returns
    /// false when nothing is running.
    pub fn cancel(&self, dataset: &str) -> bool {
        let active = self.inner.active.lock().expect("active registry poisoned");
        match active.get(dataset) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Read-only snapshot of one run, straight from the store.
    pub fn run_status(&self, run_id: &str) -> Result<RunRow, CollectError> {
        self.inner
            .store
            .get_run(run_id)?
            .ok_or_else(|| CollectError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Wait for every active worker to finish. Intended for tests and for
    /// CLI commands that launch a run and want to block on it.
    pub async fn wait_until_idle(&self) {
        loop {
            if self
                .inner
                .active
                .lock()
                .expect("active registry poisoned")
                .is_empty()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// A run that died before the collector's own settling leaves the dataset
/// flagged as mid-update forever. Best-effort: the run row already records
/// the failure.
fn clear_update_flag(store: &Warehouse, dataset: &str) {
    match store.freshness(dataset) {
        Ok(mut row) if row.update_in_progress => {
            row.update_in_progress = false;
            if let Err(error) = store.save_freshness(&row) {
                tracing::warn!(dataset, %error, "failed to clear in-progress flag");
            }
        }
        Ok(_) => {}
        Err(error) => {
            tracing::warn!(dataset, %error, "failed to read freshness row");
        }
    }
}
