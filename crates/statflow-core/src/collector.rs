//! Multi-entry collection runs with partial-failure semantics.

use std::sync::Arc;

use statflow_warehouse::{now_rfc3339, DataPointRow, Warehouse};
use tokio_util::sync::CancellationToken;

use crate::api::ProviderClient;
use crate::domain::{CatalogEntry, Granularity, Observation, TimeWindow};
use crate::error::CollectError;
use crate::progress::{CollectionProgress, RunMode, RunStatus};

/// Parameters of one queued run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub dataset: String,
    pub mode: RunMode,
    pub window: TimeWindow,
    pub granularity: Granularity,
    /// Restrict the run to these entry ids instead of the whole catalog.
    pub entry_filter: Option<Vec<String>>,
}

/// Walks a dataset's catalog entries in a deterministic order, fetching and
/// upserting each one, and recovers per-entry failures so one bad table
/// never sinks the rest of the run.
pub struct Collector {
    store: Warehouse,
    client: Arc<ProviderClient>,
}

impl Collector {
    pub fn new(store: Warehouse, client: Arc<ProviderClient>) -> Self {
        Self { store, client }
    }

    /// Execute a queued run to a terminal status. Returns the status the
    /// run ended in.
    pub async fn execute(
        &self,
        run_id: &str,
        params: &RunParams,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, CollectError> {
        if !self.store.mark_run_running(run_id, &now_rfc3339())? {
            tracing::warn!(run_id, "run is not queued, skipping execution");
            return Err(CollectError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        self.set_update_in_progress(&params.dataset, true)?;

        let entries = self.resolve_entries(params)?;
        tracing::info!(
            run_id,
            dataset = %params.dataset,
            mode = %params.mode,
            entries = entries.len(),
            "collection run started"
        );

        let mut progress = CollectionProgress::default();
        let mut stopped_early = false;
        let mut stop_reason: Option<String> = None;

        for entry in &entries {
            if cancel.is_cancelled() {
                stopped_early = true;
                stop_reason = Some(String::from("cancelled by operator"));
                break;
            }

            progress.requests_made += 1;
            match self
                .client
                .fetch_table(entry, params.window, params.granularity)
                .await
            {
                Ok(observations) => {
                    match self.persist(entry, &observations) {
                        Ok((inserted, updated, unchanged)) => {
                            progress.record_entry_success(inserted, updated, unchanged);
                        }
                        Err(error) => {
                            tracing::warn!(
                                run_id,
                                entry_id = %entry.entry_id,
                                %error,
                                "failed to persist entry"
                            );
                            progress.record_entry_failure(&entry.entry_id, error.to_string());
                        }
                    }
                }
                Err(error) if error.is_systemic() => {
                    tracing::warn!(run_id, %error, "systemic failure, stopping run early");
                    stopped_early = true;
                    stop_reason = Some(error.to_string());
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        run_id,
                        entry_id = %entry.entry_id,
                        %error,
                        "entry fetch failed"
                    );
                    progress.record_entry_failure(&entry.entry_id, error.to_string());
                }
            }

            self.store.flush_run_progress(
                run_id,
                &progress.counters(),
                progress.error_summary().as_deref(),
            )?;
        }

        let status = if entries.is_empty() {
            RunStatus::Completed
        } else {
            progress.final_status(stopped_early)
        };
        let summary = match (progress.error_summary(), stop_reason) {
            (Some(errors), Some(reason)) => Some(format!("{reason}; {errors}")),
            (Some(errors), None) => Some(errors),
            (None, Some(reason)) => Some(reason),
            (None, None) => None,
        };
        self.store.finish_run(
            run_id,
            status.as_str(),
            &now_rfc3339(),
            &progress.counters(),
            summary.as_deref(),
        )?;

        self.settle_freshness(&params.dataset, status, progress.any_values_changed())?;

        tracing::info!(
            run_id,
            %status,
            entries_processed = progress.entries_processed,
            entries_failed = progress.entries_failed,
            points_inserted = progress.points_inserted,
            points_updated = progress.points_updated,
            "collection run finished"
        );
        Ok(status)
    }

    /// Catalog entries for the run, sorted by entry id so reruns walk the
    /// same order.
    fn resolve_entries(&self, params: &RunParams) -> Result<Vec<CatalogEntry>, CollectError> {
        let rows = self.store.list_catalog(&params.dataset)?;
        let mut entries: Vec<CatalogEntry> = rows.into_iter().map(CatalogEntry::from).collect();

        if let Some(filter) = &params.entry_filter {
            entries.retain(|entry| filter.iter().any(|id| id == &entry.entry_id));
        } else {
            entries.retain(|entry| entry.supports(params.granularity));
        }
        entries.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));
        Ok(entries)
    }

    fn persist(
        &self,
        entry: &CatalogEntry,
        observations: &[Observation],
    ) -> Result<(usize, usize, usize), CollectError> {
        let rows: Vec<DataPointRow> = observations
            .iter()
            .map(|obs| DataPointRow {
                dataset: entry.dataset.clone(),
                series_key: obs.series_key.as_str().to_string(),
                period: obs.period.to_string(),
                value: obs.value,
                annotation: obs.annotation.clone(),
            })
            .collect();
        let report = self.store.upsert_data_points(&rows)?;
        Ok((report.inserted, report.updated, report.unchanged))
    }

    fn set_update_in_progress(&self, dataset: &str, value: bool) -> Result<(), CollectError> {
        let mut row = self.store.freshness(dataset)?;
        row.update_in_progress = value;
        self.store.save_freshness(&row)?;
        Ok(())
    }

    /// After a run, refresh the dataset summary: record what we now hold,
    /// count the run as a check (and as a detected update when any stored
    /// value actually changed), and on a clean completion clear the
    /// needs-update flag and re-baseline the sentinels so the next check
    /// compares against current data.
    fn settle_freshness(
        &self,
        dataset: &str,
        status: RunStatus,
        values_changed: bool,
    ) -> Result<(), CollectError> {
        let mut row = self.store.freshness(dataset)?;
        row.update_in_progress = false;
        row.latest_period = self.store.latest_period(dataset)?;
        row.last_collected_at = Some(now_rfc3339());
        row.total_checks += 1;
        if values_changed {
            row.total_updates_detected += 1;
        }
        if status == RunStatus::Completed {
            row.needs_update = false;
        }
        self.store.save_freshness(&row)?;

        if status == RunStatus::Completed {
            let synced = self.store.sync_sentinel_baselines(dataset)?;
            if synced > 0 {
                tracing::debug!(dataset, synced, "sentinel baselines re-synced");
            }
        }
        Ok(())
    }
}
