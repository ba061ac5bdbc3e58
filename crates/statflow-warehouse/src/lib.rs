//! # statflow-warehouse
//!
//! DuckDB-backed store for collected statistical time series.
//!
//! The warehouse holds six kinds of rows:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `catalog_entries` | collectible tables/series per dataset (read-only to the engine) |
//! | `data_points` | observed values keyed by `(series_key, period)` |
//! | `collection_runs` | one row per backfill/update execution |
//! | `dataset_freshness` | per-dataset freshness summary |
//! | `sentinels` | sampled series used for cheap freshness checks |
//! | `api_usage` | per-minute request/byte/error ledger per provider |
//!
//! All statements are parameterized and multi-row writes run inside explicit
//! transactions. Periods are stored in their canonical zero-padded text form
//! (`2024`, `2024Q1`, `2024M03`) so lexicographic ordering within one series
//! matches chronological ordering.

pub mod migrations;
pub mod pool;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::ToSql;
use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub use pool::{AccessMode, ConnectionPool, PoolHandle};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A row referenced by the operation does not exist.
    #[error("no such row: {0}")]
    MissingRow(String),
}

/// Configuration for the store database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for statflow data.
    pub statflow_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle pooled connections per access mode.
    pub max_idle_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let statflow_home = resolve_statflow_home();
        let db_path = env::var("STATFLOW_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| statflow_home.join("statflow.duckdb"));
        Self {
            statflow_home,
            db_path,
            max_idle_connections: 4,
        }
    }
}

fn resolve_statflow_home() -> PathBuf {
    if let Ok(home) = env::var("STATFLOW_HOME") {
        return PathBuf::from(home);
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".statflow");
    }
    PathBuf::from(".statflow")
}

/// One collectible catalog entry within a dataset.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogRow {
    pub dataset: String,
    pub entry_id: String,
    pub title: String,
    /// Series identifiers belonging to this entry, stored as a JSON array.
    pub series_keys: Vec<String>,
    /// Supported granularity codes, comma-separated (`"A,Q,M"`).
    pub granularities: String,
    /// Headline/aggregate entries get priority in sentinel selection.
    pub is_headline: bool,
    /// Secondary grouping dimension (region, category) for stratification.
    pub group_dim: Option<String>,
}

/// One observed value for a series at a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPointRow {
    pub dataset: String,
    pub series_key: String,
    pub period: String,
    pub value: f64,
    pub annotation: Option<String>,
}

/// Outcome of one idempotent data-point batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Mutable counters carried by a collection run row.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunCounters {
    pub entries_processed: i64,
    pub entries_failed: i64,
    pub points_inserted: i64,
    pub points_updated: i64,
    pub requests_made: i64,
}

/// Persisted record of one backfill or incremental update execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub run_id: String,
    pub dataset: String,
    pub mode: String,
    pub window_start: i32,
    pub window_end: i32,
    pub granularity: String,
    /// Explicit entry filter, stored as a JSON array when present.
    pub entry_filter: Option<String>,
    pub status: String,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub counters: RunCounters,
    pub error_summary: Option<String>,
}

/// Per-dataset freshness summary row.
#[derive(Debug, Clone, Serialize)]
pub struct FreshnessRow {
    pub dataset: String,
    pub latest_period: Option<String>,
    pub needs_update: bool,
    pub update_in_progress: bool,
    pub last_checked_at: Option<String>,
    pub last_collected_at: Option<String>,
    pub last_detection_at: Option<String>,
    pub total_checks: i64,
    pub total_updates_detected: i64,
    /// Exponentially weighted average gap between detected updates, in days.
    pub avg_update_gap_days: Option<f64>,
}

impl FreshnessRow {
    #[must_use]
    pub fn empty(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            latest_period: None,
            needs_update: false,
            update_in_progress: false,
            last_checked_at: None,
            last_collected_at: None,
            last_detection_at: None,
            total_checks: 0,
            total_updates_detected: 0,
            avg_update_gap_days: None,
        }
    }
}

/// One sampled sentinel series with its stored baseline.
#[derive(Debug, Clone, Serialize)]
pub struct SentinelRow {
    pub dataset: String,
    pub series_key: String,
    pub entry_id: String,
    pub baseline_period: Option<String>,
    pub baseline_value: Option<f64>,
    pub baseline_annotation: Option<String>,
    pub has_changed: bool,
    pub times_checked: i64,
    pub times_changed: i64,
    pub selected_at: String,
}

/// One accounting entry in the API usage ledger.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRow {
    pub provider: String,
    pub dataset: Option<String>,
    pub entry_id: Option<String>,
    pub recorded_at: String,
    pub attempts: i64,
    pub bytes: i64,
    pub errored: bool,
}

/// Aggregated usage for one (provider, minute) bucket.
#[derive(Debug, Clone, Serialize)]
pub struct UsageMinute {
    pub minute_bucket: String,
    pub requests: i64,
    pub attempts: i64,
    pub bytes: i64,
    pub errors: i64,
}

/// Format the current UTC time as RFC 3339.
#[must_use]
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("RFC 3339 formatting of the current time cannot fail")
}

/// The store interface for collected time-series data.
#[derive(Clone)]
pub struct Warehouse {
    config: StoreConfig,
    pool: ConnectionPool,
}

impl Warehouse {
    /// Open a warehouse with default (environment-derived) configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(StoreConfig::default())
    }

    /// Open a warehouse rooted at the given directory. Used by tests and the
    /// CLI's `--home` override.
    pub fn open_in_dir(dir: &Path) -> Result<Self, WarehouseError> {
        Self::open(StoreConfig {
            statflow_home: dir.to_path_buf(),
            db_path: dir.join("statflow.duckdb"),
            max_idle_connections: 2,
        })
    }

    /// Open a warehouse with the specified configuration, applying schema
    /// migrations.
    pub fn open(config: StoreConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::new(config.db_path.clone(), config.max_idle_connections);
        let warehouse = Self { config, pool };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.config.db_path.as_path()
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    /// Upsert catalog entries. The engine treats the catalog as read-only;
    /// this exists for the catalog-sync step, the CLI importer, and tests.
    pub fn import_catalog(&self, rows: &[CatalogRow]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let now = now_rfc3339();
            for row in rows {
                let keys = serde_json::to_string(&row.series_keys)
                    .unwrap_or_else(|_| String::from("[]"));
                let params: [&dyn ToSql; 8] = [
                    &row.dataset,
                    &row.entry_id,
                    &row.title,
                    &keys,
                    &row.granularities,
                    &row.is_headline,
                    &row.group_dim,
                    &now,
                ];
                connection.execute(
                    "INSERT OR REPLACE INTO catalog_entries \
                     (dataset, entry_id, title, series_keys, granularities, is_headline, group_dim, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params.as_slice(),
                )?;
            }
            Ok(rows.len())
        })();

        finalize_transaction(&connection, result)
    }

    /// List catalog entries for a dataset in stable (entry id) order.
    pub fn list_catalog(&self, dataset: &str) -> Result<Vec<CatalogRow>, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let mut stmt = connection.prepare(
            "SELECT dataset, entry_id, title, series_keys, granularities, is_headline, group_dim \
             FROM catalog_entries WHERE dataset = ? ORDER BY entry_id",
        )?;
        let mapped = stmt.query_map([dataset], |row| {
            let keys_json: String = row.get(3)?;
            Ok(CatalogRow {
                dataset: row.get(0)?,
                entry_id: row.get(1)?,
                title: row.get(2)?,
                series_keys: serde_json::from_str(&keys_json).unwrap_or_default(),
                granularities: row.get(4)?,
                is_headline: row.get(5)?,
                group_dim: row.get(6)?,
            })
        })?;

        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Data points
    // ------------------------------------------------------------------

    /// Idempotent batch upsert keyed by `(series_key, period)`.
    ///
    /// Re-applying an identical batch is a no-op; a changed value or
    /// annotation overwrites the non-key columns. Rows are never deleted.
    pub fn upsert_data_points(&self, rows: &[DataPointRow]) -> Result<UpsertReport, WarehouseError> {
        let mut report = UpsertReport::default();
        if rows.is_empty() {
            return Ok(report);
        }

        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<UpsertReport, WarehouseError> {
            let now = now_rfc3339();
            for row in rows {
                let mut existing_stmt = connection.prepare(
                    "SELECT value, annotation FROM data_points WHERE series_key = ? AND period = ?",
                )?;
                let key_params: [&dyn ToSql; 2] = [&row.series_key, &row.period];
                let mut existing = existing_stmt
                    .query_map(key_params.as_slice(), |r| {
                        Ok((r.get::<_, f64>(0)?, r.get::<_, Option<String>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                match existing.pop() {
                    None => {
                        let params: [&dyn ToSql; 6] = [
                            &row.series_key,
                            &row.period,
                            &row.dataset,
                            &row.value,
                            &row.annotation,
                            &now,
                        ];
                        connection.execute(
                            "INSERT INTO data_points \
                             (series_key, period, dataset, value, annotation, updated_at) \
                             VALUES (?, ?, ?, ?, ?, ?)",
                            params.as_slice(),
                        )?;
                        report.inserted += 1;
                    }
                    Some((value, annotation))
                        if value == row.value && annotation == row.annotation =>
                    {
                        report.unchanged += 1;
                    }
                    Some(_) => {
                        let params: [&dyn ToSql; 5] = [
                            &row.value,
                            &row.annotation,
                            &now,
                            &row.series_key,
                            &row.period,
                        ];
                        connection.execute(
                            "UPDATE data_points SET value = ?, annotation = ?, updated_at = ? \
                             WHERE series_key = ? AND period = ?",
                            params.as_slice(),
                        )?;
                        report.updated += 1;
                    }
                }
            }
            Ok(report)
        })();

        finalize_transaction(&connection, result)
    }

    /// Most recent stored observation for a series, by canonical period order.
    pub fn latest_data_point(
        &self,
        series_key: &str,
    ) -> Result<Option<DataPointRow>, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let mut stmt = connection.prepare(
            "SELECT dataset, series_key, period, value, annotation FROM data_points \
             WHERE series_key = ? ORDER BY period DESC LIMIT 1",
        )?;
        let mut mapped = stmt
            .query_map([series_key], |row| {
                Ok(DataPointRow {
                    dataset: row.get(0)?,
                    series_key: row.get(1)?,
                    period: row.get(2)?,
                    value: row.get(3)?,
                    annotation: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mapped.pop())
    }

    /// Latest stored period across a whole dataset.
    pub fn latest_period(&self, dataset: &str) -> Result<Option<String>, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let latest: Option<String> = connection.query_row(
            "SELECT MAX(period) FROM data_points WHERE dataset = ?",
            [dataset],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    /// Number of stored observations for a dataset.
    pub fn count_data_points(&self, dataset: &str) -> Result<i64, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM data_points WHERE dataset = ?",
            [dataset],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Collection runs
    // ------------------------------------------------------------------

    /// Insert a freshly queued run row.
    pub fn insert_run(&self, run: &RunRow) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 10] = [
            &run.run_id,
            &run.dataset,
            &run.mode,
            &run.window_start,
            &run.window_end,
            &run.granularity,
            &run.entry_filter,
            &run.status,
            &run.queued_at,
            &run.error_summary,
        ];
        connection.execute(
            "INSERT INTO collection_runs \
             (run_id, dataset, mode, window_start, window_end, granularity, entry_filter, status, queued_at, error_summary) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Transition a queued run to `running`. Returns false when the row was
    /// not in `queued` state (already claimed or terminal).
    pub fn mark_run_running(
        &self,
        run_id: &str,
        started_at: &str,
    ) -> Result<bool, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 2] = [&started_at, &run_id];
        let changed = connection.execute(
            "UPDATE collection_runs SET status = 'running', started_at = ? \
             WHERE run_id = ? AND status = 'queued'",
            params.as_slice(),
        )?;
        Ok(changed == 1)
    }

    /// Flush in-flight progress counters into the run row.
    pub fn flush_run_progress(
        &self,
        run_id: &str,
        counters: &RunCounters,
        error_summary: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 7] = [
            &counters.entries_processed,
            &counters.entries_failed,
            &counters.points_inserted,
            &counters.points_updated,
            &counters.requests_made,
            &error_summary,
            &run_id,
        ];
        connection.execute(
            "UPDATE collection_runs SET entries_processed = ?, entries_failed = ?, \
             points_inserted = ?, points_updated = ?, requests_made = ?, error_summary = ? \
             WHERE run_id = ? AND status = 'running'",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Move a run into a terminal state. Terminal rows are immutable: a
    /// second finish attempt is ignored.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        completed_at: &str,
        counters: &RunCounters,
        error_summary: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 9] = [
            &status,
            &completed_at,
            &counters.entries_processed,
            &counters.entries_failed,
            &counters.points_inserted,
            &counters.points_updated,
            &counters.requests_made,
            &error_summary,
            &run_id,
        ];
        let changed = connection.execute(
            "UPDATE collection_runs SET status = ?, completed_at = ?, entries_processed = ?, \
             entries_failed = ?, points_inserted = ?, points_updated = ?, requests_made = ?, \
             error_summary = ? \
             WHERE run_id = ? AND status IN ('queued', 'running')",
            params.as_slice(),
        )?;
        if changed == 0 {
            tracing::warn!(run_id, status, "finish_run ignored: run already terminal");
        }
        Ok(())
    }

    /// Mark a run failed without touching its counters. Used when the
    /// executing task dies after a progress flush, so the last flushed
    /// counters stay intact.
    pub fn fail_run(
        &self,
        run_id: &str,
        completed_at: &str,
        error_summary: &str,
    ) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 3] = [&completed_at, &error_summary, &run_id];
        let changed = connection.execute(
            "UPDATE collection_runs SET status = 'failed', completed_at = ?, error_summary = ? \
             WHERE run_id = ? AND status IN ('queued', 'running')",
            params.as_slice(),
        )?;
        if changed == 0 {
            tracing::warn!(run_id, "fail_run ignored: run already terminal");
        }
        Ok(())
    }

    /// Fetch one run snapshot.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRow>, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let mut stmt = connection.prepare(&format!(
            "{RUN_SELECT} WHERE run_id = ?"
        ))?;
        let mut mapped = stmt
            .query_map([run_id], map_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mapped.pop())
    }

    /// Recent runs for a dataset, newest first.
    pub fn recent_runs(&self, dataset: &str, limit: usize) -> Result<Vec<RunRow>, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let mut stmt = connection.prepare(&format!(
            "{RUN_SELECT} WHERE dataset = ? ORDER BY queued_at DESC LIMIT ?"
        ))?;
        let params: [&dyn ToSql; 2] = [&dataset, &limit];
        let mapped = stmt.query_map(params.as_slice(), map_run_row)?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Freshness
    // ------------------------------------------------------------------

    /// Freshness summary for a dataset, or an empty default when the dataset
    /// has never been checked or collected.
    pub fn freshness(&self, dataset: &str) -> Result<FreshnessRow, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let mut stmt = connection.prepare(
            "SELECT dataset, latest_period, needs_update, update_in_progress, last_checked_at, \
             last_collected_at, last_detection_at, total_checks, total_updates_detected, \
             avg_update_gap_days \
             FROM dataset_freshness WHERE dataset = ?",
        )?;
        let mut mapped = stmt
            .query_map([dataset], |row| {
                Ok(FreshnessRow {
                    dataset: row.get(0)?,
                    latest_period: row.get(1)?,
                    needs_update: row.get(2)?,
                    update_in_progress: row.get(3)?,
                    last_checked_at: row.get(4)?,
                    last_collected_at: row.get(5)?,
                    last_detection_at: row.get(6)?,
                    total_checks: row.get(7)?,
                    total_updates_detected: row.get(8)?,
                    avg_update_gap_days: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mapped.pop().unwrap_or_else(|| FreshnessRow::empty(dataset)))
    }

    /// Persist a freshness summary row wholesale.
    pub fn save_freshness(&self, row: &FreshnessRow) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 10] = [
            &row.dataset,
            &row.latest_period,
            &row.needs_update,
            &row.update_in_progress,
            &row.last_checked_at,
            &row.last_collected_at,
            &row.last_detection_at,
            &row.total_checks,
            &row.total_updates_detected,
            &row.avg_update_gap_days,
        ];
        connection.execute(
            "INSERT OR REPLACE INTO dataset_freshness \
             (dataset, latest_period, needs_update, update_in_progress, last_checked_at, \
              last_collected_at, last_detection_at, total_checks, total_updates_detected, \
              avg_update_gap_days) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sentinels
    // ------------------------------------------------------------------

    /// Replace the full sentinel set for a dataset in one transaction.
    /// Selection never leaves a partial swap behind.
    pub fn replace_sentinels(
        &self,
        dataset: &str,
        rows: &[SentinelRow],
    ) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            connection.execute("DELETE FROM sentinels WHERE dataset = ?", [dataset])?;
            for row in rows {
                let params: [&dyn ToSql; 10] = [
                    &row.dataset,
                    &row.series_key,
                    &row.entry_id,
                    &row.baseline_period,
                    &row.baseline_value,
                    &row.baseline_annotation,
                    &row.has_changed,
                    &row.times_checked,
                    &row.times_changed,
                    &row.selected_at,
                ];
                connection.execute(
                    "INSERT INTO sentinels \
                     (dataset, series_key, entry_id, baseline_period, baseline_value, \
                      baseline_annotation, has_changed, times_checked, times_changed, selected_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params.as_slice(),
                )?;
            }
            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    /// Sentinels for a dataset in stable (series key) order.
    pub fn list_sentinels(&self, dataset: &str) -> Result<Vec<SentinelRow>, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let mut stmt = connection.prepare(
            "SELECT dataset, series_key, entry_id, baseline_period, baseline_value, \
             baseline_annotation, has_changed, times_checked, times_changed, selected_at \
             FROM sentinels WHERE dataset = ? ORDER BY series_key",
        )?;
        let mapped = stmt.query_map([dataset], |row| {
            Ok(SentinelRow {
                dataset: row.get(0)?,
                series_key: row.get(1)?,
                entry_id: row.get(2)?,
                baseline_period: row.get(3)?,
                baseline_value: row.get(4)?,
                baseline_annotation: row.get(5)?,
                has_changed: row.get(6)?,
                times_checked: row.get(7)?,
                times_changed: row.get(8)?,
                selected_at: row.get(9)?,
            })
        })?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Record one check outcome. The stored baseline is deliberately left
    /// untouched: the difference keeps showing until an explicit sync.
    pub fn record_sentinel_check(
        &self,
        dataset: &str,
        series_key: &str,
        changed: bool,
    ) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 4] = [&changed, &changed, &dataset, &series_key];
        connection.execute(
            "UPDATE sentinels SET has_changed = ?, times_checked = times_checked + 1, \
             times_changed = times_changed + CASE WHEN ? THEN 1 ELSE 0 END \
             WHERE dataset = ? AND series_key = ?",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Re-pull every sentinel baseline from the freshest locally stored data
    /// point and clear change flags. Returns the number of re-baselined rows.
    pub fn sync_sentinel_baselines(&self, dataset: &str) -> Result<usize, WarehouseError> {
        let sentinels = self.list_sentinels(dataset)?;
        if sentinels.is_empty() {
            return Ok(0);
        }

        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let mut synced = 0;
            for sentinel in &sentinels {
                let mut stmt = connection.prepare(
                    "SELECT period, value, annotation FROM data_points \
                     WHERE series_key = ? ORDER BY period DESC LIMIT 1",
                )?;
                let mut latest = stmt
                    .query_map([sentinel.series_key.as_str()], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let Some((period, value, annotation)) = latest.pop() else {
                    continue;
                };
                let params: [&dyn ToSql; 5] = [
                    &period,
                    &value,
                    &annotation,
                    &sentinel.dataset,
                    &sentinel.series_key,
                ];
                connection.execute(
                    "UPDATE sentinels SET baseline_period = ?, baseline_value = ?, \
                     baseline_annotation = ?, has_changed = FALSE \
                     WHERE dataset = ? AND series_key = ?",
                    params.as_slice(),
                )?;
                synced += 1;
            }
            Ok(synced)
        })();

        finalize_transaction(&connection, result)
    }

    // ------------------------------------------------------------------
    // Usage ledger
    // ------------------------------------------------------------------

    /// Append one usage accounting entry. The minute bucket is derived from
    /// the event timestamp (`YYYY-MM-DDTHH:MM`).
    pub fn record_usage(&self, row: &UsageRow) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadWrite)?;
        let minute_bucket: String = row.recorded_at.chars().take(16).collect();
        let params: [&dyn ToSql; 8] = [
            &row.provider,
            &row.dataset,
            &row.entry_id,
            &minute_bucket,
            &row.recorded_at,
            &row.attempts,
            &row.bytes,
            &row.errored,
        ];
        connection.execute(
            "INSERT INTO api_usage \
             (provider, dataset, entry_id, minute_bucket, recorded_at, attempts, bytes, errored) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Recent per-minute usage buckets for a provider, newest first.
    pub fn usage_minutes(
        &self,
        provider: &str,
        limit: usize,
    ) -> Result<Vec<UsageMinute>, WarehouseError> {
        let connection = self.pool.checkout(AccessMode::ReadOnly)?;
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let mut stmt = connection.prepare(
            "SELECT minute_bucket, COUNT(*), CAST(SUM(attempts) AS BIGINT), \
             CAST(SUM(bytes) AS BIGINT), \
             CAST(SUM(CASE WHEN errored THEN 1 ELSE 0 END) AS BIGINT) \
             FROM api_usage WHERE provider = ? \
             GROUP BY minute_bucket ORDER BY minute_bucket DESC LIMIT ?",
        )?;
        let params: [&dyn ToSql; 2] = [&provider, &limit];
        let mapped = stmt.query_map(params.as_slice(), |row| {
            Ok(UsageMinute {
                minute_bucket: row.get(0)?,
                requests: row.get(1)?,
                attempts: row.get(2)?,
                bytes: row.get(3)?,
                errors: row.get(4)?,
            })
        })?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }
}

const RUN_SELECT: &str = "SELECT run_id, dataset, mode, window_start, window_end, granularity, \
    entry_filter, status, queued_at, started_at, completed_at, entries_processed, entries_failed, \
    points_inserted, points_updated, requests_made, error_summary FROM collection_runs";

fn map_run_row(row: &::duckdb::Row<'_>) -> Result<RunRow, ::duckdb::Error> {
    Ok(RunRow {
        run_id: row.get(0)?,
        dataset: row.get(1)?,
        mode: row.get(2)?,
        window_start: row.get(3)?,
        window_end: row.get(4)?,
        granularity: row.get(5)?,
        entry_filter: row.get(6)?,
        status: row.get(7)?,
        queued_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        counters: RunCounters {
            entries_processed: row.get(11)?,
            entries_failed: row.get(12)?,
            points_inserted: row.get(13)?,
            points_updated: row.get(14)?,
            requests_made: row.get(15)?,
        },
        error_summary: row.get(16)?,
    })
}

/// Commit on success, roll back on failure.
fn finalize_transaction<T>(
    connection: &::duckdb::Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn point(series: &str, period: &str, value: f64) -> DataPointRow {
        DataPointRow {
            dataset: String::from("nipa"),
            series_key: series.to_string(),
            period: period.to_string(),
            value,
            annotation: None,
        }
    }

    #[test]
    fn upsert_is_idempotent_and_overwrites_changed_values() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open_in_dir(temp.path()).expect("warehouse open");

        let batch = vec![point("T10101-1", "2024Q1", 2.4), point("T10101-1", "2024Q2", 2.8)];
        let first = warehouse.upsert_data_points(&batch).expect("first upsert");
        assert_eq!(first, UpsertReport { inserted: 2, updated: 0, unchanged: 0 });

        let second = warehouse.upsert_data_points(&batch).expect("second upsert");
        assert_eq!(second, UpsertReport { inserted: 0, updated: 0, unchanged: 2 });

        let revised = vec![point("T10101-1", "2024Q1", 2.4), point("T10101-1", "2024Q2", 3.1)];
        let third = warehouse.upsert_data_points(&revised).expect("third upsert");
        assert_eq!(third, UpsertReport { inserted: 0, updated: 1, unchanged: 1 });

        let latest = warehouse
            .latest_data_point("T10101-1")
            .expect("latest")
            .expect("series present");
        assert_eq!(latest.period, "2024Q2");
        assert_eq!(latest.value, 3.1);
    }

    #[test]
    fn terminal_runs_are_immutable() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open_in_dir(temp.path()).expect("warehouse open");

        let run = RunRow {
            run_id: String::from("run-1"),
            dataset: String::from("nipa"),
            mode: String::from("backfill"),
            window_start: 2020,
            window_end: 2024,
            granularity: String::from("A"),
            entry_filter: None,
            status: String::from("queued"),
            queued_at: now_rfc3339(),
            started_at: None,
            completed_at: None,
            counters: RunCounters::default(),
            error_summary: None,
        };
        warehouse.insert_run(&run).expect("insert");
        assert!(warehouse.mark_run_running("run-1", &now_rfc3339()).expect("claim"));
        assert!(!warehouse.mark_run_running("run-1", &now_rfc3339()).expect("second claim"));

        warehouse
            .finish_run("run-1", "completed", &now_rfc3339(), &RunCounters::default(), None)
            .expect("finish");
        warehouse
            .finish_run("run-1", "failed", &now_rfc3339(), &RunCounters::default(), Some("late"))
            .expect("second finish is ignored");

        let row = warehouse.get_run("run-1").expect("get").expect("present");
        assert_eq!(row.status, "completed");
        assert_eq!(row.error_summary, None);
    }

    #[test]
    fn writes_are_visible_to_reads_through_other_pooled_handles() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open_in_dir(temp.path()).expect("warehouse open");

        let run = RunRow {
            run_id: String::from("run-vis"),
            dataset: String::from("nipa"),
            mode: String::from("update"),
            window_start: 2024,
            window_end: 2024,
            granularity: String::from("Q"),
            entry_filter: None,
            status: String::from("queued"),
            queued_at: now_rfc3339(),
            started_at: None,
            completed_at: None,
            counters: RunCounters::default(),
            error_summary: None,
        };
        warehouse.insert_run(&run).expect("insert");

        // The read-only checkout below must observe the state the write
        // connection committed, not the file as of its own open
        let row = warehouse.get_run("run-vis").expect("get").expect("present");
        assert_eq!(row.status, "queued");

        assert!(warehouse.mark_run_running("run-vis", &now_rfc3339()).expect("claim"));
        let row = warehouse.get_run("run-vis").expect("get").expect("present");
        assert_eq!(row.status, "running");
        assert!(row.started_at.is_some());
    }

    #[test]
    fn sentinel_replacement_is_wholesale() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open_in_dir(temp.path()).expect("warehouse open");

        let first = vec![sentinel("nipa", "A", "T1"), sentinel("nipa", "B", "T2")];
        warehouse.replace_sentinels("nipa", &first).expect("first set");

        let second = vec![sentinel("nipa", "C", "T3")];
        warehouse.replace_sentinels("nipa", &second).expect("second set");

        let stored = warehouse.list_sentinels("nipa").expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].series_key, "C");
    }

    #[test]
    fn baseline_sync_pulls_from_local_data_and_clears_flags() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open_in_dir(temp.path()).expect("warehouse open");

        warehouse
            .upsert_data_points(&[point("A", "2023", 100.0), point("A", "2024", 105.0)])
            .expect("seed data");

        let mut row = sentinel("nipa", "A", "T1");
        row.baseline_period = Some(String::from("2023"));
        row.baseline_value = Some(100.0);
        row.has_changed = true;
        warehouse.replace_sentinels("nipa", &[row]).expect("seed sentinel");

        let synced = warehouse.sync_sentinel_baselines("nipa").expect("sync");
        assert_eq!(synced, 1);

        let stored = warehouse.list_sentinels("nipa").expect("list");
        assert_eq!(stored[0].baseline_period.as_deref(), Some("2024"));
        assert_eq!(stored[0].baseline_value, Some(105.0));
        assert!(!stored[0].has_changed);
    }

    #[test]
    fn usage_ledger_aggregates_per_minute_buckets() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open_in_dir(temp.path()).expect("warehouse open");

        for errored in [false, true] {
            warehouse
                .record_usage(&UsageRow {
                    provider: String::from("bea"),
                    dataset: Some(String::from("nipa")),
                    entry_id: None,
                    recorded_at: String::from("2026-08-27T12:00:01Z"),
                    attempts: 2,
                    bytes: 1_000,
                    errored,
                })
                .expect("record usage");
        }

        let minutes = warehouse.usage_minutes("bea", 10).expect("minutes");
        assert_eq!(minutes.len(), 1);
        assert_eq!(minutes[0].minute_bucket, "2026-08-27T12:00");
        assert_eq!(minutes[0].requests, 2);
        assert_eq!(minutes[0].attempts, 4);
        assert_eq!(minutes[0].bytes, 2_000);
        assert_eq!(minutes[0].errors, 1);
    }

    fn sentinel(dataset: &str, series: &str, entry: &str) -> SentinelRow {
        SentinelRow {
            dataset: dataset.to_string(),
            series_key: series.to_string(),
            entry_id: entry.to_string(),
            baseline_period: None,
            baseline_value: None,
            baseline_annotation: None,
            has_changed: false,
            times_checked: 0,
            times_changed: 0,
            selected_at: now_rfc3339(),
        }
    }
}
