//! Sentinel-based freshness detection.
//!
//! Instead of polling every series in a dataset, a small stratified sample
//! of sentinel series is checked against stored baselines. Agencies publish
//! whole tables at once, so any sentinel changing implies the dataset has
//! new data.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use statflow_warehouse::{now_rfc3339, SentinelRow, Warehouse};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::api::ProviderClient;
use crate::domain::{CatalogEntry, Observation, TimePeriod};
use crate::error::CollectError;

/// Weight given to a newly observed update gap in the moving average.
const GAP_EWMA_WEIGHT: f64 = 0.3;

/// Sampling parameters for sentinel selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentinelConfig {
    /// Fraction of the catalog to sample.
    pub target_fraction: f64,
    pub min_count: usize,
    pub max_count: usize,
    /// Share of the target reserved for headline entries.
    pub headline_share: f64,
    /// Years of history requested when fetching baselines and checks.
    pub recent_years: i32,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            target_fraction: 0.07,
            min_count: 5,
            max_count: 100,
            headline_share: 0.4,
            recent_years: 4,
        }
    }
}

impl SentinelConfig {
    /// `clamp(round(fraction * catalog_size), min, max)`, capped by the
    /// catalog itself.
    pub fn target_for(&self, catalog_size: usize) -> usize {
        let raw = (self.target_fraction * catalog_size as f64).round() as usize;
        raw.clamp(self.min_count, self.max_count).min(catalog_size)
    }
}

/// Result of one dataset-wide sentinel check pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub checked: usize,
    pub changed: usize,
    pub needs_update: bool,
}

/// Selects and checks sentinel series for a dataset.
pub struct FreshnessDetector {
    store: Warehouse,
    client: Arc<ProviderClient>,
    config: SentinelConfig,
}

impl FreshnessDetector {
    pub fn new(store: Warehouse, client: Arc<ProviderClient>, config: SentinelConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Choose a stratified sentinel sample for the dataset and seed each
    /// sentinel's baseline from a cheap recent-window fetch. The new set
    /// replaces the old one wholesale. Keys that currently report no data
    /// are skipped rather than stored, so archival entries never become
    /// permanently "changed" sentinels.
    pub async fn select(&self, dataset: &str) -> Result<Vec<SentinelRow>, CollectError> {
        let entries: Vec<CatalogEntry> = self
            .store
            .list_catalog(dataset)?
            .into_iter()
            .map(CatalogEntry::from)
            .filter(|entry| entry.primary_series().is_some())
            .collect();
        let target = self.config.target_for(entries.len());
        let picks = stratify(&entries, target, self.config.headline_share);
        tracing::info!(
            dataset,
            catalog = entries.len(),
            target,
            picked = picks.len(),
            "sentinel selection"
        );

        let selected_at = now_rfc3339();
        let mut rows = Vec::with_capacity(picks.len());
        for entry in picks {
            let Some(series_key) = entry.primary_series() else {
                continue;
            };
            let baseline = match self
                .client
                .fetch_series_recent(dataset, series_key, self.config.recent_years)
                .await
            {
                Ok(observations) => latest_observation(observations),
                Err(error) => {
                    tracing::warn!(
                        dataset,
                        series_key = %series_key,
                        %error,
                        "baseline fetch failed, skipping sentinel"
                    );
                    None
                }
            };
            let Some(baseline) = baseline else { continue };

            rows.push(SentinelRow {
                dataset: dataset.to_string(),
                series_key: series_key.as_str().to_string(),
                entry_id: entry.entry_id.clone(),
                baseline_period: Some(baseline.period.to_string()),
                baseline_value: Some(baseline.value),
                baseline_annotation: baseline.annotation,
                has_changed: false,
                times_checked: 0,
                times_changed: 0,
                selected_at: selected_at.clone(),
            });
        }

        self.store.replace_sentinels(dataset, &rows)?;
        Ok(rows)
    }

    /// Check every stored sentinel against a fresh recent-window fetch.
    /// Baselines are deliberately left stale on change: the difference keeps
    /// showing until the dataset is re-collected and baselines re-synced.
    pub async fn check(&self, dataset: &str) -> Result<CheckReport, CollectError> {
        let sentinels = self.store.list_sentinels(dataset)?;
        let mut checked = 0usize;
        let mut changed_count = 0usize;

        for sentinel in &sentinels {
            let series_key = match crate::domain::SeriesKey::new(&sentinel.series_key) {
                Some(key) => key,
                None => continue,
            };
            let observations = match self
                .client
                .fetch_series_recent(dataset, &series_key, self.config.recent_years)
                .await
            {
                Ok(observations) => observations,
                Err(error) if error.is_systemic() => return Err(error.into()),
                Err(error) => {
                    tracing::warn!(
                        dataset,
                        series_key = %sentinel.series_key,
                        %error,
                        "sentinel fetch failed, skipping"
                    );
                    continue;
                }
            };

            // An empty response says nothing about the series; comparing it
            // against the baseline would flip an earlier detection back off.
            let Some(latest) = latest_observation(observations) else {
                tracing::warn!(
                    dataset,
                    series_key = %sentinel.series_key,
                    "sentinel returned no recent data, skipping"
                );
                continue;
            };
            let changed = baseline_differs(sentinel, &latest);
            self.store
                .record_sentinel_check(dataset, &sentinel.series_key, changed)?;
            checked += 1;
            if changed {
                changed_count += 1;
            }
        }

        // Sentinels skipped this pass may still hold an unresolved change
        // from an earlier one; the dataset stays flagged until re-collected.
        let needs_update = changed_count > 0
            || self
                .store
                .list_sentinels(dataset)?
                .iter()
                .any(|sentinel| sentinel.has_changed);
        self.settle_freshness(dataset, needs_update)?;
        tracing::info!(
            dataset,
            checked,
            changed = changed_count,
            needs_update,
            "sentinel check finished"
        );
        Ok(CheckReport {
            checked,
            changed: changed_count,
            needs_update,
        })
    }

    /// Re-baseline all sentinels from freshly collected local data.
    pub fn sync(&self, dataset: &str) -> Result<usize, CollectError> {
        Ok(self.store.sync_sentinel_baselines(dataset)?)
    }

    fn settle_freshness(&self, dataset: &str, needs_update: bool) -> Result<(), CollectError> {
        let mut row = self.store.freshness(dataset)?;
        let now = now_rfc3339();
        row.total_checks += 1;
        row.last_checked_at = Some(now.clone());

        // Only a fresh detection advances the detection clock and the gap
        // average; a still-pending flag is the same release seen again.
        if needs_update && !row.needs_update {
            row.total_updates_detected += 1;
            if let Some(gap_days) = days_between(row.last_detection_at.as_deref(), &now) {
                row.avg_update_gap_days = Some(match row.avg_update_gap_days {
                    Some(avg) => GAP_EWMA_WEIGHT * gap_days + (1.0 - GAP_EWMA_WEIGHT) * avg,
                    None => gap_days,
                });
            }
            row.last_detection_at = Some(now);
            row.needs_update = true;
        } else if !needs_update {
            row.needs_update = false;
        }
        self.store.save_freshness(&row)?;
        Ok(())
    }
}

/// Tiered sampling: headline entries first (up to `headline_share` of the
/// target), then one entry per distinct grouping dimension, then a random
/// fill from whatever remains.
fn stratify<'a>(
    entries: &'a [CatalogEntry],
    target: usize,
    headline_share: f64,
) -> Vec<&'a CatalogEntry> {
    let mut picked: Vec<&CatalogEntry> = Vec::with_capacity(target);
    let mut taken: HashSet<&str> = HashSet::new();
    if target == 0 {
        return picked;
    }

    let headline_quota = ((headline_share * target as f64).round() as usize).min(target);
    for entry in entries.iter().filter(|e| e.is_headline) {
        if picked.len() >= headline_quota {
            break;
        }
        if taken.insert(&entry.entry_id) {
            picked.push(entry);
        }
    }

    let mut seen_groups: HashSet<&str> = HashSet::new();
    for entry in entries {
        if picked.len() >= target {
            break;
        }
        let Some(group) = entry.group_dim.as_deref() else {
            continue;
        };
        if taken.contains(entry.entry_id.as_str()) {
            continue;
        }
        if seen_groups.insert(group) {
            taken.insert(&entry.entry_id);
            picked.push(entry);
        }
    }

    let mut pool: Vec<&CatalogEntry> = entries
        .iter()
        .filter(|entry| !taken.contains(entry.entry_id.as_str()))
        .collect();
    fastrand::shuffle(&mut pool);
    for entry in pool {
        if picked.len() >= target {
            break;
        }
        picked.push(entry);
    }

    picked
}

fn latest_observation(observations: Vec<Observation>) -> Option<Observation> {
    observations
        .into_iter()
        .max_by(|a, b| a.period.cmp(&b.period))
}

/// Change precedence: period advanced, then numeric value, then annotation.
fn baseline_differs(sentinel: &SentinelRow, latest: &Observation) -> bool {
    let baseline_period = sentinel
        .baseline_period
        .as_deref()
        .and_then(|p| TimePeriod::from_str(p).ok());
    match baseline_period {
        None => return true,
        Some(baseline) if latest.period > baseline => return true,
        Some(_) => {}
    }

    match sentinel.baseline_value {
        None => return true,
        Some(baseline) if latest.value != baseline => return true,
        Some(_) => {}
    }

    sentinel.baseline_annotation.as_deref() != latest.annotation.as_deref()
}

fn days_between(earlier: Option<&str>, later: &str) -> Option<f64> {
    let earlier = OffsetDateTime::parse(earlier?, &Rfc3339).ok()?;
    let later = OffsetDateTime::parse(later, &Rfc3339).ok()?;
    let seconds = (later - earlier).whole_seconds();
    (seconds >= 0).then(|| seconds as f64 / 86_400.0)
}
