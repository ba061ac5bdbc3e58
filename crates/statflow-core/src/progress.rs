//! Collection-run lifecycle and in-flight progress tracking.

use std::fmt::{Display, Formatter};

use statflow_warehouse::RunCounters;

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Full historical collection across a wide window.
    Backfill,
    /// Incremental top-up of recent periods.
    Update,
}

impl RunMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Update => "update",
        }
    }
}

impl Display for RunMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run lifecycle: `queued -> running -> completed | partial | failed`.
/// Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    /// Every entry succeeded.
    Completed,
    /// Some entries succeeded before a failure or early stop.
    Partial,
    /// Nothing succeeded.
    Failed,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recovered per-entry failure.
#[derive(Debug, Clone)]
pub struct EntryError {
    pub entry_id: String,
    pub message: String,
}

/// Mutable statistics for a run in flight. Owned by the single worker
/// executing the run, flushed to the store after every entry.
#[derive(Debug, Default)]
pub struct CollectionProgress {
    pub entries_processed: i64,
    pub entries_failed: i64,
    pub points_inserted: i64,
    pub points_updated: i64,
    pub points_unchanged: i64,
    pub requests_made: i64,
    pub errors: Vec<EntryError>,
}

impl CollectionProgress {
    pub fn record_entry_success(&mut self, inserted: usize, updated: usize, unchanged: usize) {
        self.entries_processed += 1;
        self.points_inserted += inserted as i64;
        self.points_updated += updated as i64;
        self.points_unchanged += unchanged as i64;
    }

    pub fn record_entry_failure(&mut self, entry_id: impl Into<String>, message: impl Into<String>) {
        self.entries_processed += 1;
        self.entries_failed += 1;
        self.errors.push(EntryError {
            entry_id: entry_id.into(),
            message: message.into(),
        });
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            entries_processed: self.entries_processed,
            entries_failed: self.entries_failed,
            points_inserted: self.points_inserted,
            points_updated: self.points_updated,
            requests_made: self.requests_made,
        }
    }

    /// Whether the run changed any stored value, as opposed to confirming
    /// what was already there.
    pub const fn any_values_changed(&self) -> bool {
        self.points_inserted > 0 || self.points_updated > 0
    }

    /// Final status under the partial-failure rules: all entries clean is
    /// `completed`; any success alongside failures (or an early systemic
    /// stop after some successes) is `partial`; no successes at all is
    /// `failed`.
    pub fn final_status(&self, stopped_early: bool) -> RunStatus {
        let succeeded = self.entries_processed - self.entries_failed;
        if self.entries_failed == 0 && !stopped_early {
            RunStatus::Completed
        } else if succeeded > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }

    /// Human-readable digest of the per-entry failures, capped so the run
    /// row stays small.
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let mut parts: Vec<String> = self
            .errors
            .iter()
            .take(5)
            .map(|e| format!("{}: {}", e.entry_id, e.message))
            .collect();
        if self.errors.len() > 5 {
            parts.push(format!("... and {} more", self.errors.len() - 5));
        }
        Some(parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_clean_entries_complete_the_run() {
        let mut progress = CollectionProgress::default();
        progress.record_entry_success(10, 0, 0);
        progress.record_entry_success(0, 2, 8);
        assert_eq!(progress.final_status(false), RunStatus::Completed);
        assert!(progress.any_values_changed());
    }

    #[test]
    fn mixed_results_end_partial() {
        let mut progress = CollectionProgress::default();
        progress.record_entry_success(5, 0, 0);
        progress.record_entry_failure("T20100", "upstream rejected");
        assert_eq!(progress.final_status(false), RunStatus::Partial);
    }

    #[test]
    fn no_successes_end_failed() {
        let mut progress = CollectionProgress::default();
        progress.record_entry_failure("T10101", "boom");
        progress.record_entry_failure("T20100", "boom");
        assert_eq!(progress.final_status(false), RunStatus::Failed);
    }

    #[test]
    fn early_stop_after_successes_ends_partial() {
        let mut progress = CollectionProgress::default();
        progress.record_entry_success(3, 0, 0);
        assert_eq!(progress.final_status(true), RunStatus::Partial);
    }

    #[test]
    fn error_summary_caps_the_listed_entries() {
        let mut progress = CollectionProgress::default();
        for i in 0..7 {
            progress.record_entry_failure(format!("T{i}"), "boom");
        }
        let summary = progress.error_summary().expect("has failures");
        assert!(summary.contains("... and 2 more"));
    }

    #[test]
    fn unchanged_points_do_not_count_as_changes() {
        let mut progress = CollectionProgress::default();
        progress.record_entry_success(0, 0, 12);
        assert!(!progress.any_values_changed());
    }

    #[test]
    fn status_text_round_trips() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Partial,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(RunStatus::parse("cancelled").is_none());
    }
}
