use ::duckdb::Connection;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_catalog_and_observations",
        sql: r#"
CREATE TABLE IF NOT EXISTS catalog_entries (
    dataset TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    title TEXT NOT NULL,
    series_keys TEXT NOT NULL,
    granularities TEXT NOT NULL,
    is_headline BOOLEAN NOT NULL DEFAULT FALSE,
    group_dim TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY(dataset, entry_id)
);

CREATE TABLE IF NOT EXISTS data_points (
    series_key TEXT NOT NULL,
    period TEXT NOT NULL,
    dataset TEXT NOT NULL,
    value DOUBLE NOT NULL,
    annotation TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY(series_key, period)
);
"#,
    },
    Migration {
        version: "0002_collection_runs",
        sql: r#"
CREATE TABLE IF NOT EXISTS collection_runs (
    run_id TEXT PRIMARY KEY,
    dataset TEXT NOT NULL,
    mode TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    granularity TEXT NOT NULL,
    entry_filter TEXT,
    status TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    entries_processed BIGINT NOT NULL DEFAULT 0,
    entries_failed BIGINT NOT NULL DEFAULT 0,
    points_inserted BIGINT NOT NULL DEFAULT 0,
    points_updated BIGINT NOT NULL DEFAULT 0,
    requests_made BIGINT NOT NULL DEFAULT 0,
    error_summary TEXT
);
"#,
    },
    Migration {
        version: "0003_freshness_and_sentinels",
        sql: r#"
CREATE TABLE IF NOT EXISTS dataset_freshness (
    dataset TEXT PRIMARY KEY,
    latest_period TEXT,
    needs_update BOOLEAN NOT NULL DEFAULT FALSE,
    update_in_progress BOOLEAN NOT NULL DEFAULT FALSE,
    last_checked_at TEXT,
    last_collected_at TEXT,
    last_detection_at TEXT,
    total_checks BIGINT NOT NULL DEFAULT 0,
    total_updates_detected BIGINT NOT NULL DEFAULT 0,
    avg_update_gap_days DOUBLE
);

CREATE TABLE IF NOT EXISTS sentinels (
    dataset TEXT NOT NULL,
    series_key TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    baseline_period TEXT,
    baseline_value DOUBLE,
    baseline_annotation TEXT,
    has_changed BOOLEAN NOT NULL DEFAULT FALSE,
    times_checked BIGINT NOT NULL DEFAULT 0,
    times_changed BIGINT NOT NULL DEFAULT 0,
    selected_at TEXT NOT NULL,
    PRIMARY KEY(dataset, series_key)
);
"#,
    },
    Migration {
        version: "0004_usage_ledger",
        sql: r#"
CREATE TABLE IF NOT EXISTS api_usage (
    provider TEXT NOT NULL,
    dataset TEXT,
    entry_id TEXT,
    minute_bucket TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    attempts BIGINT NOT NULL,
    bytes BIGINT NOT NULL,
    errored BOOLEAN NOT NULL
);
"#,
    },
    Migration {
        version: "0005_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_data_points_dataset_period ON data_points(dataset, period);
CREATE INDEX IF NOT EXISTS idx_collection_runs_dataset_queued ON collection_runs(dataset, queued_at);
CREATE INDEX IF NOT EXISTS idx_api_usage_provider_minute ON api_usage(provider, minute_bucket);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}
