//! Behavior tests for collection runs: progress accounting, idempotent
//! re-collection, partial failure, and systemic stops.

use statflow_core::{DiscardUsage, Granularity, ProviderClient, RunStatus, TaskRunner, TimeWindow};
use statflow_tests::*;

fn quarterly_body(entry: usize, quarters: &[&str]) -> String {
    let series = format!("T{entry:02}-S1");
    let rows: Vec<(&str, &str, f64)> = quarters
        .iter()
        .map(|q| (series.as_str(), *q, 100.0 + entry as f64))
        .collect();
    observation_body(&rows)
}

#[tokio::test]
async fn when_every_entry_succeeds_the_run_completes_with_full_counters() {
    // Given: a three-table catalog and a provider serving 20 points total
    let (_temp, store) = open_temp_store();
    seed_catalog(&store, "nipa", 3);
    let http = Arc::new(RoutedHttpClient::new());
    http.on_ok(
        "table=T01",
        quarterly_body(1, &["2023Q1", "2023Q2", "2023Q3", "2023Q4", "2024Q1", "2024Q2", "2024Q3", "2024Q4"]),
    );
    http.on_ok(
        "table=T02",
        quarterly_body(2, &["2024Q1", "2024Q2", "2024Q3", "2024Q4", "2023Q1", "2023Q2"]),
    );
    http.on_ok(
        "table=T03",
        quarterly_body(3, &["2024Q1", "2024Q2", "2024Q3", "2024Q4", "2023Q1", "2023Q2"]),
    );

    let client = Arc::new(ProviderClient::new(
        test_provider(),
        http.clone(),
        Arc::new(store.clone()),
    ));
    let runner = TaskRunner::new(store.clone());
    runner.register_dataset("nipa", client);

    // When: a backfill runs to completion
    let run_id = runner
        .start_backfill("nipa", Some(TimeWindow::new(2023, 2024)), Granularity::Quarterly, None)
        .expect("run starts");
    runner.wait_until_idle().await;

    // Then: the run row reports every entry and point, and freshness knows
    // the newest period we now hold
    let run = store.get_run(&run_id).expect("query").expect("run exists");
    assert_eq!(run.status, RunStatus::Completed.as_str());
    assert_eq!(run.counters.entries_processed, 3);
    assert_eq!(run.counters.entries_failed, 0);
    assert_eq!(run.counters.points_inserted, 20);
    assert_eq!(run.counters.requests_made, 3);
    assert!(run.completed_at.is_some());

    assert_eq!(store.count_data_points("nipa").expect("count"), 20);
    let freshness = store.freshness("nipa").expect("freshness");
    assert_eq!(freshness.latest_period.as_deref(), Some("2024Q4"));
    assert!(!freshness.needs_update);
    assert!(!freshness.update_in_progress);
    assert!(freshness.last_collected_at.is_some());
    // A run that inserted points counts as one check that found an update
    assert_eq!(freshness.total_checks, 1);
    assert_eq!(freshness.total_updates_detected, 1);

    // And: every logical call landed in the usage ledger
    let minutes = store.usage_minutes("bea", 10).expect("usage");
    let attempts: i64 = minutes.iter().map(|m| m.attempts).sum();
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn when_recollecting_identical_data_nothing_is_rewritten() {
    let (_temp, store) = open_temp_store();
    seed_catalog(&store, "nipa", 2);
    let http = Arc::new(RoutedHttpClient::new());
    http.on_ok("table=T01", quarterly_body(1, &["2024Q1", "2024Q2"]));
    http.on_ok("table=T02", quarterly_body(2, &["2024Q1", "2024Q2"]));

    let client = Arc::new(ProviderClient::new(
        test_provider(),
        http,
        Arc::new(DiscardUsage),
    ));
    let runner = TaskRunner::new(store.clone());
    runner.register_dataset("nipa", client);

    let first = runner
        .start_backfill("nipa", Some(TimeWindow::new(2024, 2024)), Granularity::Quarterly, None)
        .expect("first run");
    runner.wait_until_idle().await;
    let second = runner
        .start_backfill("nipa", Some(TimeWindow::new(2024, 2024)), Granularity::Quarterly, None)
        .expect("second run");
    runner.wait_until_idle().await;

    let first = store.get_run(&first).expect("query").expect("row");
    let second = store.get_run(&second).expect("query").expect("row");
    assert_eq!(first.counters.points_inserted, 4);
    assert_eq!(second.status, RunStatus::Completed.as_str());
    assert_eq!(second.counters.points_inserted, 0);
    assert_eq!(second.counters.points_updated, 0);
    assert_eq!(store.count_data_points("nipa").expect("count"), 4);

    // Both runs count as checks, but only the first changed anything
    let freshness = store.freshness("nipa").expect("freshness");
    assert_eq!(freshness.total_checks, 2);
    assert_eq!(freshness.total_updates_detected, 1);
}

#[tokio::test]
async fn when_one_entry_fails_the_rest_still_commit_and_the_run_is_partial() {
    // Given: five tables, the third of which the provider rejects
    let (_temp, store) = open_temp_store();
    seed_catalog(&store, "nipa", 5);
    let http = Arc::new(RoutedHttpClient::new());
    for i in [1usize, 2, 4, 5] {
        http.on_ok(format!("table=T{i:02}"), quarterly_body(i, &["2024Q1"]));
    }
    http.on_ok("table=T03", upstream_error_body("40", "Invalid TableName"));

    let client = Arc::new(ProviderClient::new(
        test_provider(),
        http,
        Arc::new(DiscardUsage),
    ));
    let runner = TaskRunner::new(store.clone());
    runner.register_dataset("nipa", client);

    let run_id = runner
        .start_backfill("nipa", Some(TimeWindow::new(2024, 2024)), Granularity::Quarterly, None)
        .expect("run starts");
    runner.wait_until_idle().await;

    // Then: four entries committed, one recorded as failed, run is partial
    let run = store.get_run(&run_id).expect("query").expect("row");
    assert_eq!(run.status, RunStatus::Partial.as_str());
    assert_eq!(run.counters.entries_processed, 5);
    assert_eq!(run.counters.entries_failed, 1);
    assert_eq!(run.counters.points_inserted, 4);
    let summary = run.error_summary.expect("summary recorded");
    assert!(summary.contains("T03"), "summary was: {summary}");
    assert!(summary.contains("Invalid TableName"), "summary was: {summary}");

    // And: a partial run does not clear a pending freshness flag
    assert_eq!(store.count_data_points("nipa").expect("count"), 4);
}

#[tokio::test]
async fn when_the_provider_locks_out_the_run_stops_early_as_partial() {
    // Given: an error ceiling of one, so a single fatal status trips the
    // lockout before the third table is reached
    let (_temp, store) = open_temp_store();
    seed_catalog(&store, "nipa", 3);
    let http = Arc::new(RoutedHttpClient::new());
    http.on_ok("table=T01", quarterly_body(1, &["2024Q1"]));
    http.on_status("table=T02", 400, "bad request");
    http.on_ok("table=T03", quarterly_body(3, &["2024Q1"]));

    let client = Arc::new(ProviderClient::new(
        trigger_happy_provider(),
        http.clone(),
        Arc::new(DiscardUsage),
    ));
    let runner = TaskRunner::new(store.clone());
    runner.register_dataset("nipa", client);

    let run_id = runner
        .start_backfill("nipa", Some(TimeWindow::new(2024, 2024)), Granularity::Quarterly, None)
        .expect("run starts");
    runner.wait_until_idle().await;

    // Then: work already committed survives, the third table was never
    // fetched, and the summary names the lockout
    let run = store.get_run(&run_id).expect("query").expect("row");
    assert_eq!(run.status, RunStatus::Partial.as_str());
    assert_eq!(run.counters.entries_processed, 2);
    assert_eq!(run.counters.entries_failed, 1);
    assert_eq!(http.calls(), 2, "the locked-out entry must not be fetched");
    let summary = run.error_summary.expect("summary recorded");
    assert!(summary.contains("locked out"), "summary was: {summary}");
    assert_eq!(store.count_data_points("nipa").expect("count"), 1);
}

#[tokio::test]
async fn when_the_catalog_is_empty_the_run_completes_with_zero_work() {
    let (_temp, store) = open_temp_store();
    let client = Arc::new(ProviderClient::new(
        test_provider(),
        Arc::new(RoutedHttpClient::new()),
        Arc::new(DiscardUsage),
    ));
    let runner = TaskRunner::new(store.clone());
    runner.register_dataset("empty", client);

    let run_id = runner
        .start_backfill("empty", None, Granularity::Annual, None)
        .expect("run starts");
    runner.wait_until_idle().await;

    let run = store.get_run(&run_id).expect("query").expect("row");
    assert_eq!(run.status, RunStatus::Completed.as_str());
    assert_eq!(run.counters.entries_processed, 0);
}

#[tokio::test]
async fn when_an_entry_filter_is_given_only_those_tables_are_fetched() {
    let (_temp, store) = open_temp_store();
    seed_catalog(&store, "nipa", 4);
    let http = Arc::new(RoutedHttpClient::new());
    http.on_ok("table=T02", quarterly_body(2, &["2024Q1"]));

    let client = Arc::new(ProviderClient::new(
        test_provider(),
        http.clone(),
        Arc::new(DiscardUsage),
    ));
    let runner = TaskRunner::new(store.clone());
    runner.register_dataset("nipa", client);

    let run_id = runner
        .start_backfill(
            "nipa",
            Some(TimeWindow::new(2024, 2024)),
            Granularity::Quarterly,
            Some(vec![String::from("T02")]),
        )
        .expect("run starts");
    runner.wait_until_idle().await;

    let run = store.get_run(&run_id).expect("query").expect("row");
    assert_eq!(run.status, RunStatus::Completed.as_str());
    assert_eq!(run.counters.entries_processed, 1);
    assert_eq!(http.calls(), 1);
}
