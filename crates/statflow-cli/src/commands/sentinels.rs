use serde::Serialize;
use statflow_core::{FreshnessDetector, SentinelConfig};
use statflow_warehouse::Warehouse;

use crate::cli::{SentinelCheckArgs, SentinelSelectArgs, SentinelsCommand};
use crate::commands::{print_json, provider_client};
use crate::error::CliError;

#[derive(Serialize)]
struct SelectOutcome {
    dataset: String,
    selected: usize,
    sentinels: Vec<String>,
}

#[derive(Serialize)]
struct SyncOutcome {
    dataset: String,
    synced: usize,
}

pub async fn run(
    store: &Warehouse,
    command: &SentinelsCommand,
    pretty: bool,
) -> Result<(), CliError> {
    match command {
        SentinelsCommand::Select(args) => select(store, args, pretty).await,
        SentinelsCommand::Check(args) => check(store, args, pretty).await,
        SentinelsCommand::Sync(args) => {
            let synced = store.sync_sentinel_baselines(&args.dataset)?;
            print_json(
                &SyncOutcome {
                    dataset: args.dataset.clone(),
                    synced,
                },
                pretty,
            )
        }
        SentinelsCommand::List(args) => {
            let rows = store.list_sentinels(&args.dataset)?;
            print_json(&rows, pretty)
        }
    }
}

async fn select(store: &Warehouse, args: &SentinelSelectArgs, pretty: bool) -> Result<(), CliError> {
    if !(0.0..=1.0).contains(&args.fraction) {
        return Err(CliError::InvalidArgument(format!(
            "--fraction must be between 0 and 1, got {}",
            args.fraction
        )));
    }
    let config = SentinelConfig {
        target_fraction: args.fraction,
        min_count: args.min,
        max_count: args.max,
        ..SentinelConfig::default()
    };
    let client = provider_client(store, &args.provider)?;
    let detector = FreshnessDetector::new(store.clone(), client, config);

    let rows = detector.select(&args.dataset).await?;
    print_json(
        &SelectOutcome {
            dataset: args.dataset.clone(),
            selected: rows.len(),
            sentinels: rows.into_iter().map(|row| row.series_key).collect(),
        },
        pretty,
    )
}

async fn check(store: &Warehouse, args: &SentinelCheckArgs, pretty: bool) -> Result<(), CliError> {
    let client = provider_client(store, &args.provider)?;
    let detector = FreshnessDetector::new(store.clone(), client, SentinelConfig::default());

    let report = detector.check(&args.dataset).await?;
    let freshness = store.freshness(&args.dataset)?;

    #[derive(Serialize)]
    struct CheckOutcome {
        checked: usize,
        changed: usize,
        needs_update: bool,
        freshness: statflow_warehouse::FreshnessRow,
    }
    print_json(
        &CheckOutcome {
            checked: report.checked,
            changed: report.changed,
            needs_update: report.needs_update,
            freshness,
        },
        pretty,
    )
}
