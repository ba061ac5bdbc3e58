use serde::Serialize;
use statflow_core::{TaskRunner, TimeWindow};
use statflow_warehouse::{RunRow, Warehouse};

use crate::cli::CollectArgs;
use crate::commands::{print_json, provider_client};
use crate::error::CliError;

#[derive(Serialize)]
struct CollectOutcome {
    run_id: String,
    run: RunRow,
}

pub async fn backfill(store: &Warehouse, args: &CollectArgs, pretty: bool) -> Result<(), CliError> {
    let window = match (args.start_year, args.end_year) {
        (None, None) => None,
        (start, end) => {
            let default = TimeWindow::backfill_default();
            Some(TimeWindow::new(
                start.unwrap_or(default.start_year),
                end.unwrap_or(default.end_year),
            ))
        }
    };

    let runner = runner_for(store, args)?;
    let run_id = runner.start_backfill(
        &args.dataset,
        window,
        args.frequency.into(),
        args.entries.clone(),
    )?;
    finish(store, runner, run_id, pretty).await
}

pub async fn update(store: &Warehouse, args: &CollectArgs, pretty: bool) -> Result<(), CliError> {
    let runner = runner_for(store, args)?;
    let run_id = runner.start_update(&args.dataset, args.frequency.into(), args.entries.clone())?;
    finish(store, runner, run_id, pretty).await
}

fn runner_for(store: &Warehouse, args: &CollectArgs) -> Result<TaskRunner, CliError> {
    let client = provider_client(store, &args.provider)?;
    let runner = TaskRunner::new(store.clone());
    runner.register_dataset(&args.dataset, client);
    Ok(runner)
}

async fn finish(
    store: &Warehouse,
    runner: TaskRunner,
    run_id: String,
    pretty: bool,
) -> Result<(), CliError> {
    runner.wait_until_idle().await;
    let run = store
        .get_run(&run_id)?
        .ok_or(statflow_core::CollectError::RunNotFound {
            run_id: run_id.clone(),
        })?;
    print_json(&CollectOutcome { run_id, run }, pretty)
}
