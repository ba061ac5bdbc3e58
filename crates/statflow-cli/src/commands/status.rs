use statflow_warehouse::Warehouse;

use crate::cli::StatusArgs;
use crate::commands::print_json;
use crate::error::CliError;

pub fn run(store: &Warehouse, args: &StatusArgs, pretty: bool) -> Result<(), CliError> {
    if let Some(run_id) = &args.run {
        let run = store
            .get_run(run_id)?
            .ok_or(statflow_core::CollectError::RunNotFound {
                run_id: run_id.clone(),
            })?;
        return print_json(&run, pretty);
    }

    let dataset = args.dataset.as_deref().ok_or_else(|| {
        CliError::InvalidArgument(String::from("pass a dataset name or --run <id>"))
    })?;
    let runs = store.recent_runs(dataset, args.limit)?;
    print_json(&runs, pretty)
}
