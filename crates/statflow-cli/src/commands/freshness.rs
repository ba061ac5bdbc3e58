use statflow_warehouse::Warehouse;

use crate::cli::DatasetArgs;
use crate::commands::print_json;
use crate::error::CliError;

pub fn run(store: &Warehouse, args: &DatasetArgs, pretty: bool) -> Result<(), CliError> {
    let row = store.freshness(&args.dataset)?;
    print_json(&row, pretty)
}
