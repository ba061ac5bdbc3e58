use statflow_warehouse::Warehouse;

use crate::cli::UsageArgs;
use crate::commands::print_json;
use crate::error::CliError;

pub fn run(store: &Warehouse, args: &UsageArgs, pretty: bool) -> Result<(), CliError> {
    let minutes = store.usage_minutes(&args.provider, args.limit)?;
    print_json(&minutes, pretty)
}
