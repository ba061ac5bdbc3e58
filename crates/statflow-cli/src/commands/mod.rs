mod catalog;
mod collect;
mod freshness;
mod sentinels;
mod status;
mod usage;

use std::sync::Arc;

use serde::Serialize;
use statflow_core::{ProviderClient, ProviderSpec, ReqwestClient};
use statflow_warehouse::Warehouse;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub async fn run(cli: &Cli) -> Result<(), CliError> {
    let store = Warehouse::open_default()?;

    match &cli.command {
        Command::Backfill(args) => collect::backfill(&store, args, cli.pretty).await,
        Command::Update(args) => collect::update(&store, args, cli.pretty).await,
        Command::Status(args) => status::run(&store, args, cli.pretty),
        Command::Freshness(args) => freshness::run(&store, args, cli.pretty),
        Command::Sentinels(command) => sentinels::run(&store, command, cli.pretty).await,
        Command::Catalog(command) => catalog::run(&store, command, cli.pretty),
        Command::Usage(args) => usage::run(&store, args, cli.pretty),
    }
}

/// Build the provider client a dataset's calls go through. The warehouse
/// doubles as the usage sink so every call lands in the ledger.
pub fn provider_client(store: &Warehouse, provider: &str) -> Result<Arc<ProviderClient>, CliError> {
    let spec = ProviderSpec::builtin(provider).ok_or_else(|| {
        CliError::InvalidArgument(format!("unknown provider '{provider}', expected bea or bls"))
    })?;
    Ok(Arc::new(ProviderClient::new(
        spec,
        Arc::new(ReqwestClient::new()),
        Arc::new(store.clone()),
    )))
}

pub fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<(), CliError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{rendered}");
    Ok(())
}
