use std::fs;

use serde::{Deserialize, Serialize};
use statflow_warehouse::{CatalogRow, Warehouse};

use crate::cli::{CatalogCommand, CatalogImportArgs};
use crate::commands::print_json;
use crate::error::CliError;

/// Catalog entry as it appears in an import file.
#[derive(Debug, Deserialize)]
struct FileEntry {
    dataset: String,
    entry_id: String,
    title: String,
    series_keys: Vec<String>,
    /// Granularity codes, comma-separated (`"A,Q"`).
    granularities: String,
    #[serde(default)]
    is_headline: bool,
    #[serde(default)]
    group_dim: Option<String>,
}

#[derive(Serialize)]
struct ImportOutcome {
    imported: usize,
}

pub fn run(store: &Warehouse, command: &CatalogCommand, pretty: bool) -> Result<(), CliError> {
    match command {
        CatalogCommand::Import(args) => import(store, args, pretty),
        CatalogCommand::List(args) => {
            let rows = store.list_catalog(&args.dataset)?;
            print_json(&rows, pretty)
        }
    }
}

fn import(store: &Warehouse, args: &CatalogImportArgs, pretty: bool) -> Result<(), CliError> {
    let text = fs::read_to_string(&args.file)?;
    let entries: Vec<FileEntry> = serde_json::from_str(&text)?;
    let rows: Vec<CatalogRow> = entries
        .into_iter()
        .map(|entry| CatalogRow {
            dataset: entry.dataset,
            entry_id: entry.entry_id,
            title: entry.title,
            series_keys: entry.series_keys,
            granularities: entry.granularities,
            is_headline: entry.is_headline,
            group_dim: entry.group_dim,
        })
        .collect();

    let imported = store.import_catalog(&rows)?;
    print_json(&ImportOutcome { imported }, pretty)
}
