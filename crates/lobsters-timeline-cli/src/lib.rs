//! Command surface for the lobsters latency timeline.
//!
//! - [`run_cli`] executes a parsed command line.
//! - [`render_timeline`] loads, prepares and renders one figure against an
//!   open store.
//! - [`prepare_rows`] is the load-free half of rendering, shared with `show`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use lobsters_timeline_core::{
    percentile_order_violations, prepare_timeline, FilterConfig, SummaryRow, SummaryTable,
    TableIndex, TimelineConfig,
};
use lobsters_timeline_store_sqlite::{DatasetSummary, ImportReport, SqliteSummaryStore};
use serde::Serialize;

mod render;

pub use render::render_chart;

pub const TIMELINE_ROWS_CONTRACT: &str = "timeline_rows.v1";

#[derive(Debug, Parser)]
#[command(name = "timeline")]
#[command(about = "Percentile-banded latency timeline for the lobsters benchmark")]
pub struct Cli {
    #[arg(long, default_value = "./results.sqlite3")]
    db: PathBuf,

    /// JSON file replacing the built-in figure configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    dataset: Option<String>,

    /// Load only rows whose validation flag is set.
    #[arg(long)]
    only_good: bool,

    /// Output file base name; `.pdf` is appended. A name equal to a
    /// subcommand must follow `--`, as in `timeline -- show`.
    output: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Import summary rows from a CSV file into the dataset.
    Import(ImportArgs),
    /// Print the filtered and anchored rows the chart would draw.
    Show(JsonArgs),
    /// List imported datasets.
    Datasets(JsonArgs),
    /// Print the effective configuration as JSON.
    Config,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    csv: PathBuf,
    /// Drop the dataset's existing rows in the same transaction.
    #[arg(long)]
    replace: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimelineRowsPayload {
    pub contract_version: String,
    pub dataset: String,
    pub only_good: bool,
    pub filter: FilterConfig,
    pub index: TableIndex,
    pub rows: Vec<SummaryRow>,
}

/// Executes the parsed command line.
///
/// Without a subcommand the figure is rendered to `<OUTPUT>.pdf`.
///
/// # Errors
/// Returns an error when configuration loading, store access, import, or
/// rendering fails, or when the output base name is missing or combined with
/// a subcommand.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;

    match (cli.command, cli.output) {
        (Some(_), Some(output)) => Err(anyhow!(
            "output base name {output:?} cannot be combined with a subcommand"
        )),
        (None, None) => Err(anyhow!(
            "missing output base name; usage: timeline [OPTIONS] <OUTPUT>"
        )),
        (None, Some(output)) => {
            let store = open_store(&cli.db)?;
            render_timeline(&store, &config, &output).map(|_| ())
        }
        (Some(Command::Import(args)), None) => {
            let mut store = open_store(&cli.db)?;
            let report = store.import_csv(&config.dataset, &args.csv, args.replace)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_import_report(&report);
            }
            Ok(())
        }
        (Some(Command::Show(args)), None) => {
            let store = open_store(&cli.db)?;
            let table = load_prepared(&store, &config)?;
            let payload = rows_payload(&config, table);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_rows_table(&payload);
            }
            Ok(())
        }
        (Some(Command::Datasets(args)), None) => {
            let store = open_store(&cli.db)?;
            let datasets = store.datasets()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&datasets)?);
            } else {
                print_datasets(&datasets);
            }
            Ok(())
        }
        (Some(Command::Config), None) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Loads the configuration named by `--config` (or the built-in figure) and
/// applies the `--dataset` and `--only-good` overrides.
fn resolve_config(cli: &Cli) -> Result<TimelineConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dataset) = &cli.dataset {
        config.dataset.clone_from(dataset);
    }
    if cli.only_good {
        config.only_good = true;
    }
    config.validate()?;
    Ok(config)
}

/// Reads a JSON configuration file, or returns the built-in figure
/// configuration when `path` is `None`.
///
/// # Errors
/// Returns an error when the file cannot be read or does not describe a
/// valid configuration.
pub fn load_config(path: Option<&Path>) -> Result<TimelineConfig> {
    let Some(path) = path else {
        return Ok(TimelineConfig::lobsters());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    TimelineConfig::from_json_str(&raw)
        .with_context(|| format!("invalid config {}", path.display()))
}

fn open_store(db: &Path) -> Result<SqliteSummaryStore> {
    let store = SqliteSummaryStore::open(db)?;
    store.migrate()?;
    Ok(store)
}

/// Filters and anchors `rows`, logging the selection size and any percentile
/// ordering violations. Neither an empty selection nor a violation is an
/// error.
#[must_use]
pub fn prepare_rows(rows: Vec<SummaryRow>, config: &TimelineConfig) -> SummaryTable {
    let loaded = rows.len();
    let table = prepare_timeline(rows, config);
    tracing::debug!(loaded, prepared = table.len(), "filtered and anchored summary rows");

    if table.is_empty() {
        tracing::warn!(
            dataset = %config.dataset,
            op = %config.filter.op,
            scale = config.filter.scale,
            memlimit = config.filter.memlimit,
            "no summary rows match the timeline filter; the chart will be empty"
        );
    }
    for violation in percentile_order_violations(table.rows()) {
        tracing::warn!(
            position = violation.position,
            until = violation.until,
            detail = %violation.detail,
            "percentile columns out of order"
        );
    }

    table
}

fn load_prepared(store: &SqliteSummaryStore, config: &TimelineConfig) -> Result<SummaryTable> {
    let rows = store.load(&config.dataset, config.only_good)?;
    tracing::info!(
        dataset = %config.dataset,
        only_good = config.only_good,
        rows = rows.len(),
        "loaded summary rows"
    );
    Ok(prepare_rows(rows, config))
}

/// Renders the configured figure from `store` into `<output>.pdf` and returns
/// the written path.
///
/// # Errors
/// Returns an error when the dataset cannot be loaded or the chart cannot be
/// drawn or written.
pub fn render_timeline(
    store: &SqliteSummaryStore,
    config: &TimelineConfig,
    output: &str,
) -> Result<PathBuf> {
    let table = load_prepared(store, config)?;
    let path = output_path(output);
    render_chart(&table, &config.render, &path)
        .with_context(|| format!("failed to render {}", path.display()))?;
    Ok(path)
}

#[must_use]
pub fn output_path(output: &str) -> PathBuf {
    PathBuf::from(format!("{output}.pdf"))
}

#[must_use]
pub fn rows_payload(config: &TimelineConfig, table: SummaryTable) -> TimelineRowsPayload {
    TimelineRowsPayload {
        contract_version: TIMELINE_ROWS_CONTRACT.to_string(),
        dataset: config.dataset.clone(),
        only_good: config.only_good,
        filter: config.filter.clone(),
        index: table.index(),
        rows: table.into_rows(),
    }
}

fn print_import_report(report: &ImportReport) {
    println!(
        "contract={} dataset={} imported_rows={} good_rows={} replaced_rows={} imported_at={}",
        report.contract_version,
        report.dataset,
        report.imported_rows,
        report.good_rows,
        report.replaced_rows,
        report.imported_at
    );
}

fn print_rows_table(payload: &TimelineRowsPayload) {
    println!(
        "dataset: {} only_good: {}",
        payload.dataset,
        if payload.only_good { "yes" } else { "no" }
    );
    println!(
        "{:<8} {:<8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
        "partial", "until", "p25", "median", "p90", "p95", "p99", "max", "mean"
    );
    println!("{}", "-".repeat(90));

    for row in &payload.rows {
        println!(
            "{:<8} {:<8} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
            if row.partial { "yes" } else { "no" },
            row.until,
            row.p25,
            row.median,
            row.p90,
            row.p95,
            row.p99,
            row.max,
            row.mean
        );
    }
}

fn print_datasets(datasets: &[DatasetSummary]) {
    println!(
        "{:<24} {:>8} {:>10} last_imported_at",
        "dataset", "rows", "good_rows"
    );
    println!("{}", "-".repeat(72));
    for dataset in datasets {
        println!(
            "{:<24} {:>8} {:>10} {}",
            dataset.dataset, dataset.rows, dataset.good_rows, dataset.last_imported_at
        );
    }
}
