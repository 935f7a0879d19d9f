//! Merge every worker's result log into one benchmark table.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use nb_data::BenchmarkTable;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "nb-merge", about = "Combine worker result logs into a benchmark table")]
struct Cli {
    /// Directory holding the workers' `*.jsonl` result logs.
    #[arg(long, default_value = "./result_base/train_frappe")]
    input: PathBuf,

    /// Output file. Defaults to `<input>/benchmark_table.json`.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Keep only records of this run.
    #[arg(long = "run_id")]
    run_id: Option<Uuid>,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with_writer(std::io::stderr)
        .init();

    let table = BenchmarkTable::from_dir(&cli.input, cli.run_id)
        .with_context(|| format!("reading result logs in {}", cli.input.display()))?;

    let output = cli
        .output
        .unwrap_or_else(|| cli.input.join("benchmark_table.json"));
    table
        .write_json(&output)
        .with_context(|| format!("writing {}", output.display()))?;

    info!(
        "{} architectures ({} completed, {} failed) from {} files, {} unreadable lines skipped",
        table.len(),
        table.completed(),
        table.len() - table.completed(),
        table.files_read,
        table.skipped_lines
    );
    if let Some(best) = table.best() {
        info!(
            "Best architecture {} with score {:.5}",
            best.arch,
            best.final_score().unwrap_or_default()
        );
    }
    println!("{}", output.display());
    Ok(())
}
