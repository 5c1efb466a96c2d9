use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::commands::{self, CommandReport};
use crate::logging;

#[derive(Parser)]
#[command(
    name = "jsaingest",
    version,
    about = "Ingest reduced telescope products into the observation archive"
)]
struct Cli {
    /// Print the command report as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Debug logging (overridden by INGEST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge and resolve a batch without writing anything
    Check(CheckArgs),
    /// Merge, resolve and reconcile a batch against the repository
    Ingest(IngestArgs),
    /// Show resolved paths, configuration and environment
    Status,
}

#[derive(Args)]
struct BatchArgs {
    /// Directory holding data files and their `.meta.json` descriptors
    #[arg(long, value_name = "DIR")]
    indir: PathBuf,
    /// Target collection (default from configuration)
    #[arg(long)]
    collection: Option<String>,
    /// Only accept files whose name starts with this prefix
    #[arg(long)]
    prefix: Option<String>,
}

#[derive(Args)]
struct CheckArgs {
    #[command(flatten)]
    batch: BatchArgs,
}

#[derive(Args)]
struct IngestArgs {
    #[command(flatten)]
    batch: BatchArgs,
    /// Compute everything but commit nothing
    #[arg(short = 'n', long)]
    dry_run: bool,
    /// Also write each final observation record to this directory
    #[arg(long, value_name = "DIR")]
    xmloutdir: Option<PathBuf>,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}: {}", report.command, if report.ok { "ok" } else { "failed" });
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let report = match cli.command {
        Command::Check(args) => commands::check::run(&commands::check::CheckOptions {
            indir: args.batch.indir,
            collection: args.batch.collection,
            prefix: args.batch.prefix,
        })?,
        Command::Ingest(args) => commands::ingest::run(&commands::ingest::IngestCommandOptions {
            indir: args.batch.indir,
            collection: args.batch.collection,
            prefix: args.batch.prefix,
            dry_run: args.dry_run,
            side_output: args.xmloutdir,
        })?,
        Command::Status => commands::status::run()?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}
