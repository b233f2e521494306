use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledgerflow_core::{ns_to_iso8601, PipelineTarget, TableName};
use ledgerflow_sync::{maintenance, schedule, EtlConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ledgerflow")]
#[command(about = "Incremental ledger ETL into a warehouse")]
struct Cli {
    /// Overrides PIPELINE_TARGET.
    #[arg(long, global = true)]
    target: Option<PipelineTarget>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one window and exit (default).
    Run {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run on a cron schedule until ctrl-c.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
    /// Last job log entries and table sizes per target.
    Status,
    #[command(subcommand)]
    Snapshots(SnapshotCommands),
    #[command(subcommand)]
    Tables(TableCommands),
}

#[derive(Debug, Subcommand)]
enum SnapshotCommands {
    List {
        #[arg(long)]
        table: Option<String>,
    },
    /// Delete snapshots older than SNAPSHOT_RETENTION_DAYS.
    Prune,
    /// Delete every snapshot.
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum TableCommands {
    /// Delete all rows of the data tables and the job log.
    Truncate {
        #[arg(long)]
        yes: bool,
    },
    /// Drop the data tables and the job log.
    Drop {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match EtlConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(target) = cli.target {
        config = config.with_target(target);
    }
    init_tracing(&config.log_level);

    match dispatch(cli.command.unwrap_or(Commands::Run { json: false }), config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("command failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn dispatch(command: Commands, config: EtlConfig) -> Result<()> {
    match command {
        Commands::Run { json } => {
            let runner = ledgerflow_sync::build_runner(config).await?;
            let summary = runner.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "run complete: job_id={} target={} window={} rows={} pages={} pruned_snapshots={}",
                    summary.job_id,
                    summary.target,
                    summary.window,
                    summary.rows_written,
                    summary.pages,
                    summary.pruned_snapshots
                );
            }
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.schedule_cron.clone());
            let runner = ledgerflow_sync::build_runner(config).await?;
            schedule::run_scheduled(Arc::new(runner), &cron).await?;
        }
        Commands::Status => {
            let runner = ledgerflow_sync::build_runner(config).await?;
            let statuses =
                maintenance::status(runner.job_log(), runner.warehouse().as_ref(), runner.config()).await?;
            for status in statuses {
                let last_success = status
                    .last_success
                    .map(|entry| format!("{} (logged {})", entry.window, entry.logged_at.to_rfc3339()))
                    .unwrap_or_else(|| "never".to_string());
                println!("{}: last success {last_success}", status.target);
                if let Some(entry) = status.last_entry.filter(|entry| !entry.is_success()) {
                    println!(
                        "  last entry failed at {}: {}",
                        ns_to_iso8601(entry.window.start_ns()),
                        entry.message.unwrap_or_default()
                    );
                }
                for (table, rows) in status.tables {
                    match rows {
                        Some(rows) => println!("  {table}: {rows} rows"),
                        None => println!("  {table}: missing"),
                    }
                }
            }
        }
        Commands::Snapshots(command) => snapshots(command, config).await?,
        Commands::Tables(command) => tables(command, config).await?,
    }
    Ok(())
}

async fn snapshots(command: SnapshotCommands, config: EtlConfig) -> Result<()> {
    let runner = ledgerflow_sync::build_runner(config).await?;
    let manager = runner.snapshots();
    match command {
        SnapshotCommands::List { table } => {
            let filter = table.as_deref().map(parse_table).transpose()?;
            let snapshots = manager.list_snapshots(filter).await.context("listing snapshots")?;
            if snapshots.is_empty() {
                println!("no snapshots");
            }
            for info in snapshots {
                let created = info
                    .created_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{}\t{}\t{}\t{} rows", info.snapshot, info.source, created, info.row_count);
            }
        }
        SnapshotCommands::Prune => {
            let mut pruned = 0;
            for table in snapshot_tables() {
                pruned += manager.prune_expired(table).await?.len();
            }
            println!("pruned {pruned} snapshots");
        }
        SnapshotCommands::Purge { yes } => {
            require_confirmation(yes, "purge every snapshot")?;
            let purged = manager.purge_all().await.context("purging snapshots")?;
            println!("purged {purged} snapshots");
        }
    }
    Ok(())
}

async fn tables(command: TableCommands, config: EtlConfig) -> Result<()> {
    let warehouse = ledgerflow_sync::connect_warehouse(&config).await?;
    match command {
        TableCommands::Truncate { yes } => {
            require_confirmation(yes, "delete all pipeline data")?;
            let cleaned = maintenance::truncate_tables(warehouse.as_ref(), &config).await?;
            info!(tables = cleaned.len(), "tables truncated");
            println!("truncated {} tables", cleaned.len());
        }
        TableCommands::Drop { yes } => {
            require_confirmation(yes, "drop the pipeline tables")?;
            let dropped = maintenance::drop_tables(warehouse.as_ref(), &config).await?;
            println!("dropped {} tables", dropped.len());
        }
    }
    Ok(())
}

/// Every table some pipeline target snapshots; the job log is never among them.
fn snapshot_tables() -> Vec<TableName> {
    let mut tables: Vec<TableName> = PipelineTarget::ALL
        .iter()
        .flat_map(|target| target.data_tables().iter().copied())
        .collect();
    tables.sort();
    tables.dedup();
    tables
}

fn parse_table(name: &str) -> Result<TableName> {
    TableName::ALL
        .into_iter()
        .find(|table| table.as_str() == name)
        .with_context(|| format!("unknown table {name}"))
}

fn require_confirmation(yes: bool, action: &str) -> Result<()> {
    if !yes {
        bail!("refusing to {action} without --yes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_defaults_to_run() {
        let cli = Cli::try_parse_from(["ledgerflow"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.target.is_none());
    }

    #[test]
    fn target_flag_parses_pipeline_targets() {
        let cli = Cli::try_parse_from(["ledgerflow", "run", "--target", "transactions"]).unwrap();
        assert_eq!(cli.target, Some(PipelineTarget::Transactions));
        assert!(Cli::try_parse_from(["ledgerflow", "--target", "blocks"]).is_err());
    }

    #[test]
    fn destructive_commands_need_confirmation() {
        assert!(require_confirmation(false, "drop").is_err());
        assert!(require_confirmation(true, "drop").is_ok());
        let cli = Cli::try_parse_from(["ledgerflow", "tables", "drop", "--yes"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Tables(TableCommands::Drop { yes: true }))));
    }

    #[test]
    fn prune_covers_every_target_data_table() {
        assert_eq!(
            snapshot_tables(),
            vec![TableName::NewAccounts, TableName::TransactionHistory]
        );
    }

    #[test]
    fn snapshot_table_filter_accepts_data_tables() {
        assert_eq!(parse_table("new_accounts").unwrap(), TableName::NewAccounts);
        assert!(parse_table("blocks").is_err());
    }
}
