use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use courtreg_sync::{
    export_cases, migrate, FailurePolicy, FileStatus, ImportConfig, ImportPipeline, ImportSummary,
    MemoryCaseStore, MergeStatus, PgCaseStore, SyncConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "courtreg-cli")]
#[command(about = "Court case registry importer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the dataset, download and unpack its resources, then import them.
    Sync,
    /// Import every CSV file directly inside DIR.
    Import {
        dir: PathBuf,
        /// Merge into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
        /// Roll the run back if any file fails.
        #[arg(long)]
        abort_on_file_failure: bool,
        /// Write a JSON run report under this directory.
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Export stored cases listed in the first column of INPUT.
    Export {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn connect(config: &ImportConfig) -> Result<PgCaseStore> {
    PgCaseStore::connect(
        &config.database_url,
        config.max_connections,
        config.statement_timeout,
    )
    .await
}

fn print_import(summary: &ImportSummary) -> ExitCode {
    for file in &summary.files {
        match &file.status {
            FileStatus::Loaded { rows } => println!("✔ {} -> {} rows", file.name, rows),
            FileStatus::Failed { error } => println!("✘ {} -> {}", file.name, error),
        }
    }

    match &summary.merge {
        MergeStatus::Merged(outcome) => {
            println!(
                "merge complete: run_id={} staged={} merged={} failed_files={}",
                summary.run_id,
                outcome.staged_rows,
                outcome.merged_rows,
                summary.failed_files()
            );
            ExitCode::SUCCESS
        }
        MergeStatus::NoInput => {
            println!("no CSV files found in {}", summary.input_dir.display());
            ExitCode::SUCCESS
        }
        MergeStatus::Aborted { failed_files } => {
            eprintln!(
                "merge aborted: run_id={} failed_files={} (nothing was written)",
                summary.run_id, failed_files
            );
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err.into());
        }
    }
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = SyncConfig::from_env()?;
            let summary = courtreg_sync::run_sync(&config).await?;

            println!(
                "dataset {} ({})",
                summary.dataset_id,
                summary.dataset_title.as_deref().unwrap_or("untitled")
            );
            for report in &summary.downloads {
                match &report.result {
                    Ok(outcome) => println!("✔ {} -> {}", report.name, outcome.path.display()),
                    Err(error) => println!("✘ {} -> {}", report.name, error),
                }
            }
            for archive in &summary.archives {
                let status = if archive.csv_files > 0 { "ok" } else { "empty or invalid" };
                println!("{} -> {} CSV ({status})", archive.archive, archive.csv_files);
            }
            Ok(print_import(&summary.import))
        }
        Commands::Import {
            dir,
            dry_run,
            abort_on_file_failure,
            reports_dir,
        } => {
            let mut config = ImportConfig::from_env()?;
            if abort_on_file_failure {
                config.failure_policy = FailurePolicy::AbortOnFileFailure;
            }
            if reports_dir.is_some() {
                config.reports_dir = reports_dir;
            }

            if dry_run {
                let store = MemoryCaseStore::new();
                let summary = ImportPipeline::new(store.clone(), &config).run(&dir).await?;
                let code = print_import(&summary);
                println!("dry run: {} distinct cases would be merged", store.len());
                Ok(code)
            } else {
                let store = connect(&config).await?;
                let summary = ImportPipeline::new(store, &config).run(&dir).await?;
                Ok(print_import(&summary))
            }
        }
        Commands::Export { input, output } => {
            let config = ImportConfig::from_env()?;
            let store = connect(&config).await?;
            let written = export_cases(&store, &input, &output).await?;
            println!("exported {written} rows to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => {
            let config = ImportConfig::from_env()?;
            let store = connect(&config).await?;
            migrate(store.pool()).await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}
