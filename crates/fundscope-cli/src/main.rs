use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fundscope_core::AnalysisCategory;
use fundscope_ingest::{
    build_scheduler, startup_cleanup, HttpReportFetcher, IngestConfig, Ingestor, SchedulerSettings,
};
use fundscope_storage::{MemoryRepository, ReportArchive, SnapshotRepository};
use fundscope_web::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundscope")]
#[command(about = "Funding analysis snapshot service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with the scheduler, purging and refreshing on startup.
    Serve,
    /// Fetch, normalize and store one category's report, then exit.
    Ingest { category: AnalysisCategory },
    /// Ingest every category in order with the configured cooldown, then exit.
    RunAll,
    /// Delete every stored snapshot and record, then exit.
    Purge,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fundscope_ingest=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_ingestor(config: &IngestConfig) -> Result<Arc<Ingestor>> {
    let repository: Arc<dyn SnapshotRepository> = Arc::new(MemoryRepository::new());
    let fetcher = Arc::new(HttpReportFetcher::new(config)?);
    let archive = config.archive_dir.as_ref().map(ReportArchive::new);
    Ok(Arc::new(Ingestor::new(fetcher, repository, archive)))
}

fn web_port() -> u16 {
    std::env::var("FUNDSCOPE_WEB_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8000)
}

async fn serve(config: IngestConfig) -> Result<()> {
    let ingestor = build_ingestor(&config)?;

    if config.startup_purge {
        startup_cleanup(ingestor.repository()).await?;
    }

    if config.startup_fetch {
        let background = Arc::clone(&ingestor);
        let cooldown = config.cooldown();
        tokio::spawn(async move {
            let report = background.run_all(cooldown).await;
            for outcome in &report.outcomes {
                if !outcome.success {
                    warn!(
                        %outcome.category,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "startup ingestion failed"
                    );
                }
            }
        });
    }

    let scheduler = build_scheduler(Arc::clone(&ingestor), &config).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron_uk = %config.cron_uk, cron_eu = %config.cron_eu, "scheduler started");
    }

    let port = web_port();
    let state = AppState::new(
        ingestor,
        SchedulerSettings::from_config(&config),
        config.cooldown(),
    );
    info!(port, "serving analysis API");
    fundscope_web::serve(state, port).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Ingest { category } => {
            let ingestor = build_ingestor(&config)?;
            match ingestor.ingest(category).await {
                Ok(summary) => println!(
                    "{}: retained {} of {} rows (filtered {})",
                    category.display_name(),
                    summary.retained,
                    summary.total_rows,
                    summary.filtered_out
                ),
                Err(err) => {
                    error!(%category, error = %err, "ingestion failed");
                    anyhow::bail!("ingestion failed for {category}");
                }
            }
        }
        Commands::RunAll => {
            let ingestor = build_ingestor(&config)?;
            let report = ingestor.run_all(config.cooldown()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.outcomes.iter().any(|outcome| !outcome.success) {
                anyhow::bail!("one or more categories failed");
            }
        }
        Commands::Purge => {
            let ingestor = build_ingestor(&config)?;
            startup_cleanup(ingestor.repository()).await?;
            println!("all analysis data purged");
        }
    }

    Ok(())
}
