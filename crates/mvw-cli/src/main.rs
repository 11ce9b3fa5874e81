use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mvw_pipeline::PipelineConfig;
use mvw_storage::PgWarehouse;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mvw-cli")]
#[command(about = "Market volatility warehouse pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once against the configured warehouse.
    Run,
    /// Apply the warehouse schema (create-if-absent).
    Migrate,
    /// Run the cron scheduler in the foreground until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvw=info,mvw_pipeline=info,mvw_graph=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let run = mvw_pipeline::run_once_from_env().await?;
            println!(
                "run {} finished: {:?} ({} step outcomes)",
                run.run_id,
                run.status,
                run.outcomes.len()
            );
            if !run.succeeded() {
                anyhow::bail!(
                    "pipeline run failed: {}",
                    run.first_error().unwrap_or("upstream step skipped")
                );
            }
        }
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let warehouse = PgWarehouse::connect(&config.database_url)
                .await
                .context("connecting to warehouse")?;
            mvw_storage::migrate(&warehouse)
                .await
                .context("applying schema")?;
            println!("schema applied");
        }
        Commands::Schedule => {
            let mut config = PipelineConfig::from_env();
            config.scheduler_enabled = true;
            let mut sched = mvw_pipeline::maybe_build_scheduler(config)
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            println!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
