use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use run_orchestrator_service::{
    build_orchestrator_state, config::Config, db::OrchestratorDb, serve,
};

#[derive(Parser)]
#[command(name = "run-orchestrator")]
#[command(about = "Admits, dispatches and recovers funded agent runs")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP callbacks and run the scheduled workers (default).
    Serve,
    /// Provision the orchestrator schema in `DB_URL`.
    Migrate,
    /// Run one queue drain pass and print the summary.
    DrainQueue(DrainQueueArgs),
    /// Run both stale-run sweeps once and print the summary.
    RecoverStaleRuns,
}

#[derive(Args)]
struct DrainQueueArgs {
    /// Defaults to ORCHESTRATOR_RUN_QUEUE_CHECK_LIMIT.
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::from_env().context("load orchestrator config")?;
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate => migrate(config).await,
        Commands::DrainQueue(args) => drain_queue(config, args).await,
        Commands::RecoverStaleRuns => recover_stale_runs(config).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn migrate(config: Config) -> Result<()> {
    let Some(db_url) = config.db_url.as_deref() else {
        bail!("DB_URL (or DATABASE_URL) is required to run migrations");
    };
    let db = OrchestratorDb::connect(db_url).await?;
    db.apply_migrations().await
}

async fn drain_queue(config: Config, args: DrainQueueArgs) -> Result<()> {
    let state = build_orchestrator_state(config).await?;
    let limit = args
        .limit
        .unwrap_or(state.service().policy().run_queue_check_limit);
    let summary = state
        .service()
        .process_run_queue_batch(limit)
        .await
        .context("process run queue")?;
    print_json(&summary)
}

async fn recover_stale_runs(config: Config) -> Result<()> {
    let state = build_orchestrator_state(config).await?;
    let summary = state
        .service()
        .recover_stale_runs(Utc::now())
        .await
        .context("recover stale runs")?;
    print_json(&summary)
}

#[allow(clippy::print_stdout)]
fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
