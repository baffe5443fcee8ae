use clap::{Args, Parser, Subcommand};
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod arbitrage;
mod campaign;
mod config;
mod erc20;
mod error;
mod fee_transfer;
mod logging;
mod math;
mod pricers;
mod relay;
mod reservation;
mod retry;
mod sandbox;
mod session;
mod simulation;
mod solver;
mod store;

use campaign::{dedupe_campaigns, CampaignWorker};
use config::RelayConfig;
use logging::setup_logging;
use relay::RelayWorker;
use reservation::{fill_relay_queue, fill_top_queue, requeue_stale, JobControl};
use store::Store;

#[derive(Parser)]
#[command(name = "arb-relay")]
#[command(about = "Replays historical arbitrage candidates inside forked sandboxes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct WorkerArgs {
    /// Worker name, recorded on claimed reservations and in job_control
    #[arg(long, env = "WORKER_NAME")]
    worker: Option<String>,

    /// Port slice for this worker's sandboxes
    #[arg(long, env = "WORKER_SLICE", default_value = "0")]
    slice: u16,
}

impl WorkerArgs {
    fn name(&self, prefix: &str) -> String {
        self.worker
            .clone()
            .unwrap_or_else(|| format!("{prefix}-{}", std::process::id()))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Relay every candidate of each claimed block
    Relay(WorkerArgs),

    /// Track top-arbitrage campaigns over claimed block ranges
    TopArbs(WorkerArgs),

    /// Create the worker tables and fill both queues
    SetupDb,

    /// Add newly searchable blocks and ranges to the queues
    FillQueues,

    /// Return reservations claimed longer than CLAIM_TIMEOUT_MINUTES ago to the queue
    RequeueStale,

    /// Mark overlapping same-route campaigns as removed
    DedupeCampaigns,
}

/// Cancellation token fired on Ctrl-C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping after the current block");
                signalled.cancel();
            }
            Err(e) => error!(error = %e, "Could not listen for interrupts"),
        }
    });
    token
}

async fn run_relay(config: RelayConfig, args: WorkerArgs) -> Result<()> {
    let name = args.name("relay");
    let control = JobControl::new(
        Store::connect(&config).await?,
        &name,
        shutdown_token(),
        config.job_heartbeat,
    );
    let mut worker = RelayWorker::new(config, name, args.slice, control).await?;
    worker.run().await
}

async fn run_top_arbs(config: RelayConfig, args: WorkerArgs) -> Result<()> {
    let name = args.name("top-arbs");
    let control = JobControl::new(
        Store::connect(&config).await?,
        &name,
        shutdown_token(),
        config.job_heartbeat,
    );
    let mut worker = CampaignWorker::new(config, name, args.slice, control).await?;
    worker.run().await
}

async fn run_fill_queues(store: &Store) -> Result<()> {
    let blocks = fill_relay_queue(store).await?;
    let ranges = fill_top_queue(store).await?;
    info!(blocks, ranges, "Filled reservation queues");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = RelayConfig::from_env()?;
    let worker_label = match &cli.command {
        Commands::Relay(args) => args.name("relay"),
        Commands::TopArbs(args) => args.name("top-arbs"),
        _ => "admin".to_string(),
    };
    setup_logging(&config.log_level, config.log_json, &worker_label);
    config.log_config();

    match cli.command {
        Commands::Relay(args) => run_relay(config, args).await,
        Commands::TopArbs(args) => run_top_arbs(config, args).await,
        Commands::SetupDb => {
            let store = Store::connect(&config).await?;
            store.setup_schema().await?;
            info!("Schema ready");
            run_fill_queues(&store).await
        }
        Commands::FillQueues => {
            let store = Store::connect(&config).await?;
            run_fill_queues(&store).await
        }
        Commands::RequeueStale => {
            let store = Store::connect(&config).await?;
            let (blocks, ranges) = requeue_stale(&store, config.claim_timeout).await?;
            info!(blocks, ranges, "Requeued stale reservations");
            Ok(())
        }
        Commands::DedupeCampaigns => {
            let store = Store::connect(&config).await?;
            let removed = dedupe_campaigns(&store).await?;
            info!(removed, "Campaign de-duplication done");
            Ok(())
        }
    }
}
