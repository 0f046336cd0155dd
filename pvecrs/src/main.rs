use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use pvecrs_core::consul::{ConsulCoordinator, Coordinator};
use pvecrs_core::driver::Driver;
use pvecrs_core::proxmox::{PveClient, PveConfig};
use pvecrs_core::{ControllerConfig, CrsError, CrsResult, Reconciler};

#[derive(Parser)]
#[command(name = "pvecrs")]
#[command(about = "Proxmox VE cluster resource scheduler", long_about = None)]
struct Cli {
    /// Consul HTTP address used for service discovery and leader election
    #[arg(
        long,
        env = "CONSUL_HTTP_ADDR",
        default_value = "http://127.0.0.1:8500"
    )]
    consul_addr: String,

    /// Verify the Proxmox API TLS certificates
    #[arg(long)]
    verify_tls: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic controller (default)
    Run,
    /// Run a single reconciliation tick and exit
    Tick,
}

#[tokio::main]
async fn main() -> CrsResult<()> {
    init_logging()?;

    let cli = Cli::parse();

    let coordinator = Arc::new(ConsulCoordinator::new(&cli.consul_addr)?);

    let endpoints = coordinator.pve_endpoints().await?;
    let api_token = coordinator.pve_auth_token().await?;
    info!("discovered {} Proxmox API endpoints", endpoints.len());

    let client = PveClient::new(PveConfig {
        endpoints,
        api_token,
        insecure_tls: !cli.verify_tls,
        timeout: Duration::from_secs(30),
    })?;

    let config = ControllerConfig::default();
    let reconciler = Arc::new(Reconciler::new(Arc::new(client), config.clone()));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let driver = Driver::new(reconciler, coordinator, config);
            driver.run().await
        }
        Commands::Tick => reconciler.run_tick().await,
    }
}

/// Level comes from `LOG_LEVEL` (debug/info/warn/error, default info);
/// `RUST_LOG` wins when set for finer-grained directives.
fn init_logging() -> CrsResult<()> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("pvecrs={level},pvecrs_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| CrsError::Config(format!("failed to initialize logging: {e}")))
}
