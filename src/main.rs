use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetborn::clients::HttpClientFactory;
use fleetborn::config::{EnvCredentials, FileCredentials, FleetConfig};
use fleetborn::reconciler::FleetOrchestrator;
use fleetborn::spec::FleetGroup;
use fleetborn::ssh::{KnownHostsStore, OpenSshKeyScanner, OpenSshRunner, SystemResolver};

#[derive(Parser)]
#[command(
    name = "fleetborn",
    version,
    about = "Declarative fleet lifecycle orchestrator"
)]
struct Cli {
    /// TOML fleet file describing the group
    #[arg(short, long, env = "FLEET_FILE", default_value = "fleet.toml")]
    file: PathBuf,

    /// Base domain of the provider's control planes
    #[arg(long, env = "FLEET_PROVIDER_DOMAIN")]
    provider_domain: String,

    /// Read credentials from this TOML file instead of the environment
    #[arg(long, env = "FLEET_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start missing servers, refresh running ones, reconcile balancers
    Launch {
        /// Servers to touch; all of them when empty
        servers: Vec<String>,
    },
    /// Show the running state of every declared server
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.credentials_file {
        Some(path) => FleetConfig::new(
            &FileCredentials { path: path.clone() },
            &cli.provider_domain,
        )?,
        None => FleetConfig::new(&EnvCredentials::default(), &cli.provider_domain)?,
    };

    let raw = tokio::fs::read_to_string(&cli.file)
        .await
        .with_context(|| format!("could not read fleet file {}", cli.file.display()))?;
    let group = FleetGroup::from_toml(&raw)?;

    let orchestrator = FleetOrchestrator::new(
        group,
        Arc::new(HttpClientFactory::new(config.clone())),
        Arc::new(OpenSshRunner::new(&config.known_hosts_path)),
        Arc::new(OpenSshKeyScanner::new()),
        Arc::new(SystemResolver),
        Arc::new(KnownHostsStore::new(&config.known_hosts_path)),
        config.temp_dir.clone(),
    );

    match cli.command {
        Command::Launch { servers } => {
            let report = tokio::select! {
                result = orchestrator.launch(&servers) => result?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, leaving the fleet as it is");
                    return Ok(());
                }
            };
            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(id) => info!("{}: {} as {id}", outcome.name, outcome.action),
                    Err(e) => error!("{}: failed: {e}", outcome.name),
                }
            }
            for balancer in report.failed_balancers() {
                if let Err(e) = &balancer.result {
                    error!("{}: failed: {e}", balancer.name);
                }
            }
            let failed_servers = report.failed().count();
            if failed_servers > 0 {
                anyhow::bail!("{failed_servers} of {} servers failed", report.outcomes.len());
            }
            if report.failed_balancers().count() > 0 {
                anyhow::bail!("load-balancer reconciliation failed");
            }
        }
        Command::Status => {
            for status in orchestrator.status().await? {
                match &status.live.instance_id {
                    Some(id) => info!(
                        "{} ({}): {id} {} {}",
                        status.name,
                        status.zone,
                        status.live.state,
                        status.live.dns_name.as_deref().unwrap_or("-")
                    ),
                    None => info!("{} ({}): not running", status.name, status.zone),
                }
            }
            for balancer in orchestrator.balancer_status().await? {
                if balancer.members.is_empty() {
                    info!("{}: no balanced instances", balancer.name);
                }
                for member in &balancer.members {
                    info!(
                        "{}: {} {}",
                        balancer.name,
                        member.instance_id,
                        if member.healthy { "healthy" } else { "unhealthy" }
                    );
                }
            }
        }
    }
    Ok(())
}
