use clap::Parser;
use netdivert::config::{Config, ConfigError, ConfigLoadError, FilterPolicy};
use netdivert::diverter::nfq::{run_nfq, NfqArgs, NfqModeError};
use netdivert::diverter::{Diverter, DiverterInitError};
use netdivert::os::{check_privileged, LinuxDelegate, LocalIps};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{info, Level};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Verbosity of the logger
    #[clap(short, long, default_value_t = Level::INFO)]
    verbosity: Level,
    /// Path to the config file
    #[clap(short, long)]
    config_path: PathBuf,
    /// Interception arguments
    #[clap(flatten)]
    nfq: NfqArgs,
}

#[tokio::main]
async fn main() -> Result<(), NetdivertError> {
    // Parse CLI arguments
    let args = Args::parse();
    // Build our log filter
    let env_filter = EnvFilter::new(format!("{}={}", clap::crate_name!(), args.verbosity));
    // Build and install the log subscriber
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Queue interception requires superuser privileges
    if !check_privileged() {
        return Err(NetdivertError::NotPrivileged);
    }

    // Load and compile the configuration; conflicts are fatal here
    let config = Config::load(&args.config_path)?;
    let policy = FilterPolicy::compile(&config)?;
    info!(
        "Diverting in {} mode",
        if policy.single_host_mode {
            "SingleHost"
        } else {
            "MultiHost"
        }
    );

    // Assemble the diverter around the Linux delegate
    let local_ips = LocalIps::from_interfaces().map_err(NetdivertError::Interfaces)?;
    let delegate = Arc::new(LinuxDelegate::new());
    let diverter = Arc::new(Diverter::new(policy, local_ips, delegate)?);

    // Intercept until interrupted
    run_nfq(diverter, args.nfq).await?;
    Ok(())
}

#[derive(Debug, Error)]
enum NetdivertError {
    #[error("Failed to set global logger: {0}")]
    SetGlobalLogger(#[from] SetGlobalDefaultError),
    #[error("Packet interception requires root privileges")]
    NotPrivileged,
    #[error("Failed to load config: {0}")]
    ConfigLoad(#[from] ConfigLoadError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to enumerate local interfaces: {0}")]
    Interfaces(io::Error),
    #[error("Failed to initialize diverter: {0}")]
    DiverterInit(#[from] DiverterInitError),
    #[error("Error intercepting traffic: {0}")]
    Nfq(#[from] NfqModeError),
}
