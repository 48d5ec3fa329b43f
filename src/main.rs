// Remote provisioning server for Intel AMT
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::io::stderr;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;
mod config;

use cmd::inspect_pfx::InspectPfxArgs;
use config::{RpsConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(author, version, about = "Remote provisioning server for Intel AMT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept device connections and run provisioning workflows
    Serve,
    /// Print the certificate chain and root fingerprints of a PFX
    InspectPfx(InspectPfxArgs),
    /// Load the configuration and profile catalogue and report problems
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "rps={level},rps_workflow={level},rps_services={level},rps_certs={level},rps_wsman={level},tower=warn,hyper=warn,h2=warn,reqwest=warn,rustls=warn"
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();
    debug!(command = ?cli.command, "Logger initialized");

    match cli.command {
        Commands::InspectPfx(args) => cmd::inspect_pfx::run(args).await,
        Commands::Serve => {
            let config = RpsConfig::load(&cli.config).await?;
            cmd::serve::run(config).await
        }
        Commands::CheckConfig => {
            let config = RpsConfig::load(&cli.config).await?;
            cmd::check_config::run(&config).await
        }
    }
}
