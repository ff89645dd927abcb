use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use smsgwd::config::{Config, DEFAULT_CONFIG_PATH};
use smsgwd::supervisor::Supervisor;
use smsgwd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "smsgwd")]
#[command(author, version, about = "SMS gateway worker: drains a database queue over SMPP")]
struct Args {
    /// Path to the YAML config file
    #[arg(value_name = "CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&TracingConfig::default())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "iniciando smsgwd"
    );

    let config = Config::load(&args.config)?;

    info!(
        servicios = config.services().len(),
        datasource = %config.datasource.server_name,
        "configuración cargada"
    );

    Supervisor::new(config).run().await?;

    Ok(())
}
