// certshard - Certificate Transparency ingestion into sharded storage

use anyhow::Result;
use certshard::{config::CTConfig, error::IngestError, supervisor, Args};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Missing or invalid configuration.
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = match CTConfig::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    match supervisor::run(args, config).await {
        Ok(()) => Ok(()),
        Err(e @ IngestError::ConfigError { .. }) => {
            eprintln!("{}", e);
            std::process::exit(EXIT_CONFIG);
        }
        Err(e) => Err(e.into()),
    }
}
