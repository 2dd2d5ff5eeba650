use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wharf::config::Configuration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Opt {
    /// YAML configuration file. May be given more than once; later files
    /// take precedence.
    #[clap(short, long, value_parser)]
    pub config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup the logger
    tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Parse the parameters passed by arguments.
    let options = Opt::parse();

    let config = Configuration::config(Configuration::figment(options.config))?;

    let mut tasks = wharf::start(config).await?;

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Unable to listen for shutdown signal: {err}");
            }
            info!("Shutting down");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(())) => warn!("Background task exited early"),
                Ok(Err(err)) => error!("Background task failed: {err:?}"),
                Err(err) => error!("Background task panicked: {err}"),
            }
        }
    }

    tasks.shutdown().await;

    Ok(())
}
