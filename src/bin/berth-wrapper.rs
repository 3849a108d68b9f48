//! Container-side entry point.
//!
//! Runs as the container's main process: reads its configuration from the
//! environment, connects to the broker, and serves the session protocol
//! until stopped.

use anyhow::Result;
use log::error;

use berth::wrapper::{Wrapper, WrapperConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = WrapperConfig::from_env()?;
    let wrapper = Wrapper::connect(config).await?;
    wrapper.run().await
}
