//! Main entry point for the qkme-node binary

use clap::Parser;
use qkme::cli::{run, Cli};
use qkme_common::LoggingTransformer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    LoggingTransformer::init();

    run(Cli::parse()).await?;
    Ok(())
}
