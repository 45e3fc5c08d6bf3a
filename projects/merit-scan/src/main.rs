mod cli;
mod error;
mod pipeline;
mod processor;
mod run_context;
mod video;
mod web;

use anyhow::Result;
use cli::{Args, Command};
use tracing_subscriber::EnvFilter;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse_args();

    match args.command {
        Command::Serve(serve) => run_server(serve).await?,
        Command::Process(process) => {
            processor::process_video(process).await?;
        }
    }

    Ok(())
}
