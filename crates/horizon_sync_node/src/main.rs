//! Horizon Sync Node
//!
//! Hosts an RPC dispatcher with the entity sync protocol installed, or with
//! `--connect` pushes a small demo world to another node and exits.

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;
use std::process;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start sync node: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        tracing::error!("❌ Sync node error: {e:#}");
        process::exit(1);
    }
}
