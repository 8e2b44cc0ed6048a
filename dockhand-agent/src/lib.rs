// === Core modules ===
pub mod agent;
pub mod archive;
pub mod config;
pub mod download;
pub mod executor;
pub mod fsops;
pub mod hooks;
pub mod installer;
pub mod layout;
pub mod local;
pub mod poller;
pub mod service;
pub mod tracker;
pub mod util;

// === CLI entrypoint ===
pub mod cli;

/// Entrypoint used by `main.rs` and tests to run the full CLI.
pub async fn run_cli() -> anyhow::Result<()> {
    cli::cli().await
}
