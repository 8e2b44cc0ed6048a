//! Daemon entry point and systemd service management.

use crate::archive::BundleCodec;
use crate::config::Config;
use crate::download::BundleDownloader;
use crate::executor::Executor;
use crate::fsops::DiskFileOps;
use crate::layout::Layout;
use crate::poller::Poller;
use crate::service::http::HttpCommandService;
use crate::tracker::FileTracker;
use crate::util::logging::init_tracing;
use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SERVICE_NAME: &str = "dockhand-agent";
const SERVICE_FILE: &str = "/etc/systemd/system/dockhand-agent.service";

pub async fn install_service(config_path: Option<&Path>) -> Result<()> {
    // materialise the effective configuration so operators have a file to edit
    let config = Config::load(config_path)?;
    config.save(config_path)?;

    let exe_path = std::env::current_exe().context("Unable to resolve binary path")?;
    let config_arg = match config_path {
        Some(p) => format!(" --config {}", p.display()),
        None => String::new(),
    };
    let service_content = format!(
        "[Unit]
Description=Dockhand deployment agent
After=network.target

[Service]
ExecStart={} agent run{config_arg}
Restart=always
RestartSec=3
User=root
Environment=RUST_LOG=info

[Install]
WantedBy=multi-user.target
",
        exe_path.display()
    );

    std::fs::write(SERVICE_FILE, &service_content)
        .context("Failed to write systemd service file")?;

    Command::new("systemctl").args(["daemon-reload"]).status()?;
    Command::new("systemctl")
        .args(["enable", SERVICE_NAME])
        .status()?;
    Command::new("systemctl")
        .args(["start", SERVICE_NAME])
        .status()?;

    info!("Installed and started systemd service at {}", SERVICE_FILE);
    Ok(())
}

pub async fn uninstall_service() -> Result<()> {
    if Path::new(SERVICE_FILE).exists() {
        Command::new("systemctl")
            .args(["stop", SERVICE_NAME])
            .status()
            .ok();
        Command::new("systemctl")
            .args(["disable", SERVICE_NAME])
            .status()
            .ok();
        std::fs::remove_file(SERVICE_FILE).context("Failed to remove service file")?;
        Command::new("systemctl")
            .args(["daemon-reload"])
            .status()
            .ok();
        info!("Uninstalled dockhand agent service");
    } else {
        info!("Service not found, nothing to uninstall");
    }

    Ok(())
}

pub async fn status_service() -> Result<()> {
    let output = Command::new("systemctl")
        .args(["status", SERVICE_NAME])
        .output()
        .context("Failed to query service status")?;

    let msg = match output.stdout.len() == 0 {
        true => String::from_utf8_lossy(&output.stderr),
        false => String::from_utf8_lossy(&output.stdout),
    };
    info!("{}", msg);
    Ok(())
}

/// Run the poll loop until a shutdown signal arrives, then give the
/// in-flight command a bounded window to finish.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    let _writer = init_tracing(
        &config.log_dir.join("dockhand.log"),
        config.log_max_bytes,
        config.log_max_files,
    )?;
    info!("Running agent against {}", config.service_url());

    if config.host_identifier.is_empty() {
        return Err(anyhow!(
            "host_identifier is not configured; set it in {}",
            Config::default_path()?.display()
        ));
    }

    let cancel = CancellationToken::new();
    let poller = build_poller(&config, cancel.clone())?;

    let run = poller.run();
    tokio::pin!(run);
    tokio::select! {
        res = &mut run => res?,
        _ = shutdown_signal() => {
            info!("Received shutdown signal, finishing in-flight work");
            cancel.cancel();
            let grace = Duration::from_secs(config.kill_agent_max_wait_secs);
            match tokio::time::timeout(grace, &mut run).await {
                Ok(res) => res?,
                Err(_) => warn!("in-flight command did not finish within the shutdown window"),
            }
        }
    }

    Ok(())
}

fn build_poller(config: &Config, cancel: CancellationToken) -> Result<Poller> {
    let layout = Layout::new(&config.root_dir);
    let service = Arc::new(HttpCommandService::from_config(config)?);
    let downloader = Arc::new(BundleDownloader::new(
        &config.region,
        config.credentials(),
        config.proxy_url.as_deref(),
    )?);
    let tracker = FileTracker::new(layout.ongoing_dir());
    let executor = Executor::new(
        layout,
        downloader,
        Arc::new(BundleCodec),
        Arc::new(DiskFileOps),
        config.retention(),
    );

    Ok(Poller::new(
        service,
        executor,
        tracker,
        config.host_identifier.clone(),
        Duration::from_secs(config.poll_interval_secs),
        Duration::from_secs(config.error_backoff_secs),
        cancel,
    ))
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
