//! The outer command loop: poll, acknowledge, execute, complete.
//!
//! Exactly one command is in flight per process. Before execution an
//! in-flight marker is written so a crash leaves evidence; at startup every
//! leftover marker is completed as Failed so the service stops waiting on
//! work that died with the previous process.

use crate::executor::Executor;
use crate::service::envelope::extract_payload;
use crate::service::{CommandService, CommandStatus, Diagnostics, HostCommand};
use crate::tracker::FileTracker;
use anyhow::Result;
use dockhand_shared::deployment::DeploymentSpec;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Poller {
    service: Arc<dyn CommandService>,
    executor: Executor,
    tracker: FileTracker,
    host_identifier: String,
    poll_interval: Duration,
    error_backoff: Duration,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        service: Arc<dyn CommandService>,
        executor: Executor,
        tracker: FileTracker,
        host_identifier: String,
        poll_interval: Duration,
        error_backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service,
            executor,
            tracker,
            host_identifier,
            poll_interval,
            error_backoff,
            cancel,
        }
    }

    /// Run until cancelled. A single command failure never exits the loop.
    pub async fn run(&self) -> Result<()> {
        self.recover().await;

        loop {
            if self.cancel.is_cancelled() {
                info!("poller stopping");
                return Ok(());
            }

            let polled = tokio::select! {
                polled = self.service.poll_host_command(&self.host_identifier) => polled,
                _ = self.cancel.cancelled() => continue,
            };

            match polled {
                Ok(Some(command)) => {
                    info!(
                        "received command {} ({})",
                        command.command_name, command.host_command_identifier
                    );
                    self.handle(command).await;
                }
                Ok(None) => self.sleep(self.poll_interval).await,
                Err(e) if e.is_retryable() => {
                    warn!("poll backed off: {e}");
                    self.sleep(self.error_backoff).await;
                }
                Err(e) => {
                    error!("poll failed: {e}");
                    self.sleep(self.error_backoff).await;
                }
            }
        }
    }

    /// Fail every command a previous process left in flight. The service
    /// would otherwise wait out its own timeout before rescheduling.
    async fn recover(&self) {
        let ongoing = match self.tracker.list() {
            Ok(list) => list,
            Err(e) => {
                warn!("could not read in-flight markers: {e:#}");
                return;
            }
        };
        for deployment in ongoing {
            warn!(
                "failing command {} for deployment {} left over from a previous run",
                deployment.host_command_identifier, deployment.deployment_id
            );
            if !deployment.host_command_identifier.is_empty() {
                let diagnostics = Diagnostics::failure(
                    "AgentRestarted",
                    "the agent restarted while this command was in flight",
                    "",
                );
                if let Err(e) = self
                    .service
                    .put_host_command_complete(
                        &deployment.host_command_identifier,
                        CommandStatus::Failed,
                        Some(&diagnostics),
                    )
                    .await
                {
                    warn!("crash-recovery completion failed: {e}");
                }
            }
            self.tracker.clear(&deployment.deployment_id);
        }
    }

    async fn handle(&self, command: HostCommand) {
        let hci = &command.host_command_identifier;

        let spec = match self.fetch_spec(&command).await {
            Ok(spec) => spec,
            Err(reason) => {
                error!("rejecting {}: {reason}", command.command_name);
                let diagnostics = Diagnostics::failure("InvalidSpecification", &reason, "");
                let _ = self
                    .service
                    .put_host_command_acknowledgement(hci, None)
                    .await;
                if let Err(e) = self
                    .service
                    .put_host_command_complete(hci, CommandStatus::Failed, Some(&diagnostics))
                    .await
                {
                    warn!("completion failed: {e}");
                }
                return;
            }
        };

        if self.executor.is_noop(&command.command_name, &spec) {
            info!("{} is a no-op for {spec}", command.command_name);
            let _ = self
                .service
                .put_host_command_acknowledgement(hci, None)
                .await;
            if let Err(e) = self
                .service
                .put_host_command_complete(hci, CommandStatus::Succeeded, None)
                .await
            {
                warn!("completion failed: {e}");
            }
            return;
        }

        if let Err(e) = self.tracker.mark(&spec.deployment_id, hci) {
            warn!("could not write in-flight marker: {e:#}");
        }

        match self.service.put_host_command_acknowledgement(hci, None).await {
            Ok(CommandStatus::Failed) => {
                // cancelled upstream before we started
                info!("command {hci} was cancelled by the service");
                self.tracker.clear(&spec.deployment_id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("acknowledgement failed: {e}");
            }
        }

        let (status, diagnostics) = match self
            .executor
            .execute(&command.command_name, &spec, &self.cancel)
            .await
        {
            Ok(log) => {
                info!("{} succeeded for {spec}", command.command_name);
                let diagnostics = if log.is_empty() {
                    None
                } else {
                    Some(Diagnostics::success(&log))
                };
                (CommandStatus::Succeeded, diagnostics)
            }
            Err(e) => {
                error!("{} failed for {spec}: {e}", command.command_name);
                let log = match &e {
                    crate::executor::ExecError::HookFailed { log, .. } => log.clone(),
                    _ => String::new(),
                };
                (
                    CommandStatus::Failed,
                    Some(Diagnostics::failure(e.error_code(), &e.to_string(), &log)),
                )
            }
        };

        if let Err(e) = self
            .service
            .put_host_command_complete(hci, status, diagnostics.as_ref())
            .await
        {
            warn!("completion failed: {e}");
        }
        self.tracker.clear(&spec.deployment_id);
    }

    async fn fetch_spec(&self, command: &HostCommand) -> Result<DeploymentSpec, String> {
        let envelope = self
            .service
            .get_deployment_specification(&command.deployment_execution_id, &self.host_identifier)
            .await
            .map_err(|e| format!("could not fetch deployment specification: {e}"))?;
        let payload = extract_payload(&envelope).map_err(|e| e.to_string())?;
        DeploymentSpec::from_envelope_payload(&payload).map_err(|e| e.to_string())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}
