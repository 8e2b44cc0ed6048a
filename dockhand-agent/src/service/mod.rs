//! Contract with the remote command service.

pub mod envelope;
pub mod http;
pub mod sigv4;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One command handed to this host by the service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostCommand {
    pub host_command_identifier: String,
    pub deployment_execution_id: String,
    #[serde(default)]
    pub host_identifier: String,
    pub command_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum CommandStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Bytes of script log kept in a diagnostic payload; the tail survives.
pub const DIAG_LOG_TAIL_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Diagnostics {
    pub format: String,
    pub payload: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiagnosticPayload {
    pub error_code: String,
    pub script_name: String,
    pub message: String,
    pub log: String,
}

impl Diagnostics {
    pub fn from_payload(mut payload: DiagnosticPayload) -> Diagnostics {
        payload.log = tail(&payload.log, DIAG_LOG_TAIL_BYTES).to_string();
        Diagnostics {
            format: "JSON".to_string(),
            payload: serde_json::to_string(&payload).unwrap_or_default(),
        }
    }

    pub fn success(log: &str) -> Diagnostics {
        Self::from_payload(DiagnosticPayload {
            error_code: "Success".to_string(),
            log: log.to_string(),
            ..Default::default()
        })
    }

    pub fn failure(error_code: &str, message: &str, log: &str) -> Diagnostics {
        Self::from_payload(DiagnosticPayload {
            error_code: error_code.to_string(),
            message: message.to_string(),
            log: log.to_string(),
            ..Default::default()
        })
    }
}

/// Last `max` bytes of `s`, respecting char boundaries.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// The deployment specification as returned by the service, possibly
/// wrapped in a signature envelope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpecEnvelope {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service throttled the request")]
    Throttled,
    #[error("transient service error: {0}")]
    Transient(String),
    #[error("service rejected the request: {error_type}: {message}")]
    Permanent { error_type: String, message: String },
    #[error("malformed service response: {0}")]
    Protocol(String),
}

impl ServiceError {
    /// Errors worth a backoff-and-retry rather than a failure report.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Throttled | ServiceError::Transient(_))
    }
}

#[async_trait]
pub trait CommandService: Send + Sync {
    async fn poll_host_command(&self, host_id: &str)
    -> Result<Option<HostCommand>, ServiceError>;

    async fn put_host_command_acknowledgement(
        &self,
        host_command_identifier: &str,
        diagnostics: Option<&Diagnostics>,
    ) -> Result<CommandStatus, ServiceError>;

    async fn put_host_command_complete(
        &self,
        host_command_identifier: &str,
        status: CommandStatus,
        diagnostics: Option<&Diagnostics>,
    ) -> Result<(), ServiceError>;

    async fn get_deployment_specification(
        &self,
        deployment_execution_id: &str,
        host_id: &str,
    ) -> Result<SpecEnvelope, ServiceError>;

    async fn post_host_command_update(
        &self,
        host_command_identifier: &str,
        diagnostics: Option<&Diagnostics>,
    ) -> Result<CommandStatus, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_log_is_tail_truncated() {
        let log = "x".repeat(DIAG_LOG_TAIL_BYTES + 100) + "END";
        let diag = Diagnostics::failure("ScriptFailed", "exit code 1", &log);
        let payload: DiagnosticPayload = serde_json::from_str(&diag.payload).unwrap();
        assert_eq!(payload.log.len(), DIAG_LOG_TAIL_BYTES);
        assert!(payload.log.ends_with("END"));
        assert_eq!(payload.error_code, "ScriptFailed");
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let s = "aß".repeat(10);
        let t = tail(&s, 3);
        assert!(t.len() <= 3);
        assert!(s.ends_with(t));
    }

    #[test]
    fn test_unknown_command_status_deserializes() {
        let status: CommandStatus = serde_json::from_str("\"SomethingNew\"").unwrap();
        assert_eq!(status, CommandStatus::Unknown);
    }
}
