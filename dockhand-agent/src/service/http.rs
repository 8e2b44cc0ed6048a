//! reqwest-backed implementation of the command-service contract.
//!
//! The service speaks JSON 1.1 RPC: every operation is a POST to `/` with
//! an `x-amz-target` header naming the operation and a SigV4 signature.

use super::sigv4::{Sigv4Signer, sha256_hex};
use super::{
    CommandService, CommandStatus, Diagnostics, HostCommand, ServiceError, SpecEnvelope,
};
use crate::config::{Config, Credentials};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const TARGET_PREFIX: &str = "CodeDeployCommandService_v20141006";
const RPC_TIMEOUT: Duration = Duration::from_secs(80);
const SERVICE_NAME: &str = "codedeploy-commands";

pub struct HttpCommandService {
    client: reqwest::Client,
    base_url: reqwest::Url,
    signer: Option<Sigv4Signer>,
}

impl HttpCommandService {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(RPC_TIMEOUT);
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: config.service_url().parse()?,
            signer: config.credentials().map(|c| signer_for(&c, &config.region)),
        })
    }

    async fn rpc(&self, operation: &str, body: &Value) -> Result<Value, ServiceError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ServiceError::Protocol(format!("encode {operation}: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/x-amz-json-1.1"),
        );
        headers.insert(
            "x-amz-target",
            HeaderValue::from_str(&format!("{TARGET_PREFIX}.{operation}"))
                .map_err(|e| ServiceError::Protocol(e.to_string()))?,
        );
        if let Some(signer) = &self.signer {
            signer
                .sign(
                    "POST",
                    &self.base_url,
                    &mut headers,
                    &sha256_hex(&payload),
                    Utc::now(),
                )
                .map_err(|e| ServiceError::Protocol(format!("sign {operation}: {e}")))?;
        }

        debug!("calling {operation}");
        let response = self
            .client
            .post(self.base_url.clone())
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(|e| ServiceError::Transient(format!("{operation}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Transient(format!("{operation}: {e}")))?;
        classify_response(status, &body)
    }
}

fn signer_for(credentials: &Credentials, region: &str) -> Sigv4Signer {
    Sigv4Signer {
        access_key_id: credentials.access_key_id.clone(),
        secret_access_key: credentials.secret_access_key.clone(),
        session_token: credentials.session_token.clone(),
        region: region.to_string(),
        service: SERVICE_NAME.to_string(),
    }
}

/// Map a raw HTTP response to a value or a typed service error. Throttling
/// hides both behind a 429 and behind structured error bodies, so both are
/// probed before the permanent/transient split on the status class.
fn classify_response(status: StatusCode, body: &str) -> Result<Value, ServiceError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ServiceError::Throttled);
    }

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(body)
            .map_err(|e| ServiceError::Protocol(format!("invalid response body: {e}")));
    }

    let (error_type, message) = match serde_json::from_str::<Value>(body) {
        Ok(parsed) => (
            parsed
                .get("__type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parsed
                .get("message")
                .or_else(|| parsed.get("Message"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        Err(_) => (String::new(), body.trim().to_string()),
    };

    let haystack = format!("{error_type} {message}").to_lowercase();
    if haystack.contains("throttl") || haystack.contains("rateexceeded") {
        return Err(ServiceError::Throttled);
    }

    if status.is_client_error() {
        Err(ServiceError::Permanent {
            error_type,
            message,
        })
    } else {
        Err(ServiceError::Transient(format!(
            "{status}: {error_type} {message}"
        )))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AckRequest<'a> {
    host_command_identifier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<&'a Diagnostics>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteRequest<'a> {
    host_command_identifier: &'a str,
    command_status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<&'a Diagnostics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusResponse {
    #[serde(default)]
    command_status: Option<CommandStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PollResponse {
    #[serde(default)]
    host_command: Option<HostCommand>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpecResponse {
    #[serde(default)]
    deployment_specification: Option<SpecEnvelope>,
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ServiceError> {
    serde_json::from_value(value)
        .map_err(|e| ServiceError::Protocol(format!("unexpected response shape: {e}")))
}

#[async_trait]
impl CommandService for HttpCommandService {
    async fn poll_host_command(
        &self,
        host_id: &str,
    ) -> Result<Option<HostCommand>, ServiceError> {
        let value = self
            .rpc(
                "PollHostCommand",
                &serde_json::json!({ "HostIdentifier": host_id }),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let response: PollResponse = decode(value)?;
        Ok(response.host_command)
    }

    async fn put_host_command_acknowledgement(
        &self,
        host_command_identifier: &str,
        diagnostics: Option<&Diagnostics>,
    ) -> Result<CommandStatus, ServiceError> {
        let request = AckRequest {
            host_command_identifier,
            diagnostics,
        };
        let value = self
            .rpc(
                "PutHostCommandAcknowledgement",
                &serde_json::to_value(&request).expect("serializable request"),
            )
            .await?;
        let response: StatusResponse = decode(value)?;
        Ok(response.command_status.unwrap_or(CommandStatus::InProgress))
    }

    async fn put_host_command_complete(
        &self,
        host_command_identifier: &str,
        status: CommandStatus,
        diagnostics: Option<&Diagnostics>,
    ) -> Result<(), ServiceError> {
        let request = CompleteRequest {
            host_command_identifier,
            command_status: status,
            diagnostics,
        };
        self.rpc(
            "PutHostCommandComplete",
            &serde_json::to_value(&request).expect("serializable request"),
        )
        .await?;
        Ok(())
    }

    async fn get_deployment_specification(
        &self,
        deployment_execution_id: &str,
        host_id: &str,
    ) -> Result<SpecEnvelope, ServiceError> {
        let value = self
            .rpc(
                "GetDeploymentSpecification",
                &serde_json::json!({
                    "DeploymentExecutionId": deployment_execution_id,
                    "HostIdentifier": host_id,
                }),
            )
            .await?;
        let response: SpecResponse = decode(value)?;
        response
            .deployment_specification
            .ok_or_else(|| ServiceError::Protocol("response carried no specification".to_string()))
    }

    async fn post_host_command_update(
        &self,
        host_command_identifier: &str,
        diagnostics: Option<&Diagnostics>,
    ) -> Result<CommandStatus, ServiceError> {
        let request = AckRequest {
            host_command_identifier,
            diagnostics,
        };
        let value = self
            .rpc(
                "PostHostCommandUpdate",
                &serde_json::to_value(&request).expect("serializable request"),
            )
            .await?;
        let response: StatusResponse = decode(value)?;
        Ok(response.command_status.unwrap_or(CommandStatus::InProgress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_429_is_throttling() {
        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, "").unwrap_err();
        assert!(matches!(err, ServiceError::Throttled));
    }

    #[test]
    fn test_structured_throttling_detected_in_type_and_message() {
        for body in [
            r#"{"__type": "ThrottlingException", "message": "slow down"}"#,
            r#"{"__type": "ClientError", "message": "Rate exceeded"}"#,
        ] {
            let err = classify_response(StatusCode::BAD_REQUEST, body).unwrap_err();
            assert!(matches!(err, ServiceError::Throttled), "{body}");
        }
    }

    #[test]
    fn test_4xx_is_permanent() {
        let err = classify_response(
            StatusCode::BAD_REQUEST,
            r#"{"__type": "InvalidHostException", "message": "no such host"}"#,
        )
        .unwrap_err();
        match err {
            ServiceError::Permanent {
                error_type,
                message,
            } => {
                assert_eq!(error_type, "InvalidHostException");
                assert_eq!(message, "no such host");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_5xx_is_transient() {
        let err =
            classify_response(StatusCode::INTERNAL_SERVER_ERROR, "oops").unwrap_err();
        assert!(matches!(err, ServiceError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_success_with_body_parses() {
        let value =
            classify_response(StatusCode::OK, r#"{"CommandStatus": "Succeeded"}"#).unwrap();
        let response: StatusResponse = decode(value).unwrap();
        assert_eq!(response.command_status, Some(CommandStatus::Succeeded));
    }

    #[test]
    fn test_success_with_empty_body_is_null() {
        assert_eq!(classify_response(StatusCode::OK, "  ").unwrap(), Value::Null);
    }

    #[test]
    fn test_malformed_success_body_is_protocol_error() {
        let err = classify_response(StatusCode::OK, "{not json").unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_poll_response_shape() {
        let value: Value = serde_json::from_str(
            r#"{"HostCommand": {
                "HostCommandIdentifier": "hci-1",
                "DeploymentExecutionId": "exec-1",
                "HostIdentifier": "arn:host/i-1",
                "CommandName": "DownloadBundle"
            }}"#,
        )
        .unwrap();
        let response: PollResponse = decode(value).unwrap();
        let command = response.host_command.unwrap();
        assert_eq!(command.command_name, "DownloadBundle");
        assert_eq!(command.host_command_identifier, "hci-1");
    }
}
