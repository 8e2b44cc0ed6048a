//! Remote bundle sources: S3 GetObject and the GitHub archive endpoint.
//!
//! Both sources stream onto disk and retry on the fixed 10/30/90 schedule.
//! Local file and directory revisions never reach this module; the executor
//! materialises those itself.

use crate::config::Credentials;
use crate::service::sigv4::{Sigv4Signer, UNSIGNED_PAYLOAD, uri_encode};
use crate::util::retry::{DOWNLOAD_RETRY_SCHEDULE, with_schedule};
use async_trait::async_trait;
use chrono::Utc;
use dockhand_shared::deployment::{BundleType, RevisionSource};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("bundle not found: {0}")]
    NotFound(String),
    #[error("bundle etag mismatch: expected {expected}, got {actual}")]
    EtagMismatch { expected: String, actual: String },
    #[error("download failed: {0}")]
    Http(String),
    #[error("download cancelled")]
    Cancelled,
    #[error("io error while saving bundle: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch a remote revision into `bundle_path`.
    async fn fetch(
        &self,
        revision: &RevisionSource,
        bundle_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>;
}

pub struct BundleDownloader {
    client: reqwest::Client,
    region: String,
    credentials: Option<Credentials>,
}

impl BundleDownloader {
    pub fn new(region: &str, credentials: Option<Credentials>, proxy_url: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT);
        if let Some(proxy) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            region: region.to_string(),
            credentials,
        })
    }

    async fn fetch_s3(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        etag: Option<&str>,
        bundle_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut url: Url = format!(
            "https://{bucket}.s3.{}.amazonaws.com/{}",
            self.region,
            uri_encode(key, false)
        )
        .parse()
        .map_err(|e| DownloadError::Http(format!("bad s3 url: {e}")))?;
        if let Some(version) = version {
            url.query_pairs_mut().append_pair("versionId", version);
        }

        let mut headers = HeaderMap::new();
        if let Some(credentials) = &self.credentials {
            headers.insert(
                "x-amz-content-sha256",
                HeaderValue::from_static(UNSIGNED_PAYLOAD),
            );
            let signer = Sigv4Signer {
                access_key_id: credentials.access_key_id.clone(),
                secret_access_key: credentials.secret_access_key.clone(),
                session_token: credentials.session_token.clone(),
                region: self.region.clone(),
                service: "s3".to_string(),
            };
            signer
                .sign("GET", &url, &mut headers, UNSIGNED_PAYLOAD, Utc::now())
                .map_err(DownloadError::Other)?;
        }

        let response = self
            .client
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| DownloadError::Http(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound(format!("s3://{bucket}/{key}")));
        }
        if !response.status().is_success() {
            return Err(DownloadError::Http(format!(
                "s3 returned {} for {url}",
                response.status()
            )));
        }

        if let Some(expected) = etag.filter(|e| !e.is_empty()) {
            let actual = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if !etags_match(expected, &actual) {
                return Err(DownloadError::EtagMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        save_body(response, bundle_path, cancel).await
    }

    async fn fetch_github(
        &self,
        account: &str,
        repository: &str,
        commit_id: &str,
        bundle_type: BundleType,
        token: Option<&str>,
        bundle_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let archive = archive_endpoint(bundle_type);
        let url = format!("https://api.github.com/repos/{account}/{repository}/{archive}/{commit_id}");

        let mut request = self
            .client
            .get(&url)
            .header("user-agent", concat!("dockhand/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            request = request.header("authorization", format!("token {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::Http(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound(format!(
                "{account}/{repository}@{commit_id}"
            )));
        }
        if !response.status().is_success() {
            return Err(DownloadError::Http(format!(
                "github returned {} for {url}",
                response.status()
            )));
        }

        save_body(response, bundle_path, cancel).await
    }
}

/// Tarball for tar-family bundles, zipball for zip.
fn archive_endpoint(bundle_type: BundleType) -> &'static str {
    match bundle_type {
        BundleType::Zip => "zipball",
        BundleType::Tar | BundleType::Tgz => "tarball",
    }
}

/// S3 returns the etag wrapped in quotes; comparisons ignore them.
fn etags_match(expected: &str, actual: &str) -> bool {
    expected.trim_matches('"') == actual.trim_matches('"')
}

async fn save_body(
    response: reqwest::Response,
    bundle_path: &Path,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let mut file = tokio::fs::File::create(bundle_path).await?;
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };
        match chunk {
            Some(Ok(bytes)) => file.write_all(&bytes).await?,
            Some(Err(e)) => return Err(DownloadError::Http(e.to_string())),
            None => break,
        }
    }
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl Downloader for BundleDownloader {
    async fn fetch(
        &self,
        revision: &RevisionSource,
        bundle_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        match revision {
            RevisionSource::S3 {
                bucket,
                key,
                version,
                etag,
                ..
            } => {
                info!("downloading bundle from s3://{bucket}/{key}");
                with_schedule(&DOWNLOAD_RETRY_SCHEDULE, cancel, "s3 download", || {
                    self.fetch_s3(
                        bucket,
                        key,
                        version.as_deref(),
                        etag.as_deref(),
                        bundle_path,
                        cancel,
                    )
                })
                .await
            }
            RevisionSource::GitHub {
                account,
                repository,
                commit_id,
                bundle_type,
                token,
            } => {
                info!("downloading bundle from github {account}/{repository}@{commit_id}");
                with_schedule(&DOWNLOAD_RETRY_SCHEDULE, cancel, "github download", || {
                    self.fetch_github(
                        account,
                        repository,
                        commit_id,
                        *bundle_type,
                        token.as_deref(),
                        bundle_path,
                        cancel,
                    )
                })
                .await
            }
            RevisionSource::LocalFile { .. } | RevisionSource::LocalDirectory { .. } => Err(
                DownloadError::Other(anyhow::anyhow!("local revisions are not downloaded")),
            ),
        }
    }
}
