//! One-shot local deployments: build a synthetic deployment spec from CLI
//! arguments and drive the executor through the requested events without
//! talking to the service.

use crate::archive::BundleCodec;
use crate::config::Config;
use crate::download::BundleDownloader;
use crate::executor::{CMD_DOWNLOAD_BUNDLE, CMD_INSTALL, Executor};
use crate::fsops::DiskFileOps;
use crate::layout::Layout;
use anyhow::{Context, Result, anyhow};
use dockhand_shared::deployment::{
    BundleType, DeploymentSpec, DeploymentType, FileExistsBehavior, FromStrLoose, RevisionSource,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct LocalDeployment {
    pub bundle_location: String,
    pub bundle_type: String,
    pub file_exists_behavior: String,
    pub deployment_group_id: String,
    pub deployment_group_name: String,
    pub application_name: String,
    pub events: Vec<String>,
    pub appspec_filename: Option<String>,
}

pub async fn run(config: Config, args: LocalDeployment) -> Result<()> {
    let deployment_id = format!("d-{}-local", chrono::Utc::now().timestamp_millis());
    let spec = build_spec(&args, &deployment_id)?;
    let events = ordered_events(&args.events);

    let layout = Layout::new(&config.root_dir);
    let downloader = Arc::new(BundleDownloader::new(
        &config.region,
        config.credentials(),
        config.proxy_url.as_deref(),
    )?);
    let executor = Executor::new(
        layout,
        downloader,
        Arc::new(BundleCodec),
        Arc::new(DiskFileOps),
        config.retention(),
    );

    let cancel = CancellationToken::new();
    info!("starting local deployment {deployment_id}");
    for event in &events {
        info!("=== {event} ===");
        let log = executor
            .execute(event, &spec, &cancel)
            .await
            .with_context(|| format!("{event} failed for {deployment_id}"))?;
        if !log.is_empty() {
            println!("{log}");
        }
    }
    info!("local deployment {deployment_id} finished");
    Ok(())
}

fn build_spec(args: &LocalDeployment, deployment_id: &str) -> Result<DeploymentSpec> {
    let bundle_type = parse_bundle_type(&args.bundle_type);
    let revision = if let Some(rest) = args.bundle_location.strip_prefix("s3://") {
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| anyhow!("s3 location must look like s3://bucket/key"))?;
        RevisionSource::S3 {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version: None,
            etag: None,
            bundle_type,
        }
    } else if args.bundle_type.eq_ignore_ascii_case("directory")
        || Path::new(&args.bundle_location).is_dir()
    {
        RevisionSource::LocalDirectory {
            path: args.bundle_location.clone(),
        }
    } else {
        RevisionSource::LocalFile {
            path: args.bundle_location.clone(),
            bundle_type,
        }
    };

    let file_exists_behavior = FileExistsBehavior::from_str_loose(&args.file_exists_behavior)
        .ok_or_else(|| anyhow!("invalid file-exists-behavior {}", args.file_exists_behavior))?;

    Ok(DeploymentSpec {
        deployment_id: deployment_id.to_string(),
        deployment_group_id: args.deployment_group_id.clone(),
        deployment_group_name: args.deployment_group_name.clone(),
        application_name: args.application_name.clone(),
        creator: "user".to_string(),
        deployment_type: DeploymentType::InPlace,
        appspec_filename: args.appspec_filename.clone(),
        file_exists_behavior,
        all_possible_lifecycle_events: args.events.clone(),
        revision,
    })
}

fn parse_bundle_type(raw: &str) -> BundleType {
    match raw.to_ascii_lowercase().as_str() {
        "tgz" | "tar.gz" => BundleType::Tgz,
        "zip" => BundleType::Zip,
        _ => BundleType::Tar,
    }
}

/// The infrastructure commands always run first, in download-install
/// order, and never twice.
fn ordered_events(requested: &[String]) -> Vec<String> {
    let mut events: Vec<String> =
        vec![CMD_DOWNLOAD_BUNDLE.to_string(), CMD_INSTALL.to_string()];
    for event in requested {
        if !events.contains(event) {
            events.push(event.clone());
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_infrastructure_events_forced_to_front() {
        let events = ordered_events(&strings(&[
            "ApplicationStop",
            "Install",
            "ApplicationStart",
            "DownloadBundle",
        ]));
        assert_eq!(
            events,
            strings(&[
                "DownloadBundle",
                "Install",
                "ApplicationStop",
                "ApplicationStart",
            ])
        );
    }

    #[test]
    fn test_empty_request_still_downloads_and_installs() {
        assert_eq!(
            ordered_events(&[]),
            strings(&["DownloadBundle", "Install"])
        );
    }

    fn args(location: &str, bundle_type: &str) -> LocalDeployment {
        LocalDeployment {
            bundle_location: location.to_string(),
            bundle_type: bundle_type.to_string(),
            file_exists_behavior: "OVERWRITE".to_string(),
            deployment_group_id: "g1".to_string(),
            deployment_group_name: "local".to_string(),
            application_name: "web".to_string(),
            events: vec![],
            appspec_filename: None,
        }
    }

    #[test]
    fn test_synthetic_id_shape() {
        let spec = build_spec(&args("/tmp/bundle.tar", "tar"), "d-123-local").unwrap();
        assert!(spec.deployment_id.starts_with("d-"));
        assert!(spec.deployment_id.ends_with("-local"));
    }

    #[test]
    fn test_s3_location_parsed() {
        let spec = build_spec(&args("s3://my-bucket/path/to/bundle.zip", "zip"), "d-1-local")
            .unwrap();
        match spec.revision {
            RevisionSource::S3 {
                ref bucket,
                ref key,
                bundle_type,
                ..
            } => {
                assert_eq!(bucket, "my-bucket");
                assert_eq!(key, "path/to/bundle.zip");
                assert_eq!(bundle_type, BundleType::Zip);
            }
            other => panic!("unexpected revision {other:?}"),
        }
    }

    #[test]
    fn test_directory_location_becomes_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let spec = build_spec(
            &args(&dir.path().display().to_string(), "tar"),
            "d-1-local",
        )
        .unwrap();
        assert!(matches!(spec.revision, RevisionSource::LocalDirectory { .. }));
    }

    #[test]
    fn test_invalid_file_exists_behavior_rejected() {
        let mut a = args("/tmp/bundle.tar", "tar");
        a.file_exists_behavior = "MAYBE".to_string();
        assert!(build_spec(&a, "d-1-local").is_err());
    }
}
