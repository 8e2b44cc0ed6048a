use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// How a deployment is carried out on the fleet. The agent itself behaves
/// identically for both; the type participates in rollback archive-root
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentType {
    #[serde(rename = "IN_PLACE")]
    InPlace,
    #[serde(rename = "BLUE_GREEN")]
    BlueGreen,
}

impl Default for DeploymentType {
    fn default() -> Self {
        DeploymentType::InPlace
    }
}

/// Policy for destinations that already exist when Install copies a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExistsBehavior {
    #[serde(rename = "DISALLOW")]
    Disallow,
    #[serde(rename = "OVERWRITE")]
    Overwrite,
    #[serde(rename = "RETAIN")]
    Retain,
}

impl Default for FileExistsBehavior {
    fn default() -> Self {
        FileExistsBehavior::Disallow
    }
}

impl FromStrLoose for FileExistsBehavior {
    fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DISALLOW" => Some(FileExistsBehavior::Disallow),
            "OVERWRITE" => Some(FileExistsBehavior::Overwrite),
            "RETAIN" => Some(FileExistsBehavior::Retain),
            _ => None,
        }
    }
}

/// Case-insensitive parsing for wire enums that user YAML also spells.
pub trait FromStrLoose: Sized {
    fn from_str_loose(s: &str) -> Option<Self>;
}

/// Compression/packaging of a revision bundle. Unknown values default to
/// tar so newer service-side types degrade gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    Tar,
    Tgz,
    Zip,
}

impl Default for BundleType {
    fn default() -> Self {
        BundleType::Tar
    }
}

impl<'de> Deserialize<'de> for BundleType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.to_ascii_lowercase().as_str() {
            "tgz" | "tar.gz" | "gzip" => BundleType::Tgz,
            "zip" => BundleType::Zip,
            _ => BundleType::Tar,
        })
    }
}

/// Where a revision bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionSource {
    S3 {
        bucket: String,
        key: String,
        version: Option<String>,
        etag: Option<String>,
        bundle_type: BundleType,
    },
    GitHub {
        account: String,
        repository: String,
        commit_id: String,
        bundle_type: BundleType,
        token: Option<String>,
    },
    LocalFile {
        path: String,
        bundle_type: BundleType,
    },
    LocalDirectory {
        path: String,
    },
}

/// One command's deployment, decoded from the service envelope. Immutable
/// after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub deployment_id: String,
    pub deployment_group_id: String,
    pub deployment_group_name: String,
    pub application_name: String,
    pub creator: String,
    pub deployment_type: DeploymentType,
    pub appspec_filename: Option<String>,
    pub file_exists_behavior: FileExistsBehavior,
    pub all_possible_lifecycle_events: Vec<String>,
    pub revision: RevisionSource,
}

/// Deployments created by the service-side rollback machinery carry this
/// creator tag; for blue/green deployments it flips the hook archive-root
/// mapping.
pub const ROLLBACK_CREATOR: &str = "codeDeployRollback";

impl DeploymentSpec {
    pub fn is_rollback(&self) -> bool {
        self.creator == ROLLBACK_CREATOR && self.deployment_type == DeploymentType::BlueGreen
    }

    /// Decode the JSON payload of a deployment-specification envelope.
    pub fn from_envelope_payload(payload: &str) -> Result<Self, SpecError> {
        let wire: WireSpec =
            serde_json::from_str(payload).map_err(|e| SpecError::Json(e.to_string()))?;
        wire.try_into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("malformed deployment specification: {0}")]
    Json(String),
    #[error("deployment specification missing field {0}")]
    MissingField(&'static str),
    #[error("unsupported revision type {0}")]
    UnsupportedRevision(String),
    #[error("invalid file-exists-behavior {0}")]
    InvalidFileExistsBehavior(String),
}

// Wire shape of GetDeploymentSpecification's payload. Field names follow the
// service's PascalCase convention; optionality is resolved here so the rest
// of the agent only sees the typed spec above.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireSpec {
    deployment_id: Option<String>,
    deployment_group_id: Option<String>,
    deployment_group_name: Option<String>,
    application_name: Option<String>,
    #[serde(default)]
    deployment_creator: Option<String>,
    #[serde(default)]
    deployment_type: Option<DeploymentType>,
    #[serde(default)]
    app_spec_filename: Option<String>,
    #[serde(default)]
    file_exists_behavior: Option<String>,
    #[serde(default)]
    all_possible_lifecycle_events: Option<Vec<String>>,
    revision: Option<WireRevision>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireRevision {
    revision_type: Option<String>,
    #[serde(default)]
    s3_revision: Option<WireS3Revision>,
    #[serde(default)]
    git_hub_revision: Option<WireGitHubRevision>,
    #[serde(default)]
    local_revision: Option<WireLocalRevision>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireS3Revision {
    bucket: String,
    key: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, rename = "ETag")]
    etag: Option<String>,
    #[serde(default)]
    bundle_type: BundleType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireGitHubRevision {
    account: String,
    repository: String,
    commit_id: String,
    #[serde(default)]
    bundle_type: BundleType,
    #[serde(default, rename = "OAuthToken")]
    oauth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireLocalRevision {
    location: String,
    #[serde(default)]
    bundle_type: BundleType,
}

impl TryFrom<WireSpec> for DeploymentSpec {
    type Error = SpecError;

    fn try_from(wire: WireSpec) -> Result<Self, Self::Error> {
        let revision = wire.revision.ok_or(SpecError::MissingField("Revision"))?;
        let revision_type = revision
            .revision_type
            .clone()
            .unwrap_or_else(|| "S3".to_string());

        let revision = match revision_type.as_str() {
            "S3" => {
                let s3 = revision
                    .s3_revision
                    .ok_or(SpecError::MissingField("S3Revision"))?;
                RevisionSource::S3 {
                    bucket: s3.bucket,
                    key: s3.key,
                    version: s3.version,
                    etag: s3.etag,
                    bundle_type: s3.bundle_type,
                }
            }
            "GitHub" => {
                let gh = revision
                    .git_hub_revision
                    .ok_or(SpecError::MissingField("GitHubRevision"))?;
                RevisionSource::GitHub {
                    account: gh.account,
                    repository: gh.repository,
                    commit_id: gh.commit_id,
                    bundle_type: gh.bundle_type,
                    token: gh.oauth_token,
                }
            }
            "LocalFile" => {
                let local = revision
                    .local_revision
                    .ok_or(SpecError::MissingField("LocalRevision"))?;
                RevisionSource::LocalFile {
                    path: local.location,
                    bundle_type: local.bundle_type,
                }
            }
            "LocalDirectory" => {
                let local = revision
                    .local_revision
                    .ok_or(SpecError::MissingField("LocalRevision"))?;
                RevisionSource::LocalDirectory {
                    path: local.location,
                }
            }
            other => return Err(SpecError::UnsupportedRevision(other.to_string())),
        };

        let file_exists_behavior = match wire.file_exists_behavior.as_deref() {
            None | Some("") => FileExistsBehavior::default(),
            Some(s) => FileExistsBehavior::from_str_loose(s)
                .ok_or_else(|| SpecError::InvalidFileExistsBehavior(s.to_string()))?,
        };

        Ok(DeploymentSpec {
            deployment_id: wire
                .deployment_id
                .ok_or(SpecError::MissingField("DeploymentId"))?,
            deployment_group_id: wire
                .deployment_group_id
                .ok_or(SpecError::MissingField("DeploymentGroupId"))?,
            deployment_group_name: wire.deployment_group_name.unwrap_or_default(),
            application_name: wire.application_name.unwrap_or_default(),
            creator: wire.deployment_creator.unwrap_or_else(|| "user".to_string()),
            deployment_type: wire.deployment_type.unwrap_or_default(),
            appspec_filename: wire.app_spec_filename.filter(|s| !s.is_empty()),
            file_exists_behavior,
            all_possible_lifecycle_events: wire.all_possible_lifecycle_events.unwrap_or_default(),
            revision,
        })
    }
}

impl Display for DeploymentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ({})",
            self.deployment_group_id, self.deployment_id, self.application_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_payload() -> &'static str {
        r#"{
            "DeploymentId": "d-1",
            "DeploymentGroupId": "g1",
            "DeploymentGroupName": "prod",
            "ApplicationName": "web",
            "DeploymentCreator": "user",
            "DeploymentType": "IN_PLACE",
            "FileExistsBehavior": "OVERWRITE",
            "AllPossibleLifecycleEvents": ["ApplicationStop", "BeforeInstall"],
            "Revision": {
                "RevisionType": "S3",
                "S3Revision": {
                    "Bucket": "b",
                    "Key": "k",
                    "Version": "v1",
                    "ETag": "e1",
                    "BundleType": "tar"
                }
            }
        }"#
    }

    #[test]
    fn test_parse_s3_spec() {
        let spec = DeploymentSpec::from_envelope_payload(s3_payload()).unwrap();
        assert_eq!(spec.deployment_id, "d-1");
        assert_eq!(spec.deployment_group_id, "g1");
        assert_eq!(spec.file_exists_behavior, FileExistsBehavior::Overwrite);
        assert_eq!(
            spec.revision,
            RevisionSource::S3 {
                bucket: "b".into(),
                key: "k".into(),
                version: Some("v1".into()),
                etag: Some("e1".into()),
                bundle_type: BundleType::Tar,
            }
        );
        assert!(!spec.is_rollback());
    }

    #[test]
    fn test_parse_github_spec() {
        let payload = r#"{
            "DeploymentId": "d-2",
            "DeploymentGroupId": "g1",
            "Revision": {
                "RevisionType": "GitHub",
                "GitHubRevision": {
                    "Account": "octo",
                    "Repository": "app",
                    "CommitId": "abc123",
                    "BundleType": "zip"
                }
            }
        }"#;
        let spec = DeploymentSpec::from_envelope_payload(payload).unwrap();
        match spec.revision {
            RevisionSource::GitHub {
                ref account,
                ref commit_id,
                bundle_type,
                ..
            } => {
                assert_eq!(account, "octo");
                assert_eq!(commit_id, "abc123");
                assert_eq!(bundle_type, BundleType::Zip);
            }
            other => panic!("unexpected revision {other:?}"),
        }
    }

    #[test]
    fn test_unknown_bundle_type_defaults_to_tar() {
        let payload = s3_payload().replace("\"tar\"", "\"squashfs\"");
        let spec = DeploymentSpec::from_envelope_payload(&payload).unwrap();
        match spec.revision {
            RevisionSource::S3 { bundle_type, .. } => assert_eq!(bundle_type, BundleType::Tar),
            other => panic!("unexpected revision {other:?}"),
        }
    }

    #[test]
    fn test_rollback_requires_blue_green() {
        let payload = s3_payload()
            .replace("\"user\"", "\"codeDeployRollback\"")
            .replace("IN_PLACE", "BLUE_GREEN");
        let spec = DeploymentSpec::from_envelope_payload(&payload).unwrap();
        assert!(spec.is_rollback());

        let payload = s3_payload().replace("\"user\"", "\"codeDeployRollback\"");
        let spec = DeploymentSpec::from_envelope_payload(&payload).unwrap();
        assert!(!spec.is_rollback());
    }

    #[test]
    fn test_missing_revision_is_an_error() {
        let err = DeploymentSpec::from_envelope_payload(r#"{"DeploymentId": "d-1"}"#).unwrap_err();
        assert_eq!(err, SpecError::MissingField("Revision"));
    }

    #[test]
    fn test_invalid_file_exists_behavior_rejected() {
        let payload = s3_payload().replace("OVERWRITE", "MAYBE");
        let err = DeploymentSpec::from_envelope_payload(&payload).unwrap_err();
        assert_eq!(err, SpecError::InvalidFileExistsBehavior("MAYBE".into()));
    }
}
