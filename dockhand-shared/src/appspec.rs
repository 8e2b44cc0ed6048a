use crate::deployment::{FileExistsBehavior, FromStrLoose};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The only descriptor version the agent understands.
pub const SUPPORTED_VERSION: &str = "0.0";

/// Per-script default and per-event ceiling for hook timeouts, in seconds.
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 3600;
pub const MAX_EVENT_TIMEOUT_SECS: u64 = 3600;

/// Filenames probed when the deployment does not name a custom descriptor.
/// Either default falls back to the other; custom names never fall back.
pub const DEFAULT_APPSPEC_FILENAMES: [&str; 2] = ["appspec.yml", "appspec.yaml"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppSpecError {
    #[error("invalid appspec yaml: {0}")]
    Yaml(String),
    #[error("unsupported appspec version {0}, expected {SUPPORTED_VERSION}")]
    UnsupportedVersion(String),
    #[error("appspec os {descriptor} does not match host os {host}")]
    OsMismatch { descriptor: String, host: String },
    #[error("file mapping is missing {0}")]
    IncompleteFileMapping(&'static str),
    #[error("hook {event} has a script with an empty location")]
    EmptyScriptLocation { event: String },
    #[error("hook {event} script {location} has a non-positive timeout")]
    NonPositiveTimeout { event: String, location: String },
    #[error("hook {event} scripts exceed the cumulative timeout of {MAX_EVENT_TIMEOUT_SECS} seconds")]
    EventTimeoutExceeded { event: String },
    #[error("runas is not supported on windows")]
    RunasOnWindows,
    #[error("permissions are not supported on windows")]
    PermissionsOnWindows,
    #[error("invalid file_exists_behavior {0}")]
    InvalidFileExistsBehavior(String),
    #[error("invalid mode {mode}: {reason}")]
    InvalidMode { mode: String, reason: &'static str },
    #[error("permission on file {object} may not carry a pattern or except list")]
    FilePermissionWithPattern { object: String },
    #[error("permission on file {object} may not carry default acl entries")]
    DefaultAclOnFile { object: String },
    #[error("appspec {0} not found in bundle")]
    NotFound(String),
}

/// Operating system the descriptor targets; must match the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Linux,
    Windows,
}

impl TargetOs {
    pub fn host() -> TargetOs {
        if cfg!(windows) {
            TargetOs::Windows
        } else {
            TargetOs::Linux
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetOs::Linux => "linux",
            TargetOs::Windows => "windows",
        }
    }
}

/// One source→destination mapping from the `files` section. `source` is
/// relative to the bundle root; `destination` is absolute on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
}

/// One script bound to a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookScript {
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub runas: Option<String>,
    #[serde(default)]
    pub sudo: bool,
}

impl HookScript {
    pub fn timeout_secs(&self) -> u64 {
        match self.timeout {
            Some(t) if t > 0 => t as u64,
            _ => DEFAULT_SCRIPT_TIMEOUT_SECS,
        }
    }
}

/// Filesystem object kinds a permission entry may apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    File,
    Directory,
}

/// SELinux context attached by a permission entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeContext {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(rename = "type")]
    pub context_type: String,
    #[serde(default)]
    pub range: Option<String>,
}

/// An octal file mode of 3–4 digits, kept verbatim so leading zeros
/// survive the YAML round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mode(pub String);

impl Mode {
    pub fn bits(&self) -> u32 {
        // validated at parse time, cannot fail afterwards
        u32::from_str_radix(&self.0, 8).unwrap_or(0)
    }

    fn validate(&self) -> Result<(), AppSpecError> {
        if self.0.is_empty() || self.0.len() > 4 {
            return Err(AppSpecError::InvalidMode {
                mode: self.0.clone(),
                reason: "expected 3-4 octal digits",
            });
        }
        if !self.0.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return Err(AppSpecError::InvalidMode {
                mode: self.0.clone(),
                reason: "non-octal digit",
            });
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // users write `mode: 644` as often as `mode: "0644"`
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Mode(n.to_string()),
            Raw::Str(s) => Mode(s),
        })
    }
}

fn default_pattern() -> String {
    "**".to_string()
}

fn default_types() -> Vec<TargetType> {
    vec![TargetType::File, TargetType::Directory]
}

/// One entry of the `permissions` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub object: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub except: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub acls: Vec<String>,
    #[serde(default)]
    pub context: Option<SeContext>,
    #[serde(default = "default_types", rename = "type")]
    pub types: Vec<TargetType>,
}

impl Permission {
    pub fn applies_to(&self, t: TargetType) -> bool {
        self.types.contains(&t)
    }

    pub fn has_custom_pattern(&self) -> bool {
        self.pattern != default_pattern()
    }

    /// Default ACL entries only make sense on directories.
    pub fn has_default_acl_entries(&self) -> bool {
        self.acls
            .iter()
            .map(|e| e.trim())
            .any(|e| e.starts_with("d:") || e.starts_with("default:"))
    }

    /// Restrictions that apply when the object names a single file rather
    /// than a directory of targets. Checked at use time by the installer.
    pub fn validate_as_file(&self) -> Result<(), AppSpecError> {
        if self.has_custom_pattern() || !self.except.is_empty() {
            return Err(AppSpecError::FilePermissionWithPattern {
                object: self.object.clone(),
            });
        }
        if self.has_default_acl_entries() {
            return Err(AppSpecError::DefaultAclOnFile {
                object: self.object.clone(),
            });
        }
        Ok(())
    }
}

/// The user-authored deployment descriptor found inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    #[serde(deserialize_with = "version_from_yaml")]
    pub version: String,
    pub os: TargetOs,
    #[serde(default)]
    pub files: Vec<FileMapping>,
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<HookScript>>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default, deserialize_with = "feb_from_yaml")]
    pub file_exists_behavior: Option<FileExistsBehavior>,
}

// `version: 0.0` is a YAML float; accept both spellings.
fn version_from_yaml<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => format!("{n:.1}"),
        Raw::Str(s) => s,
    })
}

fn feb_from_yaml<'de, D>(deserializer: D) -> Result<Option<FileExistsBehavior>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => FileExistsBehavior::from_str_loose(s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid file_exists_behavior {s}"))),
    }
}

impl AppSpec {
    /// Parse and validate a descriptor against the host platform.
    pub fn parse(bytes: &[u8]) -> Result<AppSpec, AppSpecError> {
        Self::parse_for(bytes, TargetOs::host())
    }

    /// Platform-parameterised variant so validation is testable on any host.
    pub fn parse_for(bytes: &[u8], host: TargetOs) -> Result<AppSpec, AppSpecError> {
        let spec: AppSpec =
            serde_yaml::from_slice(bytes).map_err(|e| AppSpecError::Yaml(e.to_string()))?;
        spec.validate(host)?;
        Ok(spec)
    }

    fn validate(&self, host: TargetOs) -> Result<(), AppSpecError> {
        if self.version != SUPPORTED_VERSION {
            return Err(AppSpecError::UnsupportedVersion(self.version.clone()));
        }
        if self.os != host {
            return Err(AppSpecError::OsMismatch {
                descriptor: self.os.as_str().to_string(),
                host: host.as_str().to_string(),
            });
        }

        for mapping in &self.files {
            if mapping.source.is_empty() {
                return Err(AppSpecError::IncompleteFileMapping("source"));
            }
            if mapping.destination.is_empty() {
                return Err(AppSpecError::IncompleteFileMapping("destination"));
            }
        }

        for (event, scripts) in &self.hooks {
            let mut total: u64 = 0;
            for script in scripts {
                if script.location.is_empty() {
                    return Err(AppSpecError::EmptyScriptLocation {
                        event: event.clone(),
                    });
                }
                if matches!(script.timeout, Some(t) if t <= 0) {
                    return Err(AppSpecError::NonPositiveTimeout {
                        event: event.clone(),
                        location: script.location.clone(),
                    });
                }
                if script.runas.is_some() && self.os == TargetOs::Windows {
                    return Err(AppSpecError::RunasOnWindows);
                }
                total = total.saturating_add(script.timeout_secs());
            }
            if total > MAX_EVENT_TIMEOUT_SECS {
                return Err(AppSpecError::EventTimeoutExceeded {
                    event: event.clone(),
                });
            }
        }

        if !self.permissions.is_empty() && self.os == TargetOs::Windows {
            return Err(AppSpecError::PermissionsOnWindows);
        }
        for permission in &self.permissions {
            if let Some(mode) = &permission.mode {
                mode.validate()?;
            }
        }

        Ok(())
    }

    pub fn scripts_for(&self, event: &str) -> &[HookScript] {
        self.hooks.get(event).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Locate the descriptor file inside an unpacked archive.
pub fn find(archive_dir: &Path, requested: Option<&str>) -> Result<PathBuf, AppSpecError> {
    let requested = requested.unwrap_or(DEFAULT_APPSPEC_FILENAMES[0]);

    let primary = archive_dir.join(requested);
    if primary.is_file() {
        return Ok(primary);
    }

    if DEFAULT_APPSPEC_FILENAMES.contains(&requested) {
        for name in DEFAULT_APPSPEC_FILENAMES {
            let candidate = archive_dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(AppSpecError::NotFound(requested.to_string()))
}
