use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

fn default_root_dir() -> PathBuf {
    PathBuf::from("/opt/dockhand/deployment-root")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/dockhand")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_error_backoff_secs() -> u64 {
    30
}

fn default_max_revisions() -> i64 {
    5
}

fn default_kill_agent_max_wait_secs() -> u64 {
    7200
}

fn default_log_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_log_max_files() -> usize {
    5
}

/// Static IAM credentials, either from the config file or the standard
/// AWS_* environment. Instance-profile lookup is intentionally not here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Option<Credentials> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Credentials {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity this host reports to the deployment service.
    pub host_identifier: String,
    /// Command-service endpoint. Derived from the region when unset.
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Deployment archives kept per group; values <= 0 fall back to 5.
    #[serde(default = "default_max_revisions")]
    pub max_revisions: i64,
    #[serde(default = "default_kill_agent_max_wait_secs")]
    pub kill_agent_max_wait_secs: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,
    #[serde(default = "default_log_max_files")]
    pub log_max_files: usize,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_identifier: String::new(),
            service_url: None,
            region: default_region(),
            credentials: None,
            root_dir: default_root_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            max_revisions: default_max_revisions(),
            kill_agent_max_wait_secs: default_kill_agent_max_wait_secs(),
            log_dir: default_log_dir(),
            log_max_bytes: default_log_max_bytes(),
            log_max_files: default_log_max_files(),
            proxy_url: None,
        }
    }
}

impl Config {
    /// Load from an explicit path, or from the default location. A missing
    /// file is not an error; the defaults are used and saved on first run
    /// of the installer, so a bare `dockhand local` works out of the box.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {config_path:?}"))?;
            let config: Config = serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {config_path:?}"))?;
            Ok(config)
        } else {
            warn!("Config file not found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        let config_dir = config_path
            .parent()
            .context("Failed to get config directory")?;
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;

        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file {config_path:?}"))?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        if cfg!(unix) {
            return Ok(PathBuf::from("/etc/dockhand/dockhand.yml"));
        }
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("dockhand").join("dockhand.yml"))
    }

    pub fn service_url(&self) -> String {
        match &self.service_url {
            Some(url) => url.clone(),
            None => format!("https://codedeploy-commands.{}.amazonaws.com", self.region),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone().or_else(Credentials::from_env)
    }

    /// Retention bound for the archive garbage collector.
    pub fn retention(&self) -> usize {
        if self.max_revisions <= 0 {
            default_max_revisions() as usize
        } else {
            self.max_revisions as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval_secs, 15);
        assert_eq!(config.retention(), 5);
        assert_eq!(
            config.service_url(),
            "https://codedeploy-commands.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn test_retention_corrects_non_positive_values() {
        let mut config = Config::default();
        config.max_revisions = 0;
        assert_eq!(config.retention(), 5);
        config.max_revisions = -3;
        assert_eq!(config.retention(), 5);
        config.max_revisions = 2;
        assert_eq!(config.retention(), 2);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("missing.yml"))).unwrap();
        assert_eq!(config.region, "us-east-1");
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dockhand.yml");

        let mut config = Config::default();
        config.host_identifier = "arn:host/i-123".to_string();
        config.max_revisions = 3;
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.host_identifier, "arn:host/i-123");
        assert_eq!(loaded.max_revisions, 3);
    }

    #[test]
    fn test_explicit_service_url_wins() {
        let mut config = Config::default();
        config.service_url = Some("https://commands.example.test".to_string());
        assert_eq!(config.service_url(), "https://commands.example.test");
    }
}
