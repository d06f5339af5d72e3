//! Runtime configuration loaded from `config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, Error, IoResultExt, Result};
use crate::executor::{PrivilegeEscalation, RetryPolicy};

/// Directory name under the per-user config dir.
pub const APP_DIR: &str = "luks-tray";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between reconciliation passes.
    pub poll_interval_secs: u64,
    /// Extra attempts for commands that fail with "busy".
    pub busy_retries: u32,
    pub busy_delay_ms: u64,
    /// Defaults to `<config dir>/vitals.json`.
    pub vitals_path: Option<PathBuf>,
    /// Defaults to `<config dir>/secrets.json`.
    pub secrets_path: Option<PathBuf>,
    pub mounts_path: PathBuf,
    pub sys_root: PathBuf,
    /// Filesystem creator used for new file containers.
    pub mkfs_program: String,
    pub escalation: PrivilegeEscalation,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            busy_retries: 3,
            busy_delay_ms: 500,
            vitals_path: None,
            secrets_path: None,
            mounts_path: PathBuf::from(crate::mounts::MOUNTS_PATH),
            sys_root: PathBuf::from("/sys"),
            mkfs_program: "mkfs.ext4".to_string(),
            escalation: PrivilegeEscalation::None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).config_read_context(path)?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).context(ConfigParseSnafu {
            path: path.to_path_buf(),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.busy_retries, Duration::from_millis(self.busy_delay_ms))
    }

    pub fn vitals_path(&self) -> Result<PathBuf> {
        match &self.vitals_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("vitals.json")),
        }
    }

    pub fn secrets_path(&self) -> Result<PathBuf> {
        match &self.secrets_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("secrets.json")),
        }
    }
}

/// Per-user configuration directory, e.g. `~/.config/luks-tray`.
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or(Error::ConfigDirNotFound)?;
    Ok(base.join(APP_DIR))
}

/// Default config file location.
pub fn default_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// UID and GID of the user the tool acts for.
///
/// Under sudo this is the caller (`SUDO_UID`/`SUDO_GID`), otherwise the
/// process's real ids.
pub fn invoking_ids() -> (u32, u32) {
    let from_env = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u32>().ok());
    let uid = from_env("SUDO_UID").unwrap_or_else(|| nix::unistd::getuid().as_raw());
    let gid = from_env("SUDO_GID").unwrap_or_else(|| nix::unistd::getgid().as_raw());
    (uid, gid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_file_overrides_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
busy_retries = 5
escalation = "pkexec"
vitals_path = "/tmp/v.json"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.busy_retries, 5);
        assert_eq!(config.escalation, PrivilegeEscalation::Pkexec);
        assert_eq!(config.vitals_path().unwrap(), PathBuf::from("/tmp/v.json"));
        assert_eq!(config.mkfs_program, "mkfs.ext4");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "busy_retries = \"many\"").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }
}
