//! Unified error types for the luks-tray-core library.
//!
//! The same `std::io::Error` can come from spawning a command, writing the
//! vitals store or reading the config; SNAFU context keeps those apart.
//!
//! Failures of the individual steps of a mount or unmount action are not
//! represented here: those are collected as lines in an
//! [`ActionReport`](crate::orchestrator::ActionReport).

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The device listing report could not be understood.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// Failed to write a persisted document.
    #[snafu(display("failed to write {}", path.display()))]
    StoreWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to encode a persisted document.
    #[snafu(display("failed to encode {}", path.display()))]
    StoreEncode {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Config file exists but cannot be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`Config`](crate::config::Config).
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Per-user config directory could not be determined.
    #[snafu(display("could not determine config directory"))]
    ConfigDirNotFound,

    /// Referenced container identifier is not known.
    #[snafu(display("container w UUID={uuid} not found"))]
    ContainerNotFound { uuid: String },

    /// An action for this container is already queued or running.
    #[snafu(display("an action for container {uuid} is already in progress"))]
    ActionInFlight { uuid: String },

    /// The background worker has stopped.
    #[snafu(display("background worker is not running"))]
    WorkerGone,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for store write errors.
    fn store_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn store_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(StoreWriteSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}
