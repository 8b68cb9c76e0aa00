use super::types::*;
use crate::error_handling::types::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Application configuration structure that defines all runtime parameters.
///
/// This structure holds the complete configuration for the application: where the HTTP
/// backend listens, which storage backend persists participants and recordings, how the
/// recorder polls and finalizes captures, and the ordered list of tasks a participant works
/// through. It is read from a TOML file with the `toml` and `serde` derive support.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use usability_capture::configuration::config::Config;
///
/// let config = Config::from_file(Path::new("study.toml")).unwrap();
/// println!("Binding to: {}:{}", config.server.bind_address, config.server.port);
/// println!("{} task(s)", config.tasks.len());
/// ```
///
/// # Fields Overview
///
/// The configuration contains the following attributes:
/// - `server`: bind address, port and the repeat-IP submission policy
/// - `storage`: backend kind (`file` or `database`) and its location
/// - `recorder`: polling interval, start probe delay, finalize watchdog and upload timeout
/// - `tasks`: the task descriptors, in the order they are presented
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// HTTP backend settings
    ///
    /// # Note
    /// Only read by the `serve` command; the participant runner talks to an existing server
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage settings
    ///
    /// The path is a directory for the `file` backend. For the `database` backend it is
    /// either a SQLite file (any path with an extension) or a directory to create the
    /// default database file in
    #[serde(default)]
    pub storage: StorageConfig,

    /// Recorder tuning
    ///
    /// Every field has a default, so the whole table may be omitted
    #[serde(default)]
    pub recorder: RecorderSettings,

    /// Ordered task list
    ///
    /// Written as `[[tasks]]` tables. Task numbers are assigned from this order starting at 1
    pub tasks: Vec<TaskDescriptor>,
}

impl Config {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    /// - [`ConfigError::IoError`] when the file cannot be read
    /// - [`ConfigError::TomlError`] when the content is not valid TOML for this structure
    /// - any error from [`Config::validate`]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parses and validates configuration text.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::TasksEmpty(
                "at least one [[tasks]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(ConfigError::DuplicateTask(task.id.clone()));
            }
        }

        // IANA reserved ports are refused
        if self.server.port < 1024 {
            return Err(ConfigError::BadPortsRange(format!(
                "port {} is below 1024",
                self.server.port
            )));
        }

        if self.recorder.finalize_timeout_ms == 0 {
            return Err(ConfigError::NotInRange(
                "recorder.finalize_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.recorder.upload_timeout_secs == 0 {
            return Err(ConfigError::NotInRange(
                "recorder.upload_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
