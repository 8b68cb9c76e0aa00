use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
    /// Refuse a submission when another participant from the same client IP
    /// has already submitted.
    #[serde(default = "default_true")]
    pub reject_repeat_ip: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 8080,
            reject_repeat_ip: true,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Database,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: PathBuf::from("./data"),
        }
    }
}

/// Recorder tuning as written in the config file. Converted into a
/// `RecorderConfig` before reaching the recorder.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct RecorderSettings {
    /// `0` turns the data polling loop off.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            probe_delay_ms: default_probe_delay_ms(),
            finalize_timeout_ms: default_finalize_timeout_ms(),
            upload_timeout_secs: default_upload_timeout_secs(),
        }
    }
}

/// One entry of the ordered task list shown to the participant.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub scenario: String,
    pub question: String,
}

fn default_bind_address() -> String {
    String::from("127.0.0.1")
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_probe_delay_ms() -> u64 {
    100
}

fn default_finalize_timeout_ms() -> u64 {
    2000
}

fn default_upload_timeout_secs() -> u64 {
    120
}
