use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which half of a task recording a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Screen,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Screen => "screen",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screen" => Ok(MediaKind::Screen),
            "audio" => Ok(MediaKind::Audio),
            other => Err(format!("unknown media kind '{}'", other)),
        }
    }
}

/// One recording payload on its way to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingUpload {
    pub participant_id: String,
    pub task_number: u32,
    pub kind: MediaKind,
    pub payload: Bytes,
    pub duration_ms: u64,
}

/// Store acknowledgement of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecording {
    pub stored_path: String,
}

/// Server-side record of a task recording. At most one per
/// `(participant_id, task_number)`; later uploads overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecording {
    pub participant_id: String,
    pub task_number: u32,
    pub screen_path: Option<String>,
    pub audio_path: Option<String>,
    /// Filled in later by the analysis pipeline, never by an upload.
    pub transcript: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl PersistedRecording {
    pub fn path_for(&self, kind: MediaKind) -> Option<&str> {
        match kind {
            MediaKind::Screen => self.screen_path.as_deref(),
            MediaKind::Audio => self.audio_path.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub client_ip: Option<IpAddr>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(id: String, client_ip: Option<IpAddr>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            client_ip,
            submitted_at: None,
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantFilter {
    pub submitted: Option<bool>,
    pub client_ip: Option<IpAddr>,
    pub created_after: Option<DateTime<Utc>>,
}

impl ParticipantFilter {
    pub fn matches(&self, participant: &Participant) -> bool {
        if let Some(submitted) = self.submitted {
            if participant.is_submitted() != submitted {
                return false;
            }
        }
        if let Some(ip) = self.client_ip {
            if participant.client_ip != Some(ip) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if participant.created_at < after {
                return false;
            }
        }
        true
    }
}

/// Participant ids end up in file names and URLs, so only a conservative
/// alphabet is accepted.
pub fn is_valid_participant_id(id: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(id))
}
