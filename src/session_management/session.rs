use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data_capture::recorder::RecorderHandle;
use crate::data_capture::types::RecorderState;
use crate::error_handling::types::RecorderFault;

/// Free-text answer to one task, captured when the participant moves on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAnswer {
    pub task_id: String,
    pub task_number: u32,
    pub answer: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// What became of a task's recording by the time the session was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Uploaded,
    UploadFailed,
    EmptyCapture,
    CaptureRevoked,
    NotRecorded,
}

impl RecordingStatus {
    /// Maps a settled recorder state. Anything not terminal is reported as
    /// never recorded.
    pub fn from_state(state: &RecorderState) -> Self {
        match state {
            RecorderState::Done => RecordingStatus::Uploaded,
            RecorderState::UploadFailed(_) => RecordingStatus::UploadFailed,
            RecorderState::Error(RecorderFault::EmptyCapture) => RecordingStatus::EmptyCapture,
            RecorderState::Error(RecorderFault::CaptureRevoked) => RecordingStatus::CaptureRevoked,
            _ => RecordingStatus::NotRecorded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecording {
    pub task_number: u32,
    pub status: RecordingStatus,
}

/// Final payload sent once per participant session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSubmission {
    pub participant_id: String,
    pub answers: Vec<TaskAnswer>,
    pub recordings: Vec<TaskRecording>,
    pub started_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub success: bool,
}

/// Output of a finished task sequence, handed to the submitter.
#[derive(Debug)]
pub struct CompletedSession {
    /// Id the recordings were uploaded under.
    pub participant_id: String,
    pub answers: Vec<TaskAnswer>,
    pub recorders: Vec<RecorderHandle>,
    pub started_at: DateTime<Utc>,
    pub task_count: u32,
}
