//! Participant session management.
//!
//! This module sequences the tasks of a participant session, tracks the
//! uploads their recordings produce and submits the session once every
//! upload has settled.

use serde::{Deserialize, Serialize};

/// Submission data types shared with the backend.
pub mod session;
/// Final submission behind the upload barrier.
pub mod session_submitter;
/// Task sequencing and per-task recorder ownership.
pub mod task_orchestrator;
/// In-flight upload set with a drain barrier.
pub mod upload_queue;

pub use session_submitter::SessionSubmitter;
pub use task_orchestrator::{Advance, TaskOrchestrator};
pub use upload_queue::UploadQueue;

/// Represents where a participant session is in its lifecycle.
///
/// Variants:
/// - `InProgress`: tasks are still being worked on.
/// - `AwaitingUploads`: submission started and waits on the upload barrier.
/// - `Submitted`: the backend acknowledged the submission. Terminal.
/// - `SubmitFailed`: the last attempt failed; answers are kept for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    AwaitingUploads,
    Submitted,
    SubmitFailed,
}
