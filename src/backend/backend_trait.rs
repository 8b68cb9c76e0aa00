use async_trait::async_trait;

use crate::error_handling::types::BackendError;
use crate::session_management::session::{SessionSubmission, SubmitAck};
use crate::storage::types::{RecordingUpload, StoredRecording};

#[async_trait]
pub trait StudyBackend: Send + Sync {
    /// Registers a participant and returns the id the server settled on.
    /// A requested id is kept when the server accepts it.
    async fn register_participant(&self, requested_id: Option<&str>) -> Result<String, BackendError>;

    /// Stores one recording. A later upload for the same participant and task
    /// replaces the earlier one.
    async fn upload_recording(&self, upload: &RecordingUpload) -> Result<StoredRecording, BackendError>;

    async fn submit_session(&self, submission: &SessionSubmission) -> Result<SubmitAck, BackendError>;

    /// Deletes a participant with everything stored for them. Returns the
    /// number of recordings removed.
    async fn delete_participant(&self, participant_id: &str) -> Result<usize, BackendError>;
}
