use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};

use super::backend_trait::StudyBackend;
use crate::error_handling::types::BackendError;
use crate::session_management::session::{SessionSubmission, SubmitAck};
use crate::storage::participant_filter::by_submitted;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{
    is_valid_participant_id, MediaKind, Participant, ParticipantFilter, PersistedRecording,
    RecordingUpload, StoredRecording,
};

/// A participant with everything stored for them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ParticipantDetail {
    pub participant: Participant,
    pub recordings: Vec<PersistedRecording>,
    pub submission: Option<SessionSubmission>,
}

/// Study server rules on top of a [`Storage`].
///
/// The HTTP routes call the `*_from` variants with the client address; the
/// [`StudyBackend`] implementation is the same logic without one, for
/// in-process use.
#[derive(Clone)]
pub struct StoreBackend {
    storage: Arc<dyn Storage>,
    reject_repeat_ip: bool,
}

impl StoreBackend {
    pub fn new(storage: Arc<dyn Storage>, reject_repeat_ip: bool) -> Self {
        Self {
            storage,
            reject_repeat_ip,
        }
    }

    /// Registers `requested_id` (or a fresh UUID). Registering an id twice
    /// returns the existing participant.
    pub async fn register_from(
        &self,
        requested_id: Option<&str>,
        client_ip: Option<IpAddr>,
    ) -> Result<Participant, BackendError> {
        let id = match requested_id {
            Some(id) if !is_valid_participant_id(id) => {
                return Err(BackendError::Rejected {
                    status: 400,
                    message: format!("invalid participant id '{}'", id),
                })
            }
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        match self.storage.get_participant(&id).await {
            Ok(existing) => return Ok(existing),
            Err(crate::error_handling::types::StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let participant = Participant::new(id, client_ip);
        self.storage.save_participant(&participant).await?;
        info!("[{}] participant registered", participant.id);
        Ok(participant)
    }

    pub async fn upload(&self, upload: &RecordingUpload) -> Result<StoredRecording, BackendError> {
        if upload.payload.is_empty() {
            return Err(BackendError::Rejected {
                status: 400,
                message: "empty recording".into(),
            });
        }
        if upload.task_number == 0 {
            return Err(BackendError::Rejected {
                status: 400,
                message: "task numbers start at 1".into(),
            });
        }

        let record = self.storage.save_recording(upload).await?;
        let stored_path = record
            .path_for(upload.kind)
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("stored recording has no path".into()))?;
        Ok(StoredRecording { stored_path })
    }

    /// Accepts a submission once per participant. With `reject_repeat_ip`,
    /// a submission is also refused when another participant from the same
    /// address already submitted.
    pub async fn submit_from(
        &self,
        submission: &SessionSubmission,
        client_ip: Option<IpAddr>,
    ) -> Result<SubmitAck, BackendError> {
        let participant = self.storage.get_participant(&submission.participant_id).await?;
        if participant.is_submitted() {
            return Err(BackendError::AlreadySubmitted);
        }

        if self.reject_repeat_ip {
            if let Some(ip) = client_ip.or(participant.client_ip) {
                let filter = ParticipantFilter {
                    client_ip: Some(ip),
                    ..by_submitted(true)
                };
                let earlier = self.storage.get_participants(Some(filter)).await?;
                if let Some(other) = earlier.iter().find(|p| p.id != participant.id) {
                    warn!(
                        "[{}] rejected: {} already submitted from {}",
                        participant.id, other.id, ip
                    );
                    return Err(BackendError::AlreadySubmitted);
                }
            }
        }

        self.storage.save_submission(submission).await?;
        info!("[{}] session submitted", participant.id);
        Ok(SubmitAck { success: true })
    }

    pub async fn delete(&self, participant_id: &str) -> Result<usize, BackendError> {
        Ok(self.storage.delete_participant(participant_id).await?)
    }

    pub async fn list(&self, filter: Option<ParticipantFilter>) -> Result<Vec<Participant>, BackendError> {
        Ok(self.storage.get_participants(filter).await?)
    }

    pub async fn detail(&self, participant_id: &str) -> Result<ParticipantDetail, BackendError> {
        let participant = self.storage.get_participant(participant_id).await?;
        let recordings = self.storage.get_recordings(participant_id).await?;
        let submission = self.storage.get_submission(participant_id).await?;
        Ok(ParticipantDetail {
            participant,
            recordings,
            submission,
        })
    }

    pub async fn recording_data(
        &self,
        participant_id: &str,
        task_number: u32,
        kind: MediaKind,
    ) -> Result<Bytes, BackendError> {
        self.storage
            .get_recording_data(participant_id, task_number, kind)
            .await
            .map_err(|e| match e {
                crate::error_handling::types::StorageError::NotFound(what) => BackendError::Rejected {
                    status: 404,
                    message: format!("no recording {}", what),
                },
                other => other.into(),
            })
    }
}

#[async_trait]
impl StudyBackend for StoreBackend {
    async fn register_participant(&self, requested_id: Option<&str>) -> Result<String, BackendError> {
        self.register_from(requested_id, None).await.map(|p| p.id)
    }

    async fn upload_recording(&self, upload: &RecordingUpload) -> Result<StoredRecording, BackendError> {
        self.upload(upload).await
    }

    async fn submit_session(&self, submission: &SessionSubmission) -> Result<SubmitAck, BackendError> {
        self.submit_from(submission, None).await
    }

    async fn delete_participant(&self, participant_id: &str) -> Result<usize, BackendError> {
        self.delete(participant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_storage::FileStorage;
    use chrono::Utc;
    use tempfile::TempDir;

    fn backend(reject_repeat_ip: bool) -> (TempDir, StoreBackend) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        (dir, StoreBackend::new(Arc::new(storage), reject_repeat_ip))
    }

    fn submission(id: &str) -> SessionSubmission {
        SessionSubmission {
            participant_id: id.into(),
            answers: Vec::new(),
            recordings: Vec::new(),
            started_at: Utc::now(),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_keeps_requested_id_and_is_idempotent() {
        let (_dir, backend) = backend(true);
        let first = backend.register_from(Some("p-1"), None).await.unwrap();
        let again = backend.register_from(Some("p-1"), None).await.unwrap();
        assert_eq!(first, again);

        let generated = backend.register_participant(None).await.unwrap();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());

        assert!(matches!(
            backend.register_participant(Some("no/slash")).await,
            Err(BackendError::Rejected { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let (_dir, backend) = backend(true);
        backend.register_participant(Some("p-1")).await.unwrap();
        let upload = RecordingUpload {
            participant_id: "p-1".into(),
            task_number: 1,
            kind: MediaKind::Screen,
            payload: Bytes::new(),
            duration_ms: 0,
        };
        assert!(matches!(
            backend.upload_recording(&upload).await,
            Err(BackendError::Rejected { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn submission_is_rejected_for_unknown_and_repeated_participants() {
        let (_dir, backend) = backend(true);
        assert!(matches!(
            backend.submit_session(&submission("ghost")).await,
            Err(BackendError::UnknownParticipant(_))
        ));

        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        backend.register_from(Some("p-1"), Some(ip)).await.unwrap();
        backend.register_from(Some("p-2"), Some(ip)).await.unwrap();
        backend.submit_from(&submission("p-1"), Some(ip)).await.unwrap();

        assert!(matches!(
            backend.submit_from(&submission("p-1"), Some(ip)).await,
            Err(BackendError::AlreadySubmitted)
        ));
        assert!(matches!(
            backend.submit_from(&submission("p-2"), Some(ip)).await,
            Err(BackendError::AlreadySubmitted)
        ));
    }

    #[tokio::test]
    async fn same_address_is_allowed_when_repeat_check_is_off() {
        let (_dir, backend) = backend(false);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        backend.register_from(Some("p-1"), Some(ip)).await.unwrap();
        backend.register_from(Some("p-2"), Some(ip)).await.unwrap();
        backend.submit_from(&submission("p-1"), Some(ip)).await.unwrap();
        backend.submit_from(&submission("p-2"), Some(ip)).await.unwrap();

        let detail = backend.detail("p-2").await.unwrap();
        assert!(detail.participant.is_submitted());
        assert!(detail.submission.is_some());
    }
}
