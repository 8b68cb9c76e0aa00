//! Storage Trait
//!
//! This module defines the `Storage` trait implemented by the study server's
//! persistence backends.
//!
//! Implementors are responsible for:
//! - Persisting and retrieving participants
//! - Keeping at most one recording record per `(participant, task)`, later
//!   uploads overwriting earlier ones
//! - Persisting the final submission of a participant exactly once
//! - Removing a participant together with everything stored for them

use async_trait::async_trait;
use bytes::Bytes;

use crate::error_handling::types::StorageError;
use crate::session_management::session::SessionSubmission;
use crate::storage::types::{
    MediaKind, Participant, ParticipantFilter, PersistedRecording, RecordingUpload,
};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Inserts or replaces a participant record.
    async fn save_participant(&self, participant: &Participant) -> Result<(), StorageError>;

    /// Fails with [`StorageError::NotFound`] for unknown ids.
    async fn get_participant(&self, participant_id: &str) -> Result<Participant, StorageError>;

    async fn get_participants(
        &self,
        filter: Option<ParticipantFilter>,
    ) -> Result<Vec<Participant>, StorageError>;

    /// Stores the payload and upserts the `(participant, task)` record. Only
    /// the column of the uploaded kind is replaced.
    async fn save_recording(&self, upload: &RecordingUpload) -> Result<PersistedRecording, StorageError>;

    /// Recordings of a participant ordered by task number.
    async fn get_recordings(&self, participant_id: &str) -> Result<Vec<PersistedRecording>, StorageError>;

    async fn get_recording_data(
        &self,
        participant_id: &str,
        task_number: u32,
        kind: MediaKind,
    ) -> Result<Bytes, StorageError>;

    /// Persists the submission and marks the participant submitted. Fails
    /// with [`StorageError::AlreadySubmitted`] on a second call.
    async fn save_submission(&self, submission: &SessionSubmission) -> Result<(), StorageError>;

    async fn get_submission(&self, participant_id: &str) -> Result<Option<SessionSubmission>, StorageError>;

    /// Removes the participant, their recordings and submission. Returns the
    /// number of recording records removed.
    async fn delete_participant(&self, participant_id: &str) -> Result<usize, StorageError>;
}
