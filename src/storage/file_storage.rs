use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error_handling::types::StorageError;
use crate::session_management::session::SessionSubmission;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{
    is_valid_participant_id, MediaKind, Participant, ParticipantFilter, PersistedRecording,
    RecordingUpload,
};

/// Filesystem-backed storage.
///
/// Layout under the base directory:
/// - `participants/{id}.json`
/// - `recordings/{id}/task-{n}.json` with the payloads next to it as
///   `task-{n}-screen.bin` / `task-{n}-audio.bin`
/// - `submissions/{id}.json`
pub struct FileStorage {
    base_path: PathBuf,
    // serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        for dir in ["participants", "recordings", "submissions"] {
            let path = base_path.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                error!("Failed to create {} dir {}: {}", dir, path.display(), e);
                StorageError::WriteFailed
            })?;
        }
        info!("FileStorage initialized at {}", base_path.display());

        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Construct FileStorage using env var USABILITY_CAPTURE_STORAGE_DIR if set, otherwise current directory.
    pub fn new_default() -> Result<Self, StorageError> {
        if let Ok(dir) = std::env::var("USABILITY_CAPTURE_STORAGE_DIR") {
            info!("Using FileStorage from USABILITY_CAPTURE_STORAGE_DIR: {}", dir);
            return Self::new(PathBuf::from(dir));
        }
        let cwd = std::env::current_dir().map_err(|e| {
            error!("Failed to get current dir: {}", e);
            StorageError::ReadFailed
        })?;
        info!("Using FileStorage at current directory: {}", cwd.display());
        Self::new(cwd)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn participant_file(&self, id: &str) -> PathBuf {
        self.base_path.join("participants").join(format!("{}.json", id))
    }

    fn submission_file(&self, id: &str) -> PathBuf {
        self.base_path.join("submissions").join(format!("{}.json", id))
    }

    fn recordings_dir(&self, id: &str) -> PathBuf {
        self.base_path.join("recordings").join(id)
    }

    fn recording_file(&self, id: &str, task_number: u32) -> PathBuf {
        self.recordings_dir(id).join(format!("task-{}.json", task_number))
    }

    fn payload_name(id: &str, task_number: u32, kind: MediaKind) -> String {
        format!("recordings/{}/task-{}-{}.bin", id, task_number, kind)
    }

    fn checked(id: &str) -> Result<&str, StorageError> {
        if is_valid_participant_id(id) {
            Ok(id)
        } else {
            Err(StorageError::NotFound(id.to_string()))
        }
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!("Read failed {}: {}", path.display(), e);
                return Err(StorageError::ReadFailed);
            }
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            error!("Invalid JSON in {}: {}", path.display(), e);
            StorageError::ReadFailed
        })
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_vec_pretty(value).map_err(|e| {
            error!("Failed to serialize {}: {}", path.display(), e);
            StorageError::WriteFailed
        })?;
        Self::write_bytes(path, &raw).await
    }

    async fn write_bytes(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create dir {}: {}", parent.display(), e);
                StorageError::WriteFailed
            })?;
        }
        fs::write(path, data).await.map_err(|e| {
            error!("Write failed {}: {}", path.display(), e);
            StorageError::WriteFailed
        })
    }

    async fn load_participant(&self, id: &str) -> Result<Participant, StorageError> {
        let id = Self::checked(id)?;
        Self::read_json(&self.participant_file(id))
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn save_participant(&self, participant: &Participant) -> Result<(), StorageError> {
        if !is_valid_participant_id(&participant.id) {
            error!("Refusing to store participant with id {:?}", participant.id);
            return Err(StorageError::WriteFailed);
        }
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.participant_file(&participant.id), participant).await?;
        debug!("Saved participant {}", participant.id);
        Ok(())
    }

    async fn get_participant(&self, participant_id: &str) -> Result<Participant, StorageError> {
        self.load_participant(participant_id).await
    }

    async fn get_participants(
        &self,
        filter: Option<ParticipantFilter>,
    ) -> Result<Vec<Participant>, StorageError> {
        let dir = self.base_path.join("participants");
        let mut entries = fs::read_dir(&dir).await.map_err(|e| {
            error!("Failed to read participants dir {}: {}", dir.display(), e);
            StorageError::ReadFailed
        })?;

        let mut participants = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            error!("Dir entry error: {}", e);
            StorageError::ReadFailed
        })? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(participant) = Self::read_json::<Participant>(&path).await? {
                participants.push(participant);
            }
        }

        let total = participants.len();
        if let Some(f) = filter {
            participants.retain(|p| f.matches(p));
        }
        participants.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!("Loaded {} participant(s), {} after filter", total, participants.len());
        Ok(participants)
    }

    async fn save_recording(&self, upload: &RecordingUpload) -> Result<PersistedRecording, StorageError> {
        let id = Self::checked(&upload.participant_id)?;
        let _guard = self.write_lock.lock().await;
        self.load_participant(id).await?;

        let stored_path = Self::payload_name(id, upload.task_number, upload.kind);
        Self::write_bytes(&self.base_path.join(&stored_path), &upload.payload).await?;

        let record_file = self.recording_file(id, upload.task_number);
        let mut record = Self::read_json::<PersistedRecording>(&record_file)
            .await?
            .unwrap_or_else(|| PersistedRecording {
                participant_id: id.to_string(),
                task_number: upload.task_number,
                screen_path: None,
                audio_path: None,
                transcript: None,
                duration_ms: 0,
                recorded_at: Utc::now(),
            });
        match upload.kind {
            MediaKind::Screen => record.screen_path = Some(stored_path),
            MediaKind::Audio => record.audio_path = Some(stored_path),
        }
        record.duration_ms = upload.duration_ms;
        record.recorded_at = Utc::now();
        Self::write_json(&record_file, &record).await?;

        info!(
            "Stored {} recording of task {} for {} ({} bytes)",
            upload.kind,
            upload.task_number,
            id,
            upload.payload.len()
        );
        Ok(record)
    }

    async fn get_recordings(&self, participant_id: &str) -> Result<Vec<PersistedRecording>, StorageError> {
        let id = Self::checked(participant_id)?;
        let dir = self.recordings_dir(id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                error!("Failed to read recordings dir {}: {}", dir.display(), e);
                return Err(StorageError::ReadFailed);
            }
        };

        let mut recordings = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            error!("Dir entry error: {}", e);
            StorageError::ReadFailed
        })? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(recording) = Self::read_json::<PersistedRecording>(&path).await? {
                recordings.push(recording);
            }
        }
        recordings.sort_by_key(|r| r.task_number);
        Ok(recordings)
    }

    async fn get_recording_data(
        &self,
        participant_id: &str,
        task_number: u32,
        kind: MediaKind,
    ) -> Result<Bytes, StorageError> {
        let id = Self::checked(participant_id)?;
        let missing = || StorageError::NotFound(format!("{}/{}/{}", id, task_number, kind));
        let record = Self::read_json::<PersistedRecording>(&self.recording_file(id, task_number))
            .await?
            .ok_or_else(missing)?;
        let stored_path = record.path_for(kind).ok_or_else(missing)?;
        let path = self.base_path.join(stored_path);
        let data = fs::read(&path).await.map_err(|e| {
            error!("Read failed {}: {}", path.display(), e);
            StorageError::ReadFailed
        })?;
        debug!("Read {} byte(s) from {}", data.len(), path.display());
        Ok(Bytes::from(data))
    }

    async fn save_submission(&self, submission: &SessionSubmission) -> Result<(), StorageError> {
        let id = Self::checked(&submission.participant_id)?;
        let _guard = self.write_lock.lock().await;
        let mut participant = self.load_participant(id).await?;
        if participant.is_submitted() {
            return Err(StorageError::AlreadySubmitted);
        }

        Self::write_json(&self.submission_file(id), submission).await?;
        participant.submitted_at = Some(submission.submitted_at);
        Self::write_json(&self.participant_file(id), &participant).await?;
        info!("Saved submission of {} ({} answer(s))", id, submission.answers.len());
        Ok(())
    }

    async fn get_submission(&self, participant_id: &str) -> Result<Option<SessionSubmission>, StorageError> {
        let id = Self::checked(participant_id)?;
        Self::read_json(&self.submission_file(id)).await
    }

    async fn delete_participant(&self, participant_id: &str) -> Result<usize, StorageError> {
        let id = Self::checked(participant_id)?;
        let _guard = self.write_lock.lock().await;
        self.load_participant(id).await?;

        let removed = self.get_recordings(id).await?.len();
        let dir = self.recordings_dir(id);
        if fs::try_exists(&dir).await.unwrap_or(false) {
            fs::remove_dir_all(&dir).await.map_err(|e| {
                error!("Failed to remove {}: {}", dir.display(), e);
                StorageError::WriteFailed
            })?;
        }
        let _ = fs::remove_file(self.submission_file(id)).await;
        fs::remove_file(self.participant_file(id)).await.map_err(|e| {
            error!("Failed to remove participant {}: {}", id, e);
            StorageError::WriteFailed
        })?;
        info!("Deleted participant {} and {} recording(s)", id, removed);
        Ok(removed)
    }
}
