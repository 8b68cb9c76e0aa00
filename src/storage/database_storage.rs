use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use sea_orm::sea_query::OnConflict;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, TransactionTrait,
};

use crate::error_handling::types::StorageError;
use crate::session_management::session::SessionSubmission;
use crate::storage::db_entities::{self as participants, recordings, submissions};
use crate::storage::participant_filter::{parse_timestamp, participant_conditions};
use crate::storage::storage_trait::Storage;
use crate::storage::types::{
    MediaKind, Participant, ParticipantFilter, PersistedRecording, RecordingUpload,
};

const SCHEMA: [&str; 4] = [
    "PRAGMA foreign_keys = ON;",
    "CREATE TABLE IF NOT EXISTS participants (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        client_ip TEXT,
        submitted_at TEXT
    );",
    "CREATE TABLE IF NOT EXISTS recordings (
        participant_id TEXT NOT NULL,
        task_number INTEGER NOT NULL,
        screen_data BLOB,
        audio_data BLOB,
        transcript TEXT,
        duration_ms INTEGER NOT NULL,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY (participant_id, task_number),
        FOREIGN KEY(participant_id) REFERENCES participants(id) ON DELETE CASCADE
    );",
    "CREATE TABLE IF NOT EXISTS submissions (
        participant_id TEXT PRIMARY KEY,
        json TEXT NOT NULL,
        submitted_at TEXT NOT NULL,
        FOREIGN KEY(participant_id) REFERENCES participants(id) ON DELETE CASCADE
    );",
];

/// SQLite storage through SeaORM. Recording payloads live in the
/// `recordings` rows; their `stored_path` is a `db://` locator.
pub struct DatabaseStorage {
    db: DatabaseConnection,
}

impl DatabaseStorage {
    /// Default database filename inside the configured storage directory
    pub const DEFAULT_DB_FILE: &'static str = "usability-capture.sqlite3";

    /// Opens (creating if needed) the default database file inside `dir`.
    pub async fn open_in<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            error!("Failed to create storage dir {}: {}", dir.display(), e);
            StorageError::WriteFailed
        })?;
        Self::connect_file(dir.join(Self::DEFAULT_DB_FILE)).await
    }

    pub async fn connect_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let db = Database::connect(&url).await.map_err(|e| {
            error!("Failed to open {}: {}", url, e);
            StorageError::ConnectionFailed
        })?;
        for statement in SCHEMA {
            db.execute_unprepared(statement).await.map_err(|e| {
                error!("Schema setup failed: {}", e);
                StorageError::WriteFailed
            })?;
        }
        info!("DatabaseStorage opened at {}", path.as_ref().display());
        Ok(Self { db })
    }

    fn stored_path(participant_id: &str, task_number: u32, kind: MediaKind) -> String {
        format!("db://recordings/{}/{}/{}", participant_id, task_number, kind)
    }

    fn into_recording(row: recordings::Model) -> Result<PersistedRecording, StorageError> {
        let task_number = u32::try_from(row.task_number).map_err(|_| StorageError::ReadFailed)?;
        let path = |present: bool, kind| {
            present.then(|| Self::stored_path(&row.participant_id, task_number, kind))
        };
        Ok(PersistedRecording {
            screen_path: path(row.screen_data.is_some(), MediaKind::Screen),
            audio_path: path(row.audio_data.is_some(), MediaKind::Audio),
            participant_id: row.participant_id.clone(),
            task_number,
            transcript: row.transcript,
            duration_ms: row.duration_ms.max(0) as u64,
            recorded_at: parse_timestamp(&row.recorded_at)?,
        })
    }

    fn into_participant(row: participants::Model) -> Result<Participant, StorageError> {
        Ok(Participant {
            id: row.id,
            created_at: parse_timestamp(&row.created_at)?,
            client_ip: match row.client_ip {
                Some(ip) => Some(ip.parse().map_err(|_| StorageError::ReadFailed)?),
                None => None,
            },
            submitted_at: row.submitted_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    async fn find_participant<C: ConnectionTrait>(
        conn: &C,
        participant_id: &str,
    ) -> Result<participants::Model, StorageError> {
        participants::Entity::find_by_id(participant_id.to_string())
            .one(conn)
            .await
            .map_err(|e| {
                error!("Participant lookup failed: {}", e);
                StorageError::ReadFailed
            })?
            .ok_or_else(|| StorageError::NotFound(participant_id.to_string()))
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

#[async_trait]
impl Storage for DatabaseStorage {
    async fn save_participant(&self, participant: &Participant) -> Result<(), StorageError> {
        let row = participants::ActiveModel {
            id: Set(participant.id.clone()),
            created_at: Set(rfc3339(participant.created_at)),
            client_ip: Set(participant.client_ip.map(|ip| ip.to_string())),
            submitted_at: Set(participant.submitted_at.map(rfc3339)),
        };
        participants::Entity::insert(row)
            .on_conflict(
                OnConflict::column(participants::Column::Id)
                    .update_columns([
                        participants::Column::CreatedAt,
                        participants::Column::ClientIp,
                        participants::Column::SubmittedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| {
                error!("Failed to save participant {}: {}", participant.id, e);
                StorageError::WriteFailed
            })?;
        debug!("Saved participant {}", participant.id);
        Ok(())
    }

    async fn get_participant(&self, participant_id: &str) -> Result<Participant, StorageError> {
        Self::into_participant(Self::find_participant(&self.db, participant_id).await?)
    }

    async fn get_participants(
        &self,
        filter: Option<ParticipantFilter>,
    ) -> Result<Vec<Participant>, StorageError> {
        let mut query = participants::Entity::find();
        if let Some(f) = &filter {
            query = query.filter(participant_conditions(f));
        }
        let rows = query
            .order_by_asc(participants::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(|e| {
                error!("Participant query failed: {}", e);
                StorageError::ReadFailed
            })?;
        rows.into_iter().map(Self::into_participant).collect()
    }

    async fn save_recording(&self, upload: &RecordingUpload) -> Result<PersistedRecording, StorageError> {
        Self::find_participant(&self.db, &upload.participant_id).await?;

        let data = Set(Some(upload.payload.to_vec()));
        let (screen_data, audio_data, data_column) = match upload.kind {
            MediaKind::Screen => (data, NotSet, recordings::Column::ScreenData),
            MediaKind::Audio => (NotSet, data, recordings::Column::AudioData),
        };
        let row = recordings::ActiveModel {
            participant_id: Set(upload.participant_id.clone()),
            task_number: Set(upload.task_number as i32),
            screen_data,
            audio_data,
            transcript: NotSet,
            duration_ms: Set(upload.duration_ms as i64),
            recorded_at: Set(rfc3339(Utc::now())),
        };
        recordings::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([recordings::Column::ParticipantId, recordings::Column::TaskNumber])
                    .update_columns([
                        data_column,
                        recordings::Column::DurationMs,
                        recordings::Column::RecordedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| {
                error!(
                    "Failed to store recording {}/{}: {}",
                    upload.participant_id, upload.task_number, e
                );
                StorageError::WriteFailed
            })?;

        let row = recordings::Entity::find_by_id((upload.participant_id.clone(), upload.task_number as i32))
            .one(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?
            .ok_or(StorageError::ReadFailed)?;
        info!(
            "Stored {} recording of task {} for {} ({} bytes)",
            upload.kind,
            upload.task_number,
            upload.participant_id,
            upload.payload.len()
        );
        Self::into_recording(row)
    }

    async fn get_recordings(&self, participant_id: &str) -> Result<Vec<PersistedRecording>, StorageError> {
        let rows = recordings::Entity::find()
            .filter(recordings::Column::ParticipantId.eq(participant_id))
            .order_by_asc(recordings::Column::TaskNumber)
            .all(&self.db)
            .await
            .map_err(|e| {
                error!("Recording query failed: {}", e);
                StorageError::ReadFailed
            })?;
        rows.into_iter().map(Self::into_recording).collect()
    }

    async fn get_recording_data(
        &self,
        participant_id: &str,
        task_number: u32,
        kind: MediaKind,
    ) -> Result<Bytes, StorageError> {
        let missing = || StorageError::NotFound(format!("{}/{}/{}", participant_id, task_number, kind));
        let row = recordings::Entity::find_by_id((participant_id.to_string(), task_number as i32))
            .one(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?
            .ok_or_else(missing)?;
        let data = match kind {
            MediaKind::Screen => row.screen_data,
            MediaKind::Audio => row.audio_data,
        };
        data.map(Bytes::from).ok_or_else(missing)
    }

    async fn save_submission(&self, submission: &SessionSubmission) -> Result<(), StorageError> {
        let json = serde_json::to_string(submission).map_err(|_| StorageError::WriteFailed)?;
        let txn = self.db.begin().await.map_err(|_| StorageError::ConnectionFailed)?;

        let participant = Self::find_participant(&txn, &submission.participant_id).await?;
        if participant.submitted_at.is_some() {
            return Err(StorageError::AlreadySubmitted);
        }

        let submitted_at = rfc3339(submission.submitted_at);
        submissions::Entity::insert(submissions::ActiveModel {
            participant_id: Set(submission.participant_id.clone()),
            json: Set(json),
            submitted_at: Set(submitted_at.clone()),
        })
        .exec_without_returning(&txn)
        .await
        .map_err(|e| {
            error!("Failed to store submission of {}: {}", submission.participant_id, e);
            StorageError::WriteFailed
        })?;
        participants::Entity::update(participants::ActiveModel {
            id: Set(submission.participant_id.clone()),
            submitted_at: Set(Some(submitted_at)),
            ..Default::default()
        })
        .exec(&txn)
        .await
        .map_err(|_| StorageError::WriteFailed)?;

        txn.commit().await.map_err(|_| StorageError::WriteFailed)?;
        info!(
            "Saved submission of {} ({} answer(s))",
            submission.participant_id,
            submission.answers.len()
        );
        Ok(())
    }

    async fn get_submission(&self, participant_id: &str) -> Result<Option<SessionSubmission>, StorageError> {
        let row = submissions::Entity::find_by_id(participant_id.to_string())
            .one(&self.db)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
        row.map(|row| serde_json::from_str(&row.json).map_err(|_| StorageError::ReadFailed))
            .transpose()
    }

    async fn delete_participant(&self, participant_id: &str) -> Result<usize, StorageError> {
        let txn = self.db.begin().await.map_err(|_| StorageError::ConnectionFailed)?;
        Self::find_participant(&txn, participant_id).await?;

        let removed = recordings::Entity::delete_many()
            .filter(recordings::Column::ParticipantId.eq(participant_id))
            .exec(&txn)
            .await
            .map_err(|_| StorageError::WriteFailed)?
            .rows_affected;
        submissions::Entity::delete_by_id(participant_id.to_string())
            .exec(&txn)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        participants::Entity::delete_by_id(participant_id.to_string())
            .exec(&txn)
            .await
            .map_err(|_| StorageError::WriteFailed)?;

        txn.commit().await.map_err(|_| StorageError::WriteFailed)?;
        info!("Deleted participant {} and {} recording(s)", participant_id, removed);
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_management::session::{RecordingStatus, TaskRecording};
    use tempfile::TempDir;

    async fn temp_db(ids: &[&str]) -> (TempDir, DatabaseStorage) {
        let dir = TempDir::new().unwrap();
        let storage = DatabaseStorage::open_in(dir.path()).await.unwrap();
        for id in ids {
            storage
                .save_participant(&Participant::new(id.to_string(), Some("198.51.100.4".parse().unwrap())))
                .await
                .unwrap();
        }
        (dir, storage)
    }

    fn upload(task: u32, kind: MediaKind, data: &'static [u8]) -> RecordingUpload {
        RecordingUpload {
            participant_id: "p1".into(),
            task_number: task,
            kind,
            payload: Bytes::from_static(data),
            duration_ms: 1500,
        }
    }

    #[tokio::test]
    async fn test_db_reupload_keeps_one_row_per_task() {
        let (_dir, storage) = temp_db(&["p1"]).await;
        storage.save_recording(&upload(3, MediaKind::Screen, b"old")).await.unwrap();
        storage.save_recording(&upload(3, MediaKind::Audio, b"mic")).await.unwrap();
        let record = storage.save_recording(&upload(3, MediaKind::Screen, b"new")).await.unwrap();

        assert_eq!(record.screen_path.as_deref(), Some("db://recordings/p1/3/screen"));
        assert_eq!(record.audio_path.as_deref(), Some("db://recordings/p1/3/audio"));
        assert_eq!(storage.get_recordings("p1").await.unwrap().len(), 1);
        assert_eq!(
            storage.get_recording_data("p1", 3, MediaKind::Screen).await.unwrap(),
            Bytes::from_static(b"new")
        );
        assert_eq!(
            storage.get_recording_data("p1", 3, MediaKind::Audio).await.unwrap(),
            Bytes::from_static(b"mic")
        );
    }

    #[tokio::test]
    async fn test_db_submission_and_filter() {
        let (_dir, storage) = temp_db(&["p1", "p2"]).await;
        let submission = SessionSubmission {
            participant_id: "p1".into(),
            answers: Vec::new(),
            recordings: vec![TaskRecording { task_number: 1, status: RecordingStatus::UploadFailed }],
            started_at: Utc::now(),
            submitted_at: Utc::now(),
        };
        storage.save_submission(&submission).await.unwrap();
        assert_eq!(
            storage.save_submission(&submission).await,
            Err(StorageError::AlreadySubmitted)
        );
        assert_eq!(storage.get_submission("p1").await.unwrap(), Some(submission));

        let pending = storage
            .get_participants(Some(ParticipantFilter { submitted: Some(false), ..Default::default() }))
            .await
            .unwrap();
        assert_eq!(pending.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["p2"]);
        assert_eq!(storage.get_participants(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_db_delete_cascades_to_recordings() {
        let (_dir, storage) = temp_db(&["p1"]).await;
        storage.save_recording(&upload(1, MediaKind::Screen, b"a")).await.unwrap();
        storage.save_recording(&upload(2, MediaKind::Screen, b"b")).await.unwrap();

        assert_eq!(storage.delete_participant("p1").await.unwrap(), 2);
        assert!(storage.get_recordings("p1").await.unwrap().is_empty());
        assert_eq!(
            storage.get_participant("p1").await,
            Err(StorageError::NotFound("p1".into()))
        );
        assert_eq!(
            storage.save_recording(&upload(1, MediaKind::Screen, b"a")).await.unwrap_err(),
            StorageError::NotFound("p1".into())
        );
    }
}
