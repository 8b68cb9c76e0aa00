use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::backend_trait::StudyBackend;
use crate::error_handling::types::BackendError;
use crate::session_management::session::{SessionSubmission, SubmitAck};
use crate::storage::types::{RecordingUpload, StoredRecording};
use crate::web_interface::types::{DeleteResponse, RegisterRequest, RegisterResponse};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Study server reached over HTTP.
///
/// Request timeouts are left to the caller; the upload queue bounds each
/// upload on its own.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport(err: reqwest::Error) -> BackendError {
    BackendError::Transport(err.to_string())
}

/// Maps non-2xx statuses and decodes the JSON body of the rest.
async fn read_json<T: DeserializeOwned>(response: Response, participant_id: &str) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(match status {
            StatusCode::NOT_FOUND => BackendError::UnknownParticipant(participant_id.to_string()),
            StatusCode::CONFLICT => BackendError::AlreadySubmitted,
            other => BackendError::Rejected {
                status: other.as_u16(),
                message,
            },
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl StudyBackend for HttpBackend {
    async fn register_participant(&self, requested_id: Option<&str>) -> Result<String, BackendError> {
        let body = RegisterRequest {
            participant_id: requested_id.map(str::to_string),
        };
        let response = self
            .client
            .post(self.url("/api/participants"))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let registered: RegisterResponse = read_json(response, requested_id.unwrap_or("")).await?;
        debug!("registered participant {}", registered.participant_id);
        Ok(registered.participant_id)
    }

    async fn upload_recording(&self, upload: &RecordingUpload) -> Result<StoredRecording, BackendError> {
        let path = format!(
            "/api/participants/{}/recordings/{}",
            upload.participant_id, upload.task_number
        );
        let response = self
            .client
            .put(self.url(&path))
            .query(&[
                ("kind", upload.kind.as_str().to_string()),
                ("duration_ms", upload.duration_ms.to_string()),
            ])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(upload.payload.clone())
            .send()
            .await
            .map_err(transport)?;
        read_json(response, &upload.participant_id).await
    }

    async fn submit_session(&self, submission: &SessionSubmission) -> Result<SubmitAck, BackendError> {
        let path = format!("/api/participants/{}/submit", submission.participant_id);
        let response = self
            .client
            .post(self.url(&path))
            .json(submission)
            .send()
            .await
            .map_err(transport)?;
        read_json(response, &submission.participant_id).await
    }

    async fn delete_participant(&self, participant_id: &str) -> Result<usize, BackendError> {
        let path = format!("/api/participants/{}", participant_id);
        let response = self
            .client
            .delete(self.url(&path))
            .send()
            .await
            .map_err(transport)?;
        let deleted: DeleteResponse = read_json(response, participant_id).await?;
        Ok(deleted.removed_recordings)
    }
}
