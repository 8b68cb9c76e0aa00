use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use log::{debug, warn};
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::{Filter, Rejection, Reply};

use super::types::{
    ApiError, DeleteResponse, ListQuery, RegisterRequest, RegisterResponse, UploadQuery,
};
use crate::backend::StoreBackend;
use crate::error_handling::types::BackendError;
use crate::session_management::session::SessionSubmission;
use crate::storage::participant_filter::by_submitted;
use crate::storage::types::{MediaKind, RecordingUpload};

/// Largest accepted recording upload.
pub const MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    reply::with_status(
        reply::json(&ApiError {
            error: message.into(),
        }),
        status,
    )
    .into_response()
}

fn backend_error(err: BackendError) -> Response {
    let status = match &err {
        BackendError::UnknownParticipant(_) => StatusCode::NOT_FOUND,
        BackendError::AlreadySubmitted => StatusCode::CONFLICT,
        BackendError::Rejected { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
        }
        BackendError::Transport(_)
        | BackendError::InvalidResponse(_)
        | BackendError::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("request failed: {}", err);
    }
    let message = match err {
        BackendError::Rejected { message, .. } => message,
        other => other.to_string(),
    };
    error_response(status, message)
}

fn with_backend(
    backend: StoreBackend,
) -> impl Filter<Extract = (StoreBackend,), Error = Infallible> + Clone {
    warp::any().map(move || backend.clone())
}

/// Every study server route, with rejections turned into JSON errors.
pub fn api_routes(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    dashboard_route(backend.clone())
        .or(register_route(backend.clone()))
        .unify()
        .or(list_route(backend.clone()))
        .unify()
        .or(detail_route(backend.clone()))
        .unify()
        .or(delete_route(backend.clone()))
        .unify()
        .or(upload_route(backend.clone()))
        .unify()
        .or(download_route(backend.clone()))
        .unify()
        .or(submit_route(backend))
        .unify()
        .recover(handle_rejection)
        .unify()
}

/// GET /
pub fn dashboard_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path::end()
        .and(warp::get())
        .and(with_backend(backend))
        .then(|backend: StoreBackend| async move {
            let participants = match backend.list(None).await {
                Ok(list) => list,
                Err(e) => return backend_error(e),
            };
            let submitted = participants.iter().filter(|p| p.is_submitted()).count();
            let rows: String = participants
                .iter()
                .map(|p| {
                    format!(
                        "<tr><td><a href=\"/api/participants/{id}\">{id}</a></td><td>{}</td><td>{}</td></tr>",
                        p.created_at.to_rfc3339(),
                        p.submitted_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                        id = p.id,
                    )
                })
                .collect();
            let html = format!(
                "<html><head><title>Usability study</title></head><body>\
                 <h1>Usability study</h1><p>{} participant(s), {} submitted</p>\
                 <table><tr><th>Participant</th><th>Registered</th><th>Submitted</th></tr>{}</table>\
                 </body></html>",
                participants.len(),
                submitted,
                rows
            );
            reply::html(html).into_response()
        })
}

/// POST /api/participants
pub fn register_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "participants")
        .and(warp::post())
        .and(warp::body::json::<RegisterRequest>())
        .and(warp::addr::remote())
        .and(with_backend(backend))
        .then(
            |request: RegisterRequest, remote: Option<SocketAddr>, backend: StoreBackend| async move {
                let ip = remote.map(|addr| addr.ip());
                match backend
                    .register_from(request.participant_id.as_deref(), ip)
                    .await
                {
                    Ok(participant) => reply::with_status(
                        reply::json(&RegisterResponse {
                            participant_id: participant.id,
                        }),
                        StatusCode::CREATED,
                    )
                    .into_response(),
                    Err(e) => backend_error(e),
                }
            },
        )
}

/// GET /api/participants?submitted=
pub fn list_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "participants")
        .and(warp::get())
        .and(warp::query::<ListQuery>())
        .and(with_backend(backend))
        .then(|query: ListQuery, backend: StoreBackend| async move {
            let filter = query.submitted.map(by_submitted);
            match backend.list(filter).await {
                Ok(list) => reply::json(&list).into_response(),
                Err(e) => backend_error(e),
            }
        })
}

/// GET /api/participants/:id
pub fn detail_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "participants" / String)
        .and(warp::get())
        .and(with_backend(backend))
        .then(|id: String, backend: StoreBackend| async move {
            match backend.detail(&id).await {
                Ok(detail) => reply::json(&detail).into_response(),
                Err(e) => backend_error(e),
            }
        })
}

/// DELETE /api/participants/:id
pub fn delete_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "participants" / String)
        .and(warp::delete())
        .and(with_backend(backend))
        .then(|id: String, backend: StoreBackend| async move {
            match backend.delete(&id).await {
                Ok(removed_recordings) => {
                    debug!("[{}] deleted with {} recording(s)", id, removed_recordings);
                    reply::json(&DeleteResponse { removed_recordings }).into_response()
                }
                Err(e) => backend_error(e),
            }
        })
}

/// PUT /api/participants/:id/recordings/:task?kind=&duration_ms=
pub fn upload_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "participants" / String / "recordings" / u32)
        .and(warp::put())
        .and(warp::query::<UploadQuery>())
        .and(warp::body::content_length_limit(MAX_UPLOAD_BYTES))
        .and(warp::body::bytes())
        .and(with_backend(backend))
        .then(
            |id: String, task_number: u32, query: UploadQuery, payload: Bytes, backend: StoreBackend| async move {
                let upload = RecordingUpload {
                    participant_id: id,
                    task_number,
                    kind: query.kind,
                    payload,
                    duration_ms: query.duration_ms,
                };
                debug!(
                    "[{}] task {} {} upload, {} bytes",
                    upload.participant_id,
                    upload.task_number,
                    upload.kind,
                    upload.payload.len()
                );
                match backend.upload(&upload).await {
                    Ok(stored) => reply::json(&stored).into_response(),
                    Err(e) => backend_error(e),
                }
            },
        )
}

/// GET /api/participants/:id/recordings/:task/:kind
pub fn download_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "participants" / String / "recordings" / u32 / MediaKind)
        .and(warp::get())
        .and(with_backend(backend))
        .then(
            |id: String, task_number: u32, kind: MediaKind, backend: StoreBackend| async move {
                match backend.recording_data(&id, task_number, kind).await {
                    Ok(data) => reply::with_header(
                        data.to_vec(),
                        "Content-Type",
                        "application/octet-stream",
                    )
                    .into_response(),
                    Err(e) => backend_error(e),
                }
            },
        )
}

/// POST /api/participants/:id/submit
pub fn submit_route(
    backend: StoreBackend,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "participants" / String / "submit")
        .and(warp::post())
        .and(warp::body::json::<SessionSubmission>())
        .and(warp::addr::remote())
        .and(with_backend(backend))
        .then(
            |id: String,
             submission: SessionSubmission,
             remote: Option<SocketAddr>,
             backend: StoreBackend| async move {
                if submission.participant_id != id {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "participant id does not match the submission",
                    );
                }
                match backend.submit_from(&submission, remote.map(|a| a.ip())).await {
                    Ok(ack) => reply::json(&ack).into_response(),
                    Err(e) => backend_error(e),
                }
            },
        )
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if err.is_not_found() {
        return Ok(error_response(StatusCode::NOT_FOUND, "no such route"));
    }
    if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        return Ok(error_response(StatusCode::BAD_REQUEST, e.to_string()));
    }
    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(error_response(StatusCode::BAD_REQUEST, e.to_string()));
    }
    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "recording too large"));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }
    Ok(error_response(StatusCode::BAD_REQUEST, format!("bad request: {:?}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_storage::FileStorage;
    use crate::storage::types::{Participant, StoredRecording};
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> StoreBackend {
        StoreBackend::new(Arc::new(FileStorage::new(dir.path()).unwrap()), true)
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

    fn remote(ip: [u8; 4]) -> SocketAddr {
        (ip, 40000).into()
    }

    #[tokio::test]
    async fn register_upload_download_and_submit() {
        let dir = TempDir::new().unwrap();
        let routes = api_routes(backend(&dir));

        let res = warp::test::request()
            .method("POST")
            .path("/api/participants")
            .json(&RegisterRequest {
                participant_id: Some("p-1".into()),
            })
            .remote_addr(remote([10, 0, 0, 1]))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);

        let res = warp::test::request()
            .method("PUT")
            .path("/api/participants/p-1/recordings/1?kind=screen&duration_ms=900")
            .body("abc")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let stored: StoredRecording = serde_json::from_slice(res.body()).unwrap();
        assert!(stored.stored_path.ends_with("task-1-screen.bin"));

        let res = warp::test::request()
            .path("/api/participants/p-1/recordings/1/screen")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"abc");

        let res = warp::test::request()
            .method("POST")
            .path("/api/participants/p-1/submit")
            .json(&submission("p-1"))
            .remote_addr(remote([10, 0, 0, 1]))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request()
            .method("POST")
            .path("/api/participants/p-1/submit")
            .json(&submission("p-1"))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = warp::test::request()
            .path("/api/participants?submitted=true")
            .reply(&routes)
            .await;
        let listed: Vec<Participant> = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].client_ip, Some("10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn error_statuses() {
        let dir = TempDir::new().unwrap();
        let routes = api_routes(backend(&dir));

        let res = warp::test::request()
            .method("PUT")
            .path("/api/participants/ghost/recordings/1?kind=screen")
            .body("abc")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("POST")
            .path("/api/participants/ghost/submit")
            .json(&submission("ghost"))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("POST")
            .path("/api/participants/p-2/submit")
            .json(&submission("p-1"))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("PUT")
            .path("/api/participants/p-1/recordings/1?kind=video")
            .body("abc")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .path("/api/participants/ghost/recordings/1/audio")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("DELETE")
            .path("/api/participants/ghost")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dashboard_lists_participants() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend.register_from(Some("p-7"), None).await.unwrap();
        let routes = api_routes(backend);

        let res = warp::test::request().path("/").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(body.contains("p-7"));
        assert!(body.contains("1 participant(s), 0 submitted"));
    }
}
