use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use super::session::{CompletedSession, RecordingStatus, SessionSubmission, SubmitAck, TaskRecording};
use super::upload_queue::{JobLabel, UploadQueue};
use super::SessionStatus;
use crate::backend::StudyBackend;
use crate::data_capture::types::RecorderState;
use crate::error_handling::types::{BackendError, SubmitError};

/// Finalizes a participant session exactly once.
///
/// The final submission is sent only after every recording of the session
/// has been handed to the upload queue and the queue has drained. A failed
/// attempt leaves the session untouched so the caller can retry with the same
/// [`CompletedSession`].
pub struct SessionSubmitter {
    queue: UploadQueue,
    backend: Arc<dyn StudyBackend>,
    identity: Mutex<Option<String>>,
    status: Mutex<SessionStatus>,
}

impl SessionSubmitter {
    /// `participant_id` is the identifier registered for this session, if
    /// any survived until submission.
    pub fn new(queue: UploadQueue, backend: Arc<dyn StudyBackend>, participant_id: Option<String>) -> Self {
        Self {
            queue,
            backend,
            identity: Mutex::new(participant_id),
            status: Mutex::new(SessionStatus::InProgress),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    /// Identifier the session is submitted under; changes when the backend
    /// no longer knows the original one.
    pub fn participant_id(&self) -> Option<String> {
        lock(&self.identity).clone()
    }

    /// Sends the session once every task is answered and every upload has
    /// settled. Overlapping calls are refused with [`SubmitError::InProgress`].
    pub async fn submit(&self, session: &CompletedSession) -> Result<SubmitAck, SubmitError> {
        ensure_complete(session)?;
        {
            let mut status = lock(&self.status);
            match *status {
                SessionStatus::Submitted => return Err(SubmitError::AlreadySubmitted),
                SessionStatus::AwaitingUploads => return Err(SubmitError::InProgress),
                SessionStatus::InProgress | SessionStatus::SubmitFailed => {}
            }
            *status = SessionStatus::AwaitingUploads;
        }
        let _attempt = AttemptGuard(&self.status);

        // a recorder still stopping has not enqueued its job yet
        for handle in &session.recorders {
            handle.wait_handed_off().await;
        }
        let drained = self.queue.drain().await;
        info!(
            "Upload barrier passed ({} upload(s) awaited), submitting {} answer(s)",
            drained,
            session.answers.len()
        );

        let result = self.send(session).await;
        let mut status = lock(&self.status);
        match &result {
            // the backend already holds this session
            Ok(_) | Err(SubmitError::AlreadySubmitted) => *status = SessionStatus::Submitted,
            Err(_) if *status != SessionStatus::Submitted => *status = SessionStatus::SubmitFailed,
            Err(_) => {}
        }
        result
    }

    async fn send(&self, session: &CompletedSession) -> Result<SubmitAck, SubmitError> {
        let participant_id = match self.participant_id() {
            Some(id) => id,
            None => {
                warn!("No participant id at submit time, registering a fallback one");
                self.register_fallback().await?
            }
        };

        match self.backend.submit_session(&self.build(session, &participant_id)).await {
            Ok(ack) => Ok(ack),
            Err(BackendError::UnknownParticipant(id)) => {
                warn!("[{}] unknown to the backend, retrying under a fallback id", id);
                let fallback = self.register_fallback().await?;
                self.backend
                    .submit_session(&self.build(session, &fallback))
                    .await
                    .map_err(map_submit_error)
            }
            Err(e) => Err(map_submit_error(e)),
        }
    }

    async fn register_fallback(&self) -> Result<String, SubmitError> {
        let requested = Uuid::new_v4().to_string();
        let id = self
            .backend
            .register_participant(Some(&requested))
            .await
            .map_err(SubmitError::RegistrationFailed)?;
        info!("[{}] fallback participant registered", id);
        *lock(&self.identity) = Some(id.clone());
        Ok(id)
    }

    fn build(&self, session: &CompletedSession, participant_id: &str) -> SessionSubmission {
        SessionSubmission {
            participant_id: participant_id.to_string(),
            answers: session.answers.clone(),
            recordings: self.recording_statuses(session),
            started_at: session.started_at,
            submitted_at: Utc::now(),
        }
    }

    /// Status of the latest recording of each task. Upload outcomes come from
    /// the queue ledger, which may be ahead of the recorder's own state.
    fn recording_statuses(&self, session: &CompletedSession) -> Vec<TaskRecording> {
        (1..=session.task_count)
            .map(|task_number| {
                let latest = session
                    .recorders
                    .iter()
                    .rev()
                    .find(|handle| handle.task_number() == task_number);
                let status = match latest.map(|handle| handle.state()) {
                    None => RecordingStatus::NotRecorded,
                    Some(state @ (RecorderState::Uploading | RecorderState::Done | RecorderState::UploadFailed(_))) => {
                        let label = JobLabel::new(session.participant_id.clone(), task_number);
                        let ledger = self.queue.latest_outcome(&label);
                        match ledger {
                            Some(Ok(_)) => RecordingStatus::Uploaded,
                            Some(Err(_)) => RecordingStatus::UploadFailed,
                            None => RecordingStatus::from_state(&state),
                        }
                    }
                    Some(state) => RecordingStatus::from_state(&state),
                };
                TaskRecording { task_number, status }
            })
            .collect()
    }
}

fn ensure_complete(session: &CompletedSession) -> Result<(), SubmitError> {
    let answered = session.answers.len();
    let last_answered = session.task_count == 0
        || session
            .answers
            .iter()
            .any(|answer| answer.task_number == session.task_count);
    if answered < session.task_count as usize || !last_answered {
        return Err(SubmitError::Incomplete {
            answered,
            task_count: session.task_count,
        });
    }
    Ok(())
}

/// Marks an attempt dropped mid-flight as failed so it can be retried.
struct AttemptGuard<'a>(&'a Mutex<SessionStatus>);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let mut status = lock(self.0);
        if *status == SessionStatus::AwaitingUploads {
            *status = SessionStatus::SubmitFailed;
        }
    }
}

fn map_submit_error(err: BackendError) -> SubmitError {
    match err {
        BackendError::AlreadySubmitted => SubmitError::AlreadySubmitted,
        other => SubmitError::Backend(other),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::TaskDescriptor;
    use crate::data_capture::types::{CaptureStream, RecorderConfig, TrackKind};
    use crate::session_management::session::TaskAnswer;
    use crate::session_management::task_orchestrator::{Advance, TaskOrchestrator};
    use crate::test_support::{MemoryBackend, ScriptedFactory};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn tasks(n: usize) -> Vec<TaskDescriptor> {
        (1..=n)
            .map(|i| TaskDescriptor {
                id: format!("t{}", i),
                scenario: String::new(),
                question: String::new(),
            })
            .collect()
    }

    /// Runs `n` tasks of 600ms each and returns the finished session.
    async fn run_session(
        backend: Arc<MemoryBackend>,
        queue: UploadQueue,
        factory: ScriptedFactory,
        n: usize,
    ) -> CompletedSession {
        let mut orch = TaskOrchestrator::new("p-1", tasks(n), queue, backend, RecorderConfig::default())
            .with_capture(CaptureStream::new(&[TrackKind::Screen]), Arc::new(factory));
        orch.begin();
        loop {
            sleep(Duration::from_millis(600)).await;
            if orch.complete_task("answer") == Advance::Finished {
                break;
            }
        }
        orch.finish()
    }

    #[tokio::test(start_paused = true)]
    async fn submission_waits_for_a_slow_upload() {
        let backend = Arc::new(MemoryBackend::new().with_upload_delay(2, Duration::from_secs(5)));
        backend.register("p-1");
        let queue = UploadQueue::new();
        let session = run_session(backend.clone(), queue.clone(), ScriptedFactory::new(&["a", "b"]), 2).await;

        let submitter = SessionSubmitter::new(queue.clone(), backend.clone(), Some("p-1".into()));
        let started = Instant::now();
        let ack = submitter.submit(&session).await.unwrap();
        assert!(ack.success);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(queue.pending_count(), 0);

        let submitted_at = backend.submission_times()[0];
        assert_eq!(backend.upload_times().len(), 2);
        assert!(backend.upload_times().iter().all(|at| *at <= submitted_at));

        let statuses: Vec<_> = backend.submissions()[0].recordings.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RecordingStatus::Uploaded, RecordingStatus::Uploaded]);
        assert_eq!(submitter.status(), SessionStatus::Submitted);
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_still_stopping_is_covered_by_the_barrier() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = UploadQueue::new();
        let session = run_session(
            backend.clone(),
            queue.clone(),
            ScriptedFactory::new(&["a"]).never_confirming(),
            1,
        )
        .await;
        // the only recorder waits for its 2s watchdog
        assert_eq!(queue.pending_count(), 0);

        let submitter = SessionSubmitter::new(queue, backend.clone(), Some("p-1".into()));
        let started = Instant::now();
        submitter.submit(&session).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(backend.uploads().len(), 1);
        assert!(backend.upload_times()[0] <= backend.submission_times()[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_empty_recordings_are_reported_distinctly() {
        let backend = Arc::new(MemoryBackend::new().with_failing_upload(1));
        let queue = UploadQueue::new();
        let mut orch = TaskOrchestrator::new("p-1", tasks(3), queue.clone(), backend.clone(), RecorderConfig::default())
            .with_capture(CaptureStream::new(&[TrackKind::Screen]), Arc::new(ScriptedFactory::new(&["a"])));
        orch.begin();
        sleep(Duration::from_millis(200)).await;
        orch.complete_task("one");
        sleep(Duration::from_millis(200)).await;
        orch.complete_task("two");
        // leaves before the probe delivers anything
        orch.complete_task("three");
        let session = orch.finish();

        let submitter = SessionSubmitter::new(queue, backend.clone(), Some("p-1".into()));
        submitter.submit(&session).await.unwrap();

        let statuses: Vec<_> = backend.submissions()[0].recordings.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                RecordingStatus::UploadFailed,
                RecordingStatus::Uploaded,
                RecordingStatus::EmptyCapture
            ]
        );
    }

    fn answered(task_count: u32, numbers: &[u32]) -> CompletedSession {
        CompletedSession {
            participant_id: "p-1".into(),
            answers: numbers
                .iter()
                .map(|n| TaskAnswer {
                    task_id: format!("t{}", n),
                    task_number: *n,
                    answer: "answer".into(),
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                })
                .collect(),
            recorders: Vec::new(),
            started_at: Utc::now(),
            task_count,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_session_is_refused_before_anything_is_sent() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = UploadQueue::new();
        let mut orch = TaskOrchestrator::new("p-1", tasks(3), queue.clone(), backend.clone(), RecorderConfig::default())
            .with_capture(CaptureStream::new(&[TrackKind::Screen]), Arc::new(ScriptedFactory::new(&["a"])));
        orch.begin();
        sleep(Duration::from_millis(600)).await;
        orch.complete_task("only one");
        let session = orch.finish();

        let submitter = SessionSubmitter::new(queue, backend.clone(), Some("p-1".into()));
        assert!(matches!(
            submitter.submit(&session).await,
            Err(SubmitError::Incomplete {
                answered: 1,
                task_count: 3
            })
        ));
        assert_eq!(backend.submit_calls(), 0);
        assert_eq!(submitter.status(), SessionStatus::InProgress);

        // enough answers, but the last task was never reached
        let skipped_last = answered(3, &[1, 2, 2]);
        assert!(matches!(
            submitter.submit(&skipped_last).await,
            Err(SubmitError::Incomplete { answered: 3, .. })
        ));
        assert!(backend.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_submits_reach_the_backend_once() {
        let backend = Arc::new(MemoryBackend::new().with_submit_delay(Duration::from_millis(10)));
        let session = answered(1, &[1]);
        let submitter = SessionSubmitter::new(UploadQueue::new(), backend.clone(), Some("p-1".into()));

        let (first, second) = tokio::join!(submitter.submit(&session), submitter.submit(&session));
        assert!(first.unwrap().success);
        assert!(matches!(second, Err(SubmitError::InProgress)));
        assert_eq!(backend.submit_calls(), 1);
        assert_eq!(backend.submissions().len(), 1);
        assert_eq!(submitter.status(), SessionStatus::Submitted);
    }

    #[tokio::test]
    async fn backend_already_holding_the_session_counts_as_submitted() {
        let backend = Arc::new(MemoryBackend::new());
        let session = answered(1, &[1]);
        SessionSubmitter::new(UploadQueue::new(), backend.clone(), Some("p-1".into()))
            .submit(&session)
            .await
            .unwrap();

        let again = SessionSubmitter::new(UploadQueue::new(), backend.clone(), Some("p-1".into()));
        assert!(matches!(
            again.submit(&session).await,
            Err(SubmitError::AlreadySubmitted)
        ));
        assert_eq!(again.status(), SessionStatus::Submitted);
        assert_eq!(backend.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_attempt_can_be_retried() {
        let backend = Arc::new(MemoryBackend::new().with_submit_delay(Duration::from_millis(50)));
        let session = answered(1, &[1]);
        let submitter = SessionSubmitter::new(UploadQueue::new(), backend.clone(), Some("p-1".into()));

        let cut_short = tokio::time::timeout(Duration::from_millis(10), submitter.submit(&session)).await;
        assert!(cut_short.is_err());
        assert_eq!(submitter.status(), SessionStatus::SubmitFailed);

        submitter.submit(&session).await.unwrap();
        assert_eq!(submitter.status(), SessionStatus::Submitted);
        assert_eq!(backend.submissions().len(), 1);
    }

    #[tokio::test]
    async fn second_submit_is_rejected_locally() {
        let backend = Arc::new(MemoryBackend::new());
        let session = CompletedSession {
            participant_id: "p-1".into(),
            answers: Vec::new(),
            recorders: Vec::new(),
            started_at: Utc::now(),
            task_count: 0,
        };
        let submitter = SessionSubmitter::new(UploadQueue::new(), backend.clone(), Some("p-1".into()));

        submitter.submit(&session).await.unwrap();
        assert!(matches!(
            submitter.submit(&session).await,
            Err(SubmitError::AlreadySubmitted)
        ));
        assert_eq!(backend.submissions().len(), 1);
    }

    #[tokio::test]
    async fn lost_identity_is_replaced_by_a_fallback_registration() {
        let backend = Arc::new(MemoryBackend::new().rejecting_unknown());
        let session = answered(1, &[1]);

        let submitter = SessionSubmitter::new(UploadQueue::new(), backend.clone(), Some("ghost".into()));
        submitter.submit(&session).await.unwrap();

        let registered = backend.registered();
        assert_eq!(registered.len(), 1);
        assert_ne!(registered[0], "ghost");
        assert_eq!(backend.submissions()[0].participant_id, registered[0]);
        assert_eq!(submitter.participant_id(), Some(registered[0].clone()));
        assert_eq!(backend.submissions()[0].recordings[0].status, RecordingStatus::NotRecorded);

        let anonymous = SessionSubmitter::new(UploadQueue::new(), backend.clone(), None);
        anonymous.submit(&session).await.unwrap();
        assert_eq!(backend.registered().len(), 2);
        assert_eq!(backend.submissions().len(), 2);
    }
}
