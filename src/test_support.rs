//! Scripted capture pipelines and an in-memory study backend shared by the
//! unit tests of the recorder, orchestrator and submitter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::backend::StudyBackend;
use crate::data_capture::capture_source::{CapturePipeline, CaptureSource, PipelineFactory};
use crate::data_capture::types::{CaptureStream, PipelineEvent, TrackKind};
use crate::error_handling::types::{BackendError, CaptureError};
use crate::session_management::session::{SessionSubmission, SubmitAck};
use crate::storage::types::{RecordingUpload, StoredRecording};

/// Builds pipelines that hand out one scripted chunk per data request.
pub struct ScriptedFactory {
    chunks: Vec<Bytes>,
    confirm_stop: bool,
    fail_start: bool,
    requests: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new(chunks: &[&'static str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| Bytes::from_static(c.as_bytes())).collect(),
            confirm_stop: true,
            fail_start: false,
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pipelines never send `Stopped`, leaving finalization to the watchdog.
    pub fn never_confirming(mut self) -> Self {
        self.confirm_stop = false;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Number of data requests received across all pipelines.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PipelineFactory for ScriptedFactory {
    fn create(
        &self,
        _stream: &CaptureStream,
        events: UnboundedSender<PipelineEvent>,
    ) -> Result<Box<dyn CapturePipeline>, CaptureError> {
        Ok(Box::new(ScriptedPipeline {
            chunks: self.chunks.iter().cloned().collect(),
            confirm_stop: self.confirm_stop,
            fail_start: self.fail_start,
            requests: Arc::clone(&self.requests),
            events,
        }))
    }
}

pub struct ScriptedPipeline {
    chunks: VecDeque<Bytes>,
    confirm_stop: bool,
    fail_start: bool,
    requests: Arc<AtomicUsize>,
    events: UnboundedSender<PipelineEvent>,
}

impl CapturePipeline for ScriptedPipeline {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.fail_start {
            return Err(CaptureError::PipelineFailed("scripted start failure".into()));
        }
        Ok(())
    }

    fn request_data(&mut self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(chunk) = self.chunks.pop_front() {
            let _ = self.events.send(PipelineEvent::DataAvailable(chunk));
        }
    }

    fn stop(&mut self) {
        if self.confirm_stop {
            let _ = self.events.send(PipelineEvent::Stopped);
        }
    }
}

/// Capture source that either grants a screen stream or refuses.
pub struct StaticSource {
    granted: bool,
}

impl StaticSource {
    pub fn granting() -> Self {
        Self { granted: true }
    }

    pub fn denying() -> Self {
        Self { granted: false }
    }
}

#[async_trait]
impl CaptureSource for StaticSource {
    async fn request_capture(&self) -> Result<CaptureStream, CaptureError> {
        if self.granted {
            Ok(CaptureStream::new(&[TrackKind::Screen]))
        } else {
            Err(CaptureError::Denied)
        }
    }
}

#[derive(Default)]
struct MemoryState {
    registered: Vec<String>,
    uploads: Vec<(RecordingUpload, Instant)>,
    submissions: Vec<(SessionSubmission, Instant)>,
    upload_delays: HashMap<u32, Duration>,
    failing_tasks: HashSet<u32>,
    reject_unknown: bool,
    failing_submits: usize,
    submit_delay: Duration,
    submit_calls: usize,
}

/// Study backend keeping everything in memory, with scripted latency and
/// failures per task number. Timestamps are tokio instants so paused-clock
/// tests can compare them.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upload_delay(mut self, task_number: u32, delay: Duration) -> Self {
        self.state.get_mut().unwrap().upload_delays.insert(task_number, delay);
        self
    }

    pub fn with_failing_upload(mut self, task_number: u32) -> Self {
        self.state.get_mut().unwrap().failing_tasks.insert(task_number);
        self
    }

    /// Submissions for participants that were never registered are refused.
    pub fn rejecting_unknown(mut self) -> Self {
        self.state.get_mut().unwrap().reject_unknown = true;
        self
    }

    /// The next `count` submissions fail with a transport error.
    pub fn with_failing_submits(mut self, count: usize) -> Self {
        self.state.get_mut().unwrap().failing_submits = count;
        self
    }

    /// Every submission takes `delay` before it is answered.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.state.get_mut().unwrap().submit_delay = delay;
        self
    }

    /// Number of submissions that reached the backend, refused ones included.
    pub fn submit_calls(&self) -> usize {
        self.state.lock().unwrap().submit_calls
    }

    pub fn register(&self, id: &str) {
        self.state.lock().unwrap().registered.push(id.to_string());
    }

    pub fn registered(&self) -> Vec<String> {
        self.state.lock().unwrap().registered.clone()
    }

    pub fn uploads(&self) -> Vec<RecordingUpload> {
        self.state.lock().unwrap().uploads.iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn upload_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().uploads.iter().map(|(_, at)| *at).collect()
    }

    pub fn submissions(&self) -> Vec<SessionSubmission> {
        self.state.lock().unwrap().submissions.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn submission_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().submissions.iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl StudyBackend for MemoryBackend {
    async fn register_participant(&self, requested_id: Option<&str>) -> Result<String, BackendError> {
        let id = requested_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.register(&id);
        Ok(id)
    }

    async fn upload_recording(&self, upload: &RecordingUpload) -> Result<StoredRecording, BackendError> {
        let (delay, fails) = {
            let state = self.state.lock().unwrap();
            (
                state.upload_delays.get(&upload.task_number).copied(),
                state.failing_tasks.contains(&upload.task_number),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(BackendError::Transport("scripted upload failure".into()));
        }
        self.state
            .lock()
            .unwrap()
            .uploads
            .push((upload.clone(), Instant::now()));
        Ok(StoredRecording {
            stored_path: format!(
                "{}/task-{}-{}.bin",
                upload.participant_id, upload.task_number, upload.kind
            ),
        })
    }

    async fn submit_session(&self, submission: &SessionSubmission) -> Result<SubmitAck, BackendError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.submit_calls += 1;
            state.submit_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(BackendError::Transport("scripted submit failure".into()));
        }
        if state.reject_unknown && !state.registered.contains(&submission.participant_id) {
            return Err(BackendError::UnknownParticipant(submission.participant_id.clone()));
        }
        if state
            .submissions
            .iter()
            .any(|(s, _)| s.participant_id == submission.participant_id)
        {
            return Err(BackendError::AlreadySubmitted);
        }
        state.submissions.push((submission.clone(), Instant::now()));
        Ok(SubmitAck { success: true })
    }

    async fn delete_participant(&self, participant_id: &str) -> Result<usize, BackendError> {
        let mut state = self.state.lock().unwrap();
        let before = state.uploads.len();
        state.uploads.retain(|(u, _)| u.participant_id != participant_id);
        state.registered.retain(|id| id != participant_id);
        Ok(before - state.uploads.len())
    }
}
