//! In-flight upload tracking and the submission barrier.
//!
//! An [`UploadQueue`] is created once per participant session and shared (by
//! cloning) between the task recorders that produce uploads and the
//! [`SessionSubmitter`](super::session_submitter::SessionSubmitter) that must
//! wait for them. Every registered operation runs on its own tokio task; the
//! queue only keeps the set of operations that have not settled yet plus a
//! ledger of terminal outcomes.
//!
//! ```no_run
//! use usability_capture::session_management::upload_queue::{JobLabel, UploadQueue};
//! use usability_capture::storage::types::StoredRecording;
//!
//! # async fn run() {
//! let queue = UploadQueue::new();
//! queue.enqueue(JobLabel::new("p-1", 1), async {
//!     Ok(StoredRecording { stored_path: "p-1/task-1-screen.bin".into() })
//! });
//! queue.drain().await;
//! assert_eq!(queue.pending_count(), 0);
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::backend::StudyBackend;
use crate::error_handling::types::UploadError;
use crate::storage::types::{MediaKind, RecordingUpload, StoredRecording};

pub type UploadOutcome = Result<StoredRecording, UploadError>;

/// Identifies what an upload is for; matches the store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobLabel {
    pub participant_id: String,
    pub task_number: u32,
}

impl JobLabel {
    pub fn new(participant_id: impl Into<String>, task_number: u32) -> Self {
        Self {
            participant_id: participant_id.into(),
            task_number,
        }
    }
}

impl fmt::Display for JobLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.participant_id, self.task_number)
    }
}

/// Assembled payload of one finalized recording. Immutable once built.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub label: JobLabel,
    pub kind: MediaKind,
    pub payload: bytes::Bytes,
    pub duration: Duration,
}

impl UploadJob {
    fn to_upload(&self) -> RecordingUpload {
        RecordingUpload {
            participant_id: self.label.participant_id.clone(),
            task_number: self.label.task_number,
            kind: self.kind,
            payload: self.payload.clone(),
            duration_ms: self.duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    InFlight,
    Settled(UploadOutcome),
}

impl JobStatus {
    fn is_settled(&self) -> bool {
        matches!(self, JobStatus::Settled(_))
    }
}

/// Terminal record of an upload kept by the queue.
#[derive(Debug, Clone)]
pub struct SettledJob {
    pub id: u64,
    pub label: JobLabel,
    pub outcome: UploadOutcome,
    pub settled_at: DateTime<Utc>,
}

/// Completion future of one enqueued upload.
#[derive(Debug, Clone)]
pub struct UploadTicket {
    id: u64,
    status: watch::Receiver<JobStatus>,
}

impl UploadTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the upload settled. A job whose task vanished without
    /// reporting counts as [`UploadError::Abandoned`].
    pub async fn outcome(&mut self) -> UploadOutcome {
        match self.status.wait_for(JobStatus::is_settled).await {
            Ok(status) => match &*status {
                JobStatus::Settled(outcome) => outcome.clone(),
                JobStatus::InFlight => Err(UploadError::Abandoned),
            },
            Err(_) => Err(UploadError::Abandoned),
        }
    }
}

struct InFlightJob {
    label: JobLabel,
    status: watch::Receiver<JobStatus>,
}

#[derive(Default)]
struct QueueInner {
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, InFlightJob>>,
    settled: Mutex<Vec<SettledJob>>,
}

impl QueueInner {
    fn settle(&self, id: u64, outcome: UploadOutcome) {
        let removed = lock(&self.in_flight).remove(&id);
        if let Some(job) = removed {
            lock(&self.settled).push(SettledJob {
                id,
                label: job.label,
                outcome,
                settled_at: Utc::now(),
            });
        }
    }
}

/// Removes a job from the in-flight set even if its operation panics.
struct SettleGuard {
    inner: Arc<QueueInner>,
    id: u64,
    status: Option<watch::Sender<JobStatus>>,
}

impl SettleGuard {
    fn complete(mut self, outcome: UploadOutcome) {
        self.inner.settle(self.id, outcome.clone());
        if let Some(status) = self.status.take() {
            status.send_replace(JobStatus::Settled(outcome));
        }
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if let Some(status) = self.status.take() {
            self.inner.settle(self.id, Err(UploadError::Abandoned));
            status.send_replace(JobStatus::Settled(Err(UploadError::Abandoned)));
        }
    }
}

/// Set of in-flight upload operations with a drain barrier.
///
/// Cloning yields another handle on the same set.
#[derive(Clone, Default)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending upload operation and starts driving it.
    ///
    /// The operation leaves the in-flight set when it settles, whatever the
    /// outcome. Must be called from within a tokio runtime.
    pub fn enqueue<F>(&self, label: JobLabel, op: F) -> UploadTicket
    where
        F: Future<Output = UploadOutcome> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(JobStatus::InFlight);
        lock(&self.inner.in_flight).insert(
            id,
            InFlightJob {
                label: label.clone(),
                status: rx.clone(),
            },
        );
        debug!("[{}] upload #{} enqueued", label, id);

        let guard = SettleGuard {
            inner: Arc::clone(&self.inner),
            id,
            status: Some(tx),
        };
        tokio::spawn(async move {
            let outcome = op.await;
            match &outcome {
                Ok(stored) => info!("[{}] upload #{} stored at {}", label, id, stored.stored_path),
                Err(e) => warn!("[{}] upload #{} failed: {}", label, id, e),
            }
            guard.complete(outcome);
        });

        UploadTicket { id, status: rx }
    }

    /// Registers the upload of a finalized recording through `backend`,
    /// bounded by `timeout`.
    pub fn enqueue_job(
        &self,
        job: UploadJob,
        backend: Arc<dyn StudyBackend>,
        timeout: Duration,
    ) -> UploadTicket {
        let label = job.label.clone();
        info!(
            "[{}] uploading {} bytes of {} ({:?})",
            label,
            job.payload.len(),
            job.kind,
            job.duration
        );
        self.enqueue(label, async move {
            let upload = job.to_upload();
            match tokio::time::timeout(timeout, backend.upload_recording(&upload)).await {
                Ok(Ok(stored)) => Ok(stored),
                Ok(Err(e)) => Err(UploadError::from(e)),
                Err(_) => Err(UploadError::Timeout(timeout)),
            }
        })
    }

    /// Waits until every operation in flight at call time has settled.
    ///
    /// Failures count as settled. Operations registered after the call are not
    /// covered. Returns how many operations were waited on.
    pub async fn drain(&self) -> usize {
        let snapshot: Vec<watch::Receiver<JobStatus>> = lock(&self.inner.in_flight)
            .values()
            .map(|job| job.status.clone())
            .collect();
        if snapshot.is_empty() {
            return 0;
        }

        let count = snapshot.len();
        info!("Draining {} in-flight upload(s)", count);
        join_all(snapshot.into_iter().map(|mut status| async move {
            let _ = status.wait_for(JobStatus::is_settled).await;
        }))
        .await;
        debug!("Drained {} upload(s)", count);
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    pub fn pending_labels(&self) -> Vec<JobLabel> {
        lock(&self.inner.in_flight)
            .values()
            .map(|job| job.label.clone())
            .collect()
    }

    /// Terminal outcomes in settle order.
    pub fn settled(&self) -> Vec<SettledJob> {
        lock(&self.inner.settled).clone()
    }

    /// Most recently settled outcome for `label`.
    pub fn latest_outcome(&self, label: &JobLabel) -> Option<UploadOutcome> {
        lock(&self.inner.settled)
            .iter()
            .rev()
            .find(|job| &job.label == label)
            .map(|job| job.outcome.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
