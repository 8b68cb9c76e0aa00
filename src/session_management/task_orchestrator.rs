use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::session::{CompletedSession, TaskAnswer};
use super::upload_queue::UploadQueue;
use crate::backend::StudyBackend;
use crate::configuration::TaskDescriptor;
use crate::data_capture::capture_source::PipelineFactory;
use crate::data_capture::recorder::{ChunkedRecorder, RecorderContext, RecorderHandle};
use crate::data_capture::types::{CaptureStream, RecorderConfig};

/// Where the orchestrator went after a task transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Task now active (1-based).
    Task(u32),
    Finished,
}

struct Capture {
    stream: CaptureStream,
    factory: Arc<dyn PipelineFactory>,
}

/// Sequences the tasks of one participant session.
///
/// At most one recorder records at a time: the active task's recorder is
/// stopped (without waiting) before any transition, while recorders of
/// earlier tasks may still be uploading. Without a capture stream, tasks run
/// without recorders.
pub struct TaskOrchestrator {
    participant_id: String,
    tasks: Vec<TaskDescriptor>,
    capture: Option<Capture>,
    queue: UploadQueue,
    backend: Arc<dyn StudyBackend>,
    config: RecorderConfig,
    current: Option<usize>,
    task_started_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    answers: BTreeMap<u32, TaskAnswer>,
    recorders: Vec<RecorderHandle>,
    active: Option<usize>,
}

impl TaskOrchestrator {
    pub fn new(
        participant_id: impl Into<String>,
        tasks: Vec<TaskDescriptor>,
        queue: UploadQueue,
        backend: Arc<dyn StudyBackend>,
        config: RecorderConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            participant_id: participant_id.into(),
            tasks,
            capture: None,
            queue,
            backend,
            config,
            current: None,
            task_started_at: now,
            started_at: now,
            answers: BTreeMap::new(),
            recorders: Vec::new(),
            active: None,
        }
    }

    /// Records every task from the session-wide `stream`. The stream is not
    /// re-requested per task.
    pub fn with_capture(mut self, stream: CaptureStream, factory: Arc<dyn PipelineFactory>) -> Self {
        self.capture = Some(Capture { stream, factory });
        self
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn task_count(&self) -> u32 {
        self.tasks.len() as u32
    }

    pub fn is_recording_enabled(&self) -> bool {
        self.capture.is_some()
    }

    /// Activates the first task.
    pub fn begin(&mut self) -> Advance {
        self.started_at = Utc::now();
        info!(
            "[{}] starting {} task(s), recording {}",
            self.participant_id,
            self.tasks.len(),
            if self.capture.is_some() { "enabled" } else { "disabled" }
        );
        if self.tasks.is_empty() {
            return Advance::Finished;
        }
        self.activate(0);
        Advance::Task(1)
    }

    /// Active task with its 1-based number.
    pub fn current_task(&self) -> Option<(u32, &TaskDescriptor)> {
        self.current
            .and_then(|idx| self.tasks.get(idx).map(|task| (idx as u32 + 1, task)))
    }

    /// Stores the participant's answer to the active task, stops its recorder
    /// and moves on. Returns [`Advance::Finished`] after the last task.
    pub fn complete_task(&mut self, answer: impl Into<String>) -> Advance {
        let Some(idx) = self.current else {
            return Advance::Finished;
        };
        let task_number = idx as u32 + 1;
        self.answers.insert(
            task_number,
            TaskAnswer {
                task_id: self.tasks[idx].id.clone(),
                task_number,
                answer: answer.into(),
                started_at: self.task_started_at,
                completed_at: Utc::now(),
            },
        );
        self.leave_current();

        if idx + 1 < self.tasks.len() {
            self.activate(idx + 1);
            Advance::Task(task_number + 1)
        } else {
            self.current = None;
            info!("[{}] all tasks completed", self.participant_id);
            Advance::Finished
        }
    }

    /// Returns to the previous task with a fresh recorder. `None` on the
    /// first task, where nothing changes.
    pub fn go_back(&mut self) -> Option<u32> {
        let idx = self.current.filter(|idx| *idx > 0)?;
        self.leave_current();
        self.activate(idx - 1);
        Some(idx as u32)
    }

    pub fn recorders(&self) -> &[RecorderHandle] {
        &self.recorders
    }

    pub fn active_recorder(&self) -> Option<&RecorderHandle> {
        self.active.and_then(|idx| self.recorders.get(idx))
    }

    pub fn answers(&self) -> impl Iterator<Item = &TaskAnswer> {
        self.answers.values()
    }

    /// Ends the sequence, stopping the active recorder if the participant
    /// leaves before the last task.
    pub fn finish(mut self) -> CompletedSession {
        self.leave_current();
        CompletedSession {
            participant_id: self.participant_id,
            answers: self.answers.into_values().collect(),
            recorders: self.recorders,
            started_at: self.started_at,
            task_count: self.tasks.len() as u32,
        }
    }

    fn activate(&mut self, idx: usize) {
        let task_number = idx as u32 + 1;
        self.current = Some(idx);
        self.task_started_at = Utc::now();
        debug!(
            "[{}] task {} ({}) active",
            self.participant_id, task_number, self.tasks[idx].id
        );

        if let Some(capture) = &self.capture {
            let handle = ChunkedRecorder::start(RecorderContext {
                participant_id: self.participant_id.clone(),
                task_number,
                stream: capture.stream.clone(),
                factory: Arc::clone(&capture.factory),
                queue: self.queue.clone(),
                backend: Arc::clone(&self.backend),
                config: self.config.clone(),
            });
            self.recorders.push(handle);
            self.active = Some(self.recorders.len() - 1);
        }
    }

    fn leave_current(&mut self) {
        if let Some(handle) = self.active.take().and_then(|idx| self.recorders.get(idx)) {
            handle.stop();
        }
    }
}
