use std::sync::Arc;

use log::{info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::backend::StudyBackend;
use crate::configuration::TaskDescriptor;
use crate::data_capture::capture_source::{CaptureSource, PipelineFactory};
use crate::data_capture::types::RecorderConfig;
use crate::error_handling::types::{ControllerError, SubmitError};
use crate::session_management::session::{CompletedSession, SubmitAck};
use crate::session_management::session_submitter::SessionSubmitter;
use crate::session_management::task_orchestrator::TaskOrchestrator;
use crate::session_management::upload_queue::UploadQueue;

/// Typed instead of an answer to return to the previous task.
pub const BACK_COMMAND: &str = ":back";
/// Typed at the retry prompt to give up on a failed submission.
pub const QUIT_COMMAND: &str = ":quit";

/// Walks one participant through the task list on a line-oriented terminal.
pub struct ParticipantRunner<R, W> {
    input: R,
    output: W,
    tasks: Vec<TaskDescriptor>,
    recorder_config: RecorderConfig,
    backend: Arc<dyn StudyBackend>,
    capture: Option<(Arc<dyn CaptureSource>, Arc<dyn PipelineFactory>)>,
}

impl<R, W> ParticipantRunner<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        input: R,
        output: W,
        tasks: Vec<TaskDescriptor>,
        recorder_config: RecorderConfig,
        backend: Arc<dyn StudyBackend>,
    ) -> Self {
        Self {
            input,
            output,
            tasks,
            recorder_config,
            backend,
            capture: None,
        }
    }

    pub fn with_capture(mut self, source: Arc<dyn CaptureSource>, factory: Arc<dyn PipelineFactory>) -> Self {
        self.capture = Some((source, factory));
        self
    }

    /// Registers, runs every task and submits. A failed submission is
    /// offered for retry until it succeeds or the participant quits. Input
    /// closing before the last answer abandons the session.
    pub async fn run(mut self) -> Result<SubmitAck, ControllerError> {
        let participant_id = self
            .backend
            .register_participant(None)
            .await
            .map_err(ControllerError::BackendError)?;
        info!("[{}] session started", participant_id);

        let queue = UploadQueue::new();
        let mut orchestrator = TaskOrchestrator::new(
            participant_id.clone(),
            self.tasks.clone(),
            queue.clone(),
            Arc::clone(&self.backend),
            self.recorder_config.clone(),
        );

        if let Some((source, factory)) = &self.capture {
            match source.request_capture().await {
                Ok(stream) => {
                    orchestrator = orchestrator.with_capture(stream, Arc::clone(factory));
                }
                Err(e) => {
                    warn!("[{}] {}, continuing without recording", participant_id, e);
                    self.say(&format!("Screen recording is unavailable ({}).\n", e)).await?;
                }
            }
        }

        let total = orchestrator.task_count();
        let mut abandoned = false;
        orchestrator.begin();
        while let Some((number, task)) = orchestrator
            .current_task()
            .map(|(number, task)| (number, task.clone()))
        {
            self.say(&format!(
                "\nTask {}/{}\n{}\n{}\n> ",
                number, total, task.scenario, task.question
            ))
            .await?;

            let Some(line) = self.read_line().await? else {
                warn!("[{}] input closed during task {}", participant_id, number);
                abandoned = true;
                break;
            };
            if line == BACK_COMMAND {
                if orchestrator.go_back().is_none() {
                    self.say("Already at the first task.\n").await?;
                }
                continue;
            }
            orchestrator.complete_task(line);
        }

        let session = orchestrator.finish();
        if abandoned {
            return self.abandon(session, &queue, &participant_id).await;
        }
        let submitter = SessionSubmitter::new(queue, Arc::clone(&self.backend), Some(participant_id));
        self.say("Finishing uploads and submitting your answers...\n").await?;

        loop {
            match submitter.submit(&session).await {
                Ok(ack) => {
                    self.say("Thank you, your answers were submitted.\n").await?;
                    return Ok(ack);
                }
                Err(SubmitError::AlreadySubmitted) => {
                    return Err(ControllerError::SubmitError(SubmitError::AlreadySubmitted));
                }
                Err(e) => {
                    warn!("Submission failed: {}", e);
                    self.say(&format!(
                        "Submission failed: {}\nPress Enter to retry or type {} to give up.\n> ",
                        e, QUIT_COMMAND
                    ))
                    .await?;
                    match self.read_line().await? {
                        Some(line) if line != QUIT_COMMAND => continue,
                        _ => return Err(ControllerError::SubmitError(e)),
                    }
                }
            }
        }
    }

    /// Removes everything the backend holds for a participant who left
    /// before the last task, including uploads still in flight.
    async fn abandon(
        &mut self,
        session: CompletedSession,
        queue: &UploadQueue,
        participant_id: &str,
    ) -> Result<SubmitAck, ControllerError> {
        for handle in &session.recorders {
            handle.wait_handed_off().await;
        }
        queue.drain().await;
        let removed = self
            .backend
            .delete_participant(participant_id)
            .await
            .map_err(ControllerError::BackendError)?;
        info!(
            "[{}] session abandoned, participant deleted with {} recording(s)",
            participant_id, removed
        );
        self.say("Session abandoned, your recordings were removed.\n").await?;
        Err(ControllerError::SubmitError(SubmitError::Incomplete {
            answered: session.answers.len(),
            task_count: session.task_count,
        }))
    }

    async fn say(&mut self, text: &str) -> Result<(), ControllerError> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.flush().await?;
        Ok(())
    }

    /// Next trimmed line, `None` once the input is closed.
    async fn read_line(&mut self) -> Result<Option<String>, ControllerError> {
        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}
