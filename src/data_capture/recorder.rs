//! Per-task recording driver.
//!
//! [`ChunkedRecorder::start`] spawns one tokio task per task recording. The
//! task owns a [`RecordingMachine`] and turns everything that can happen to a
//! recording into machine events:
//! - data and stop confirmations from the capture pipeline
//! - the stop command from the orchestrator (non-blocking on the caller side)
//! - the start probe and periodic data requests
//! - the finalize watchdog
//! - revocation of the capture stream
//! - the outcome of the upload job
//!
//! The effects the machine answers with are executed in order before the new
//! state is published, so a recorder observed in `uploading` always has its
//! job registered in the [`UploadQueue`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use usability_capture::data_capture::recorder::{ChunkedRecorder, RecorderContext};
//! # async fn run(ctx: RecorderContext) {
//! let handle = ChunkedRecorder::start(ctx);
//! // ... participant works on the task ...
//! handle.stop();
//! let state = handle.wait_handed_off().await;
//! println!("task {} recording is {}", handle.task_number(), state);
//! # }
//! ```

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

use super::capture_source::{CapturePipeline, PipelineFactory};
use super::state_machine::{Effect, RecorderEvent, RecordingMachine};
use super::types::{CaptureStream, PipelineEvent, RecorderConfig, RecorderState};
use crate::backend::StudyBackend;
use crate::session_management::upload_queue::{
    JobLabel, UploadJob, UploadOutcome, UploadQueue, UploadTicket,
};
use crate::storage::types::MediaKind;

/// Everything a recorder needs for one task.
#[derive(Clone)]
pub struct RecorderContext {
    pub participant_id: String,
    pub task_number: u32,
    pub stream: CaptureStream,
    pub factory: Arc<dyn PipelineFactory>,
    pub queue: UploadQueue,
    pub backend: Arc<dyn StudyBackend>,
    pub config: RecorderConfig,
}

#[derive(Debug)]
enum Command {
    Stop,
}

/// Owner-side handle of a running recorder.
///
/// Dropping the handle stops the recording.
#[derive(Debug)]
pub struct RecorderHandle {
    task_number: u32,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<RecorderState>,
}

impl RecorderHandle {
    pub fn task_number(&self) -> u32 {
        self.task_number
    }

    /// Requests stop and returns immediately. Repeated calls and calls on a
    /// finished recorder are no-ops.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn state(&self) -> RecorderState {
        self.state.borrow().clone()
    }

    /// Waits until the published state satisfies `predicate`, or the
    /// recorder task is gone, and returns that state.
    pub async fn wait_for_state<F>(&self, predicate: F) -> RecorderState
    where
        F: FnMut(&RecorderState) -> bool,
    {
        let mut state = self.state.clone();
        let reached = state.wait_for(predicate).await.map(|s| s.clone());
        match reached {
            Ok(s) => s,
            Err(_) => state.borrow().clone(),
        }
    }

    pub async fn wait_terminal(&self) -> RecorderState {
        self.wait_for_state(RecorderState::is_terminal).await
    }

    /// Waits until the recording no longer needs the capture pipeline, i.e.
    /// its upload job is registered or it ended without one.
    pub async fn wait_handed_off(&self) -> RecorderState {
        self.wait_for_state(RecorderState::is_handed_off).await
    }
}

pub struct ChunkedRecorder;

impl ChunkedRecorder {
    /// Spawns the recorder for one task and starts recording right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(ctx: RecorderContext) -> RecorderHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RecorderState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task_number = ctx.task_number;

        let driver = Driver {
            label: JobLabel::new(ctx.participant_id.clone(), ctx.task_number),
            ctx,
            machine: RecordingMachine::new(),
            state_tx,
            events_tx,
            events_rx,
            pipeline: None,
            probe: None,
            poll: None,
            watchdog: None,
            upload: None,
            started_at: None,
            elapsed: None,
        };
        tokio::spawn(driver.run(commands_rx));

        RecorderHandle {
            task_number,
            commands: commands_tx,
            state: state_rx,
        }
    }
}

enum Wake {
    TrackEnded,
    Pipeline(PipelineEvent),
    Command(Option<Command>),
    Watchdog,
    Probe,
    Poll,
    Upload(UploadOutcome),
}

struct Driver {
    label: JobLabel,
    ctx: RecorderContext,
    machine: RecordingMachine,
    state_tx: watch::Sender<RecorderState>,
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
    events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    pipeline: Option<Box<dyn CapturePipeline>>,
    probe: Option<Pin<Box<Sleep>>>,
    poll: Option<Interval>,
    watchdog: Option<Pin<Box<Sleep>>>,
    upload: Option<UploadTicket>,
    started_at: Option<Instant>,
    elapsed: Option<Duration>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let ended = self.ctx.stream.ended();
        let mut revocation_seen = false;
        let mut commands_open = true;

        info!("[{}] recorder starting", self.label);
        let stream_active = self.ctx.stream.is_active();
        self.dispatch(RecorderEvent::StartRequested { stream_active });

        while !self.machine.state().is_terminal() {
            let wake = tokio::select! {
                biased;
                _ = ended.cancelled(), if !revocation_seen => Wake::TrackEnded,
                Some(event) = self.events_rx.recv() => Wake::Pipeline(event),
                command = commands.recv(), if commands_open => Wake::Command(command),
                _ = fire(&mut self.watchdog) => Wake::Watchdog,
                _ = fire(&mut self.probe) => Wake::Probe,
                _ = tick(&mut self.poll) => Wake::Poll,
                outcome = settle(&mut self.upload) => Wake::Upload(outcome),
            };

            match wake {
                Wake::TrackEnded => {
                    revocation_seen = true;
                    warn!("[{}] capture track ended", self.label);
                    self.dispatch(RecorderEvent::TrackEnded);
                }
                Wake::Pipeline(PipelineEvent::DataAvailable(chunk)) => {
                    self.dispatch(RecorderEvent::Chunk(chunk));
                }
                Wake::Pipeline(PipelineEvent::Stopped) => {
                    self.dispatch(RecorderEvent::StopConfirmed);
                }
                Wake::Pipeline(PipelineEvent::Failed(reason)) => {
                    self.dispatch(RecorderEvent::PipelineFailed(reason));
                }
                Wake::Command(Some(Command::Stop)) => {
                    self.dispatch(RecorderEvent::StopRequested);
                }
                Wake::Command(None) => {
                    debug!("[{}] handle dropped, stopping", self.label);
                    commands_open = false;
                    self.dispatch(RecorderEvent::StopRequested);
                }
                Wake::Watchdog => {
                    self.watchdog = None;
                    warn!(
                        "[{}] no stop confirmation after {:?}, finalizing with buffered data",
                        self.label, self.ctx.config.finalize_timeout
                    );
                    self.dispatch(RecorderEvent::WatchdogExpired);
                }
                Wake::Probe => {
                    self.probe = None;
                    self.request_data();
                }
                Wake::Poll => self.request_data(),
                Wake::Upload(outcome) => {
                    self.upload = None;
                    self.dispatch(RecorderEvent::UploadSettled(outcome.map(|_| ())));
                }
            }
        }

        info!("[{}] recorder finished: {}", self.label, self.machine.state());
    }

    /// Feeds `event` to the machine, runs the resulting effects (which may
    /// produce follow-up events) and publishes the state reached.
    fn dispatch(&mut self, event: RecorderEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(next) = self.apply(effect) {
                    pending.push_back(next);
                }
            }
        }

        let state = self.machine.state().clone();
        let changed = *self.state_tx.borrow() != state;
        if changed {
            debug!("[{}] recorder {}", self.label, state);
            self.state_tx.send_replace(state);
        }
    }

    fn apply(&mut self, effect: Effect) -> Option<RecorderEvent> {
        match effect {
            Effect::StartPipeline => Some(self.start_pipeline()),
            Effect::StartPolling => {
                let now = Instant::now();
                self.started_at = Some(now);
                self.probe = Some(Box::pin(sleep(self.ctx.config.probe_delay)));
                self.poll = self.ctx.config.poll_interval.map(|period| {
                    let mut poll = interval_at(now + period, period);
                    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    poll
                });
                None
            }
            Effect::StopPolling => {
                self.probe = None;
                self.poll = None;
                self.elapsed = self.started_at.map(|at| at.elapsed());
                None
            }
            Effect::StopPipeline => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.stop();
                }
                None
            }
            Effect::ArmWatchdog => {
                self.watchdog = Some(Box::pin(sleep(self.ctx.config.finalize_timeout)));
                None
            }
            Effect::DisarmWatchdog => {
                self.watchdog = None;
                None
            }
            Effect::Enqueue(payload) => {
                self.enqueue(payload);
                None
            }
            Effect::Report(fault) => {
                warn!("[{}] recording failed: {}", self.label, fault);
                None
            }
        }
    }

    fn start_pipeline(&mut self) -> RecorderEvent {
        let created = self
            .ctx
            .factory
            .create(&self.ctx.stream, self.events_tx.clone());
        let mut pipeline = match created {
            Ok(pipeline) => pipeline,
            Err(e) => return RecorderEvent::PipelineStartFailed(e.to_string()),
        };
        match pipeline.start() {
            Ok(()) => {
                self.pipeline = Some(pipeline);
                RecorderEvent::PipelineStarted
            }
            Err(e) => RecorderEvent::PipelineStartFailed(e.to_string()),
        }
    }

    fn request_data(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.request_data();
        }
    }

    fn enqueue(&mut self, payload: Bytes) {
        let job = UploadJob {
            label: self.label.clone(),
            kind: MediaKind::Screen,
            payload,
            duration: self.elapsed.unwrap_or_default(),
        };
        self.upload = Some(self.ctx.queue.enqueue_job(
            job,
            Arc::clone(&self.ctx.backend),
            self.ctx.config.upload_timeout,
        ));
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => pending().await,
    }
}

async fn settle(upload: &mut Option<UploadTicket>) -> UploadOutcome {
    match upload {
        Some(ticket) => ticket.outcome().await,
        None => pending().await,
    }
}
