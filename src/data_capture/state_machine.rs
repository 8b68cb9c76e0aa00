//! Pure transition logic of a task recording.
//!
//! [`RecordingMachine`] consumes [`RecorderEvent`]s and answers with the
//! [`Effect`]s the driver has to perform (start timers, stop the pipeline,
//! enqueue the payload...). It owns the chunk list but performs no IO, which
//! keeps the ordering rules checkable without a runtime:
//! - the payload is only handed out after the machine went through `finalized`
//! - the first of stop confirmation / watchdog expiry finalizes, the other is ignored
//! - an empty payload ends in `error(empty capture)` and is never enqueued

use bytes::{Bytes, BytesMut};
use log::trace;

use super::types::RecorderState;
use crate::error_handling::types::{RecorderFault, UploadError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    StartRequested { stream_active: bool },
    PipelineStarted,
    PipelineStartFailed(String),
    Chunk(Bytes),
    StopRequested,
    StopConfirmed,
    WatchdogExpired,
    TrackEnded,
    PipelineFailed(String),
    UploadSettled(Result<(), UploadError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartPipeline,
    /// Arm the start probe and the periodic data requests.
    StartPolling,
    /// Cancel polling and freeze the elapsed time.
    StopPolling,
    StopPipeline,
    ArmWatchdog,
    DisarmWatchdog,
    Enqueue(Bytes),
    Report(RecorderFault),
}

#[derive(Debug)]
pub struct RecordingMachine {
    state: RecorderState,
    chunks: Vec<Bytes>,
    trail: Vec<RecorderState>,
}

impl Default for RecordingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingMachine {
    pub fn new() -> Self {
        Self {
            state: RecorderState::Idle,
            chunks: Vec::new(),
            trail: vec![RecorderState::Idle],
        }
    }

    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    /// Every state entered so far, in order.
    pub fn trail(&self) -> &[RecorderState] {
        &self.trail
    }

    pub fn buffered_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn handle(&mut self, event: RecorderEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        let current = self.state.clone();

        match (current, event) {
            (RecorderState::Idle, RecorderEvent::StartRequested { stream_active: true }) => {
                self.enter(RecorderState::Starting);
                effects.push(Effect::StartPipeline);
            }
            (RecorderState::Idle, RecorderEvent::StartRequested { stream_active: false }) => {
                self.fail(
                    RecorderFault::CaptureUnavailable("capture stream is not active".into()),
                    &mut effects,
                );
            }
            (RecorderState::Starting, RecorderEvent::PipelineStarted) => {
                self.enter(RecorderState::Recording);
                effects.push(Effect::StartPolling);
            }
            (RecorderState::Starting, RecorderEvent::PipelineStartFailed(reason)) => {
                self.fail(RecorderFault::PipelineFailed(reason), &mut effects);
            }
            (
                RecorderState::Starting | RecorderState::Recording | RecorderState::Stopping,
                RecorderEvent::Chunk(chunk),
            ) => {
                if !chunk.is_empty() {
                    trace!("buffering chunk of {} bytes", chunk.len());
                    self.chunks.push(chunk);
                }
            }
            (
                RecorderState::Starting | RecorderState::Recording,
                RecorderEvent::StopRequested,
            ) => {
                self.enter(RecorderState::Stopping);
                effects.push(Effect::StopPolling);
                effects.push(Effect::StopPipeline);
                effects.push(Effect::ArmWatchdog);
            }
            (RecorderState::Stopping, RecorderEvent::StopConfirmed) => {
                effects.push(Effect::DisarmWatchdog);
                self.finalize(&mut effects);
            }
            (RecorderState::Stopping, RecorderEvent::WatchdogExpired) => {
                self.finalize(&mut effects);
            }
            (
                RecorderState::Starting | RecorderState::Recording,
                RecorderEvent::TrackEnded,
            ) => {
                effects.push(Effect::StopPolling);
                effects.push(Effect::StopPipeline);
                self.fail(RecorderFault::CaptureRevoked, &mut effects);
            }
            (
                RecorderState::Starting | RecorderState::Recording | RecorderState::Stopping,
                RecorderEvent::PipelineFailed(reason),
            ) => {
                effects.push(Effect::StopPolling);
                effects.push(Effect::DisarmWatchdog);
                self.fail(RecorderFault::PipelineFailed(reason), &mut effects);
            }
            (RecorderState::Uploading, RecorderEvent::UploadSettled(Ok(()))) => {
                self.enter(RecorderState::Done);
            }
            (RecorderState::Uploading, RecorderEvent::UploadSettled(Err(e))) => {
                self.enter(RecorderState::UploadFailed(e));
            }
            (state, event) => {
                trace!("ignoring {:?} in state {}", event, state);
            }
        }

        effects
    }

    fn finalize(&mut self, effects: &mut Vec<Effect>) {
        self.enter(RecorderState::Finalized);

        let payload = self.assemble();
        if payload.is_empty() {
            self.fail(RecorderFault::EmptyCapture, effects);
            return;
        }

        self.enter(RecorderState::Uploading);
        effects.push(Effect::Enqueue(payload));
    }

    fn assemble(&mut self) -> Bytes {
        let chunks = std::mem::take(&mut self.chunks);
        if chunks.len() == 1 {
            return chunks.into_iter().next().unwrap_or_default();
        }
        let mut payload = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            payload.extend_from_slice(&chunk);
        }
        payload.freeze()
    }

    fn fail(&mut self, fault: RecorderFault, effects: &mut Vec<Effect>) {
        self.chunks.clear();
        self.enter(RecorderState::Error(fault.clone()));
        effects.push(Effect::Report(fault));
    }

    fn enter(&mut self, state: RecorderState) {
        self.trail.push(state.clone());
        self.state = state;
    }
}
