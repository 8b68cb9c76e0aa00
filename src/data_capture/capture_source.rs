//! Seams to the platform capture capability.
//!
//! A [`CaptureSource`] hands out the session-wide [`CaptureStream`]; a
//! [`PipelineFactory`] builds one encoder pipeline per task recording on top of
//! that stream. Pipelines report back through [`PipelineEvent`]s sent on the
//! channel given at creation time.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use super::types::{CaptureStream, PipelineEvent};
use crate::error_handling::types::CaptureError;

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Asks the platform for screen capture. Fails with
    /// [`CaptureError::Unavailable`] or [`CaptureError::Denied`]; retrying is
    /// left to the caller.
    async fn request_capture(&self) -> Result<CaptureStream, CaptureError>;
}

/// Opaque encoder driving one recording.
///
/// Implementations must not block: data and stop confirmation are delivered
/// asynchronously as [`PipelineEvent`]s.
pub trait CapturePipeline: Send {
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Asks the pipeline to flush whatever it has buffered as a
    /// `DataAvailable` event. Some runtimes only emit data on this request.
    fn request_data(&mut self);

    /// Requests finalization. A `Stopped` event is expected afterwards but is
    /// not guaranteed.
    fn stop(&mut self);
}

pub trait PipelineFactory: Send + Sync {
    fn create(
        &self,
        stream: &CaptureStream,
        events: UnboundedSender<PipelineEvent>,
    ) -> Result<Box<dyn CapturePipeline>, CaptureError>;
}
