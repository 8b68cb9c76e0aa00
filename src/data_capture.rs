pub mod capture_source;
pub mod file_capture;
pub mod recorder;
pub mod state_machine;
pub mod types;

pub use capture_source::{CapturePipeline, CaptureSource, PipelineFactory};
pub use file_capture::FileCaptureSource;
pub use recorder::{ChunkedRecorder, RecorderContext, RecorderHandle};
pub use types::{CaptureStream, PipelineEvent, RecorderConfig, RecorderState, TrackKind};
