//! Common data types used across the data_capture subsystem.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::configuration::RecorderSettings;
use crate::error_handling::types::{RecorderFault, UploadError};

/// Kind of input a capture track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Screen,
    Microphone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTrack {
    pub id: Uuid,
    pub kind: TrackKind,
}

#[derive(Debug)]
struct StreamInner {
    id: Uuid,
    tracks: Vec<CaptureTrack>,
    active: AtomicBool,
    ended: CancellationToken,
}

/// Live, revocable handle to screen (and optionally microphone) input.
///
/// Cloning is cheap and every clone observes the same revocation. The stream is
/// created once per participant session and shared read-only by the recorders
/// of successive tasks.
#[derive(Debug, Clone)]
pub struct CaptureStream {
    inner: Arc<StreamInner>,
}

impl CaptureStream {
    pub fn new(kinds: &[TrackKind]) -> Self {
        let tracks = kinds
            .iter()
            .map(|kind| CaptureTrack {
                id: Uuid::new_v4(),
                kind: *kind,
            })
            .collect();
        Self {
            inner: Arc::new(StreamInner {
                id: Uuid::new_v4(),
                tracks,
                active: AtomicBool::new(true),
                ended: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn tracks(&self) -> &[CaptureTrack] {
        &self.inner.tracks
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.inner.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire) && !self.inner.tracks.is_empty()
    }

    /// Signals that a track ended, i.e. the participant withdrew the capture
    /// permission. Idempotent.
    pub fn revoke(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.ended.cancel();
    }

    /// Token cancelled when the stream is revoked.
    pub fn ended(&self) -> CancellationToken {
        self.inner.ended.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakCaptureStream {
        WeakCaptureStream {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning reference used by watchers that must not keep a stream alive.
#[derive(Clone)]
pub(crate) struct WeakCaptureStream {
    inner: Weak<StreamInner>,
}

impl WeakCaptureStream {
    pub(crate) fn upgrade(&self) -> Option<CaptureStream> {
        self.inner.upgrade().map(|inner| CaptureStream { inner })
    }
}

/// Callback-style notifications from a capture pipeline, delivered over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    DataAvailable(Bytes),
    Stopped,
    Failed(String),
}

/// Timing knobs of the recorder.
///
/// `poll_interval` of `None` disables the data polling loop for runtimes whose
/// pipelines flush reliably on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    pub poll_interval: Option<Duration>,
    pub probe_delay: Duration,
    pub finalize_timeout: Duration,
    pub upload_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Some(Duration::from_millis(500)),
            probe_delay: Duration::from_millis(100),
            finalize_timeout: Duration::from_secs(2),
            upload_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&RecorderSettings> for RecorderConfig {
    fn from(settings: &RecorderSettings) -> Self {
        Self {
            poll_interval: match settings.poll_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            probe_delay: Duration::from_millis(settings.probe_delay_ms),
            finalize_timeout: Duration::from_millis(settings.finalize_timeout_ms),
            upload_timeout: Duration::from_secs(settings.upload_timeout_secs),
        }
    }
}

/// Lifecycle of one task recording.
///
/// ```text
/// idle -> starting -> recording -> stopping -> finalized -> uploading -> done
///                                                                   \-> upload_failed
/// (any pre-upload state) -> error
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Finalized,
    Uploading,
    Done,
    UploadFailed(UploadError),
    Error(RecorderFault),
}

impl RecorderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecorderState::Done | RecorderState::UploadFailed(_) | RecorderState::Error(_)
        )
    }

    /// True once the recording no longer depends on the capture pipeline: its
    /// upload job exists, or it will never have one.
    pub fn is_handed_off(&self) -> bool {
        matches!(self, RecorderState::Uploading) || self.is_terminal()
    }
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderState::Idle => write!(f, "idle"),
            RecorderState::Starting => write!(f, "starting"),
            RecorderState::Recording => write!(f, "recording"),
            RecorderState::Stopping => write!(f, "stopping"),
            RecorderState::Finalized => write!(f, "finalized"),
            RecorderState::Uploading => write!(f, "uploading"),
            RecorderState::Done => write!(f, "done"),
            RecorderState::UploadFailed(e) => write!(f, "upload_failed ({})", e),
            RecorderState::Error(e) => write!(f, "error ({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoke_deactivates_every_clone() {
        let stream = CaptureStream::new(&[TrackKind::Screen, TrackKind::Microphone]);
        let other = stream.clone();
        assert!(other.is_active());
        assert!(other.has_track(TrackKind::Microphone));

        stream.revoke();
        assert!(!other.is_active());
        assert!(other.ended().is_cancelled());
    }

    #[test]
    fn stream_without_tracks_is_inactive() {
        assert!(!CaptureStream::new(&[]).is_active());
    }

    #[test]
    fn weak_stream_does_not_keep_it_alive() {
        let stream = CaptureStream::new(&[TrackKind::Screen]);
        let weak = stream.downgrade();
        assert!(weak.upgrade().is_some());
        drop(stream);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn zero_poll_interval_disables_polling() {
        let settings = RecorderSettings {
            poll_interval_ms: 0,
            ..RecorderSettings::default()
        };
        let config = RecorderConfig::from(&settings);
        assert_eq!(config.poll_interval, None);
        assert_eq!(config.finalize_timeout, Duration::from_secs(2));
    }

    #[test]
    fn handed_off_states() {
        assert!(!RecorderState::Stopping.is_handed_off());
        assert!(RecorderState::Uploading.is_handed_off());
        assert!(RecorderState::Error(RecorderFault::EmptyCapture).is_handed_off());
        assert!(!RecorderState::Uploading.is_terminal());
    }
}
