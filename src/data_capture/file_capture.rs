use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task;

use super::capture_source::{CapturePipeline, CaptureSource, PipelineFactory};
use super::types::{CaptureStream, PipelineEvent, TrackKind, WeakCaptureStream};
use crate::error_handling::types::CaptureError;

const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Capture source backed by a media file that an external encoder keeps
/// appending to (for example a screen recorder writing a fragmented stream).
///
/// The stream counts as revoked as soon as the file disappears.
#[derive(Debug, Clone)]
pub struct FileCaptureSource {
    path: PathBuf,
    with_microphone: bool,
}

impl FileCaptureSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            with_microphone: false,
        }
    }

    /// Declares that the encoder also muxes microphone input into the file.
    pub fn with_microphone(mut self) -> Self {
        self.with_microphone = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CaptureSource for FileCaptureSource {
    async fn request_capture(&self) -> Result<CaptureStream, CaptureError> {
        if !self.path.is_file() {
            return Err(CaptureError::Unavailable(format!(
                "capture file {} does not exist",
                self.path.display()
            )));
        }

        let kinds: &[TrackKind] = if self.with_microphone {
            &[TrackKind::Screen, TrackKind::Microphone]
        } else {
            &[TrackKind::Screen]
        };
        let stream = CaptureStream::new(kinds);
        info!(
            "[{}] Capture granted from {} ({} track(s))",
            stream.id(),
            self.path.display(),
            stream.tracks().len()
        );

        let weak = stream.downgrade();
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(stream) = weak.upgrade() else {
                    break;
                };
                if !stream.is_active() {
                    break;
                }
                if !path.exists() {
                    warn!(
                        "[{}] Capture file {} vanished, ending tracks",
                        stream.id(),
                        path.display()
                    );
                    stream.revoke();
                    break;
                }
            }
        });

        Ok(stream)
    }
}

impl PipelineFactory for FileCaptureSource {
    fn create(
        &self,
        stream: &CaptureStream,
        events: UnboundedSender<PipelineEvent>,
    ) -> Result<Box<dyn CapturePipeline>, CaptureError> {
        if !stream.is_active() {
            return Err(CaptureError::Unavailable("capture stream is not active".into()));
        }
        Ok(Box::new(FilePipeline::new(self.path.clone(), stream, events)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadRequest {
    Flush,
    Stop,
}

/// Pipeline emitting the bytes appended to the capture file since the
/// recording started, one chunk per data request.
///
/// Reads run on the blocking pool, one at a time and in request order, so
/// the final chunk always precedes [`PipelineEvent::Stopped`].
pub struct FilePipeline {
    path: PathBuf,
    stream: WeakCaptureStream,
    events: UnboundedSender<PipelineEvent>,
    reads: Option<UnboundedSender<ReadRequest>>,
}

impl FilePipeline {
    pub fn new(path: PathBuf, stream: &CaptureStream, events: UnboundedSender<PipelineEvent>) -> Self {
        Self {
            path,
            stream: stream.downgrade(),
            events,
            reads: None,
        }
    }
}

impl CapturePipeline for FilePipeline {
    fn start(&mut self) -> Result<(), CaptureError> {
        let offset = std::fs::metadata(&self.path)?.len();
        debug!("{} capture starts at offset {}", self.path.display(), offset);

        let reader = AppendedReader {
            path: self.path.clone(),
            offset,
            stream: self.stream.clone(),
            events: self.events.clone(),
        };
        let (tx, rx) = unbounded_channel();
        tokio::spawn(reader.run(rx, self.events.clone()));
        self.reads = Some(tx);
        Ok(())
    }

    fn request_data(&mut self) {
        if let Some(reads) = &self.reads {
            let _ = reads.send(ReadRequest::Flush);
        }
    }

    fn stop(&mut self) {
        if let Some(reads) = self.reads.take() {
            let _ = reads.send(ReadRequest::Stop);
        }
    }
}

/// Read side of a [`FilePipeline`], moved onto the blocking pool for each read.
struct AppendedReader {
    path: PathBuf,
    offset: u64,
    stream: WeakCaptureStream,
    events: UnboundedSender<PipelineEvent>,
}

impl AppendedReader {
    async fn run(self, mut requests: UnboundedReceiver<ReadRequest>, events: UnboundedSender<PipelineEvent>) {
        let mut reader = self;
        while let Some(request) = requests.recv().await {
            reader = match task::spawn_blocking(move || {
                reader.flush();
                reader
            })
            .await
            {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = events.send(PipelineEvent::Failed(format!("capture read aborted: {}", e)));
                    return;
                }
            };
            if request == ReadRequest::Stop {
                let _ = events.send(PipelineEvent::Stopped);
                return;
            }
        }
    }

    fn read_appended(&mut self) -> Result<Option<Bytes>, io::Error> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.offset {
            // truncated by the encoder, restart from the top
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        Ok(Some(Bytes::from(buf)))
    }

    fn flush(&mut self) {
        match self.read_appended() {
            Ok(Some(chunk)) => {
                trace!("{} chunk of {} bytes", self.path.display(), chunk.len());
                let _ = self.events.send(PipelineEvent::DataAvailable(chunk));
            }
            Ok(None) => trace!("{} nothing new", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match self.stream.upgrade() {
                Some(stream) => {
                    warn!(
                        "[{}] Capture file {} vanished, ending tracks",
                        stream.id(),
                        self.path.display()
                    );
                    stream.revoke();
                }
                None => {
                    let _ = self.events.send(PipelineEvent::Failed(e.to_string()));
                }
            },
            Err(e) => {
                let _ = self.events.send(PipelineEvent::Failed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn append(path: &Path, bytes: &[u8]) {
        std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap()
            .write_all(bytes)
            .unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = FileCaptureSource::new(dir.path().join("nope.webm"));
        let err = source.request_capture().await.unwrap_err();
        assert!(matches!(err, CaptureError::Unavailable(_)));
    }

    #[tokio::test]
    async fn pipeline_emits_only_bytes_appended_after_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("screen.webm");
        std::fs::write(&path, b"previous-task").unwrap();

        let source = FileCaptureSource::new(&path).with_microphone();
        let stream = source.request_capture().await.unwrap();
        assert!(stream.has_track(TrackKind::Microphone));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = source.create(&stream, tx).unwrap();
        pipeline.start().unwrap();

        append(&path, b"abc");
        pipeline.request_data();
        assert_eq!(
            rx.recv().await,
            Some(PipelineEvent::DataAvailable(Bytes::from_static(b"abc")))
        );

        append(&path, b"de");
        pipeline.stop();
        assert_eq!(
            rx.recv().await,
            Some(PipelineEvent::DataAvailable(Bytes::from_static(b"de")))
        );
        assert_eq!(rx.recv().await, Some(PipelineEvent::Stopped));
    }

    #[tokio::test]
    async fn vanished_file_on_read_revokes_instead_of_failing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("screen.webm");
        std::fs::write(&path, b"x").unwrap();

        let source = FileCaptureSource::new(&path);
        let stream = source.request_capture().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = source.create(&stream, tx).unwrap();
        pipeline.start().unwrap();

        std::fs::remove_file(&path).unwrap();
        pipeline.request_data();

        // well before the next watcher tick
        tokio::time::timeout(Duration::from_millis(200), stream.ended().cancelled())
            .await
            .expect("stream should be revoked by the read");
        assert!(!stream.is_active());

        pipeline.stop();
        assert_eq!(rx.recv().await, Some(PipelineEvent::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn removing_the_file_revokes_the_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("screen.webm");
        std::fs::write(&path, b"x").unwrap();

        let stream = FileCaptureSource::new(&path).request_capture().await.unwrap();
        std::fs::remove_file(&path).unwrap();

        tokio::time::timeout(Duration::from_secs(5), stream.ended().cancelled())
            .await
            .expect("stream should be revoked");
        assert!(!stream.is_active());
    }
}
