use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    TasksEmpty(String),
    DuplicateTask(String),
    BadPortsRange(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::TasksEmpty(e) => write!(f, "Tasks configuration error: {}", e),
            ConfigError::DuplicateTask(e) => write!(f, "Duplicate task id: {}", e),
            ConfigError::BadPortsRange(e) => write!(f, "Port range error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures raised by the capture source or its pipeline before a recorder
/// is running.
#[derive(Debug)]
pub enum CaptureError {
    /// The platform capture capability is absent or the stream is not active.
    Unavailable(String),
    /// The participant refused to grant capture.
    Denied,
    PipelineFailed(String),
    IoError(std::io::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Unavailable(e) => write!(f, "Capture unavailable: {}", e),
            CaptureError::Denied => write!(f, "Capture permission denied"),
            CaptureError::PipelineFailed(e) => write!(f, "Capture pipeline failed: {}", e),
            CaptureError::IoError(e) => write!(f, "Capture IO error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err)
    }
}

/// Why a recorder ended in its `error` terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderFault {
    CaptureUnavailable(String),
    CaptureRevoked,
    /// Finalize assembled a zero-byte payload.
    EmptyCapture,
    PipelineFailed(String),
}

impl fmt::Display for RecorderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderFault::CaptureUnavailable(e) => write!(f, "Capture unavailable: {}", e),
            RecorderFault::CaptureRevoked => write!(f, "Capture revoked by the participant"),
            RecorderFault::EmptyCapture => write!(f, "Capture produced no data"),
            RecorderFault::PipelineFailed(e) => write!(f, "Capture pipeline failed: {}", e),
        }
    }
}

impl std::error::Error for RecorderFault {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    Transport(String),
    Timeout(Duration),
    Rejected(String),
    /// The upload task went away without reporting an outcome.
    Abandoned,
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Transport(e) => write!(f, "Upload transport error: {}", e),
            UploadError::Timeout(d) => write!(f, "Upload timed out after {:?}", d),
            UploadError::Rejected(e) => write!(f, "Upload rejected: {}", e),
            UploadError::Abandoned => write!(f, "Upload abandoned before settling"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<BackendError> for UploadError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transport(e) => UploadError::Transport(e),
            other => UploadError::Rejected(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum BackendError {
    Transport(String),
    UnknownParticipant(String),
    AlreadySubmitted,
    Rejected { status: u16, message: String },
    InvalidResponse(String),
    StorageError(StorageError),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(e) => write!(f, "Backend transport error: {}", e),
            BackendError::UnknownParticipant(id) => write!(f, "Unknown participant: {}", id),
            BackendError::AlreadySubmitted => write!(f, "Session already submitted"),
            BackendError::Rejected { status, message } => {
                write!(f, "Backend rejected request ({}): {}", status, message)
            }
            BackendError::InvalidResponse(e) => write!(f, "Invalid backend response: {}", e),
            BackendError::StorageError(e) => write!(f, "Backend storage error: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<StorageError> for BackendError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => BackendError::UnknownParticipant(id),
            StorageError::AlreadySubmitted => BackendError::AlreadySubmitted,
            other => BackendError::StorageError(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    ConnectionFailed,
    WriteFailed,
    ReadFailed,
    NotFound(String),
    AlreadySubmitted,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed => write!(f, "Storage connection failed"),
            StorageError::WriteFailed => write!(f, "Storage write failed"),
            StorageError::ReadFailed => write!(f, "Storage read failed"),
            StorageError::NotFound(id) => write!(f, "Storage record not found: {}", id),
            StorageError::AlreadySubmitted => write!(f, "Participant already submitted"),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum SubmitError {
    AlreadySubmitted,
    /// Another submission of the same session is still running.
    InProgress,
    /// Not every task has an answer yet.
    Incomplete { answered: usize, task_count: u32 },
    RegistrationFailed(BackendError),
    Backend(BackendError),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::AlreadySubmitted => write!(f, "Session already submitted"),
            SubmitError::InProgress => write!(f, "Session submission already in progress"),
            SubmitError::Incomplete { answered, task_count } => write!(
                f,
                "Session incomplete: {} of {} task(s) answered",
                answered, task_count
            ),
            SubmitError::RegistrationFailed(e) => {
                write!(f, "Fallback participant registration failed: {}", e)
            }
            SubmitError::Backend(e) => write!(f, "Submission failed: {}", e),
        }
    }
}

impl std::error::Error for SubmitError {}

#[derive(Debug)]
pub enum WebError {
    BindFailed(String),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::BindFailed(e) => write!(f, "Web server bind failed: {}", e),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    WebError(WebError),
    CaptureError(CaptureError),
    BackendError(BackendError),
    SubmitError(SubmitError),
    IoError(std::io::Error),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::WebError(e) => write!(f, "Web error: {}", e),
            ControllerError::CaptureError(e) => write!(f, "Capture error: {}", e),
            ControllerError::BackendError(e) => write!(f, "Backend error: {}", e),
            ControllerError::SubmitError(e) => write!(f, "Submit error: {}", e),
            ControllerError::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        ControllerError::IoError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_maps_to_unknown_participant() {
        let err: BackendError = StorageError::NotFound("p-1".into()).into();
        assert!(matches!(err, BackendError::UnknownParticipant(ref id) if id == "p-1"));
    }

    #[test]
    fn backend_transport_error_stays_transport_for_uploads() {
        let err: UploadError = BackendError::Transport("connection reset".into()).into();
        assert_eq!(err, UploadError::Transport("connection reset".into()));

        let err: UploadError = BackendError::AlreadySubmitted.into();
        assert!(matches!(err, UploadError::Rejected(_)));
    }
}
