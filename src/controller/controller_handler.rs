use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info};
use tokio::io::BufReader;

use super::participant_runner::ParticipantRunner;
use crate::backend::{HttpBackend, StoreBackend};
use crate::configuration::config::Config;
use crate::configuration::types::StorageBackend;
use crate::data_capture::file_capture::FileCaptureSource;
use crate::data_capture::types::RecorderConfig;
use crate::error_handling::types::*;
use crate::session_management::session::SubmitAck;
use crate::storage::{DatabaseStorage, FileStorage, Storage};
use crate::web_interface::WebServer;

/// What the `participate` command needs besides the config file.
#[derive(Debug, Clone)]
pub struct ParticipateOptions {
    pub server_url: String,
    pub capture_file: Option<PathBuf>,
    pub with_audio: bool,
}

pub struct Controller {
    pub config: Config,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config.validate().map_err(|e| {
            error!("Invalid configuration: {}", e);
            ControllerError::ConfigurationError(e)
        })?;
        Ok(Self { config })
    }

    /// Opens the storage backend named in the config.
    pub async fn open_storage(&self) -> Result<Arc<dyn Storage>, ControllerError> {
        let path = &self.config.storage.path;
        let storage: Arc<dyn Storage> = match self.config.storage.backend {
            StorageBackend::File => Arc::new(FileStorage::new(path).map_err(ControllerError::StorageError)?),
            StorageBackend::Database if path.extension().is_some() => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Arc::new(
                    DatabaseStorage::connect_file(path)
                        .await
                        .map_err(ControllerError::StorageError)?,
                )
            }
            StorageBackend::Database => Arc::new(
                DatabaseStorage::open_in(path)
                    .await
                    .map_err(ControllerError::StorageError)?,
            ),
        };
        info!(
            "Using {:?} storage at {}",
            self.config.storage.backend,
            path.display()
        );
        Ok(storage)
    }

    /// Runs the study server until the process exits.
    pub async fn serve(&self) -> Result<(), ControllerError> {
        let storage = self.open_storage().await?;
        let backend = StoreBackend::new(storage, self.config.server.reject_repeat_ip);
        let server = WebServer::new(backend, &self.config.server).map_err(ControllerError::WebError)?;
        server.start().await.map_err(ControllerError::WebError)
    }

    /// Runs one participant session against a study server, on stdin/stdout.
    pub async fn participate(&self, options: ParticipateOptions) -> Result<SubmitAck, ControllerError> {
        let backend = HttpBackend::new(options.server_url.as_str()).map_err(ControllerError::BackendError)?;
        info!("Participating against {}", backend.base_url());

        let mut runner = ParticipantRunner::new(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            self.config.tasks.clone(),
            RecorderConfig::from(&self.config.recorder),
            Arc::new(backend),
        );
        if let Some(path) = &options.capture_file {
            let mut source = FileCaptureSource::new(path);
            if options.with_audio {
                source = source.with_microphone();
            }
            let source = Arc::new(source);
            runner = runner.with_capture(source.clone(), source);
        } else {
            info!("No capture file given, tasks will not be recorded");
        }
        runner.run().await
    }
}
