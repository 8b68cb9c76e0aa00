use std::net::SocketAddr;

use log::info;

use super::routes::api_routes;
use crate::backend::StoreBackend;
use crate::configuration::types::ServerConfig;
use crate::error_handling::types::WebError;

/// HTTP face of the study server.
pub struct WebServer {
    backend: StoreBackend,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(backend: StoreBackend, config: &ServerConfig) -> Result<Self, WebError> {
        let addr = format!("{}:{}", config.bind_address, config.port)
            .parse::<SocketAddr>()
            .map_err(|e| WebError::BindFailed(format!("{}: {}", config.bind_address, e)))?;
        Ok(Self { backend, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until the process exits.
    pub async fn start(&self) -> Result<(), WebError> {
        // warp panics on a failed bind, so probe the address first
        drop(
            tokio::net::TcpListener::bind(self.addr)
                .await
                .map_err(|e| WebError::BindFailed(format!("{}: {}", self.addr, e)))?,
        );

        info!("Study server listening on http://{}", self.addr);
        warp::serve(api_routes(self.backend.clone()))
            .run(self.addr)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_storage::FileStorage;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn backend() -> (TempDir, StoreBackend) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        (dir, StoreBackend::new(Arc::new(storage), true))
    }

    #[test]
    fn invalid_bind_address_is_reported() {
        let (_dir, backend) = backend();
        let config = ServerConfig {
            bind_address: "not-an-ip".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            WebServer::new(backend, &config),
            Err(WebError::BindFailed(_))
        ));
    }

    #[tokio::test]
    async fn occupied_port_is_reported() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_dir, backend) = backend();
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            port: taken.local_addr().unwrap().port(),
            reject_repeat_ip: true,
        };
        let server = WebServer::new(backend, &config).unwrap();
        assert!(matches!(server.start().await, Err(WebError::BindFailed(_))));
    }
}
