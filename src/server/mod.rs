//! Local media streaming server.
//!
//! [`MediaService`] is the entry point: it owns the worker pool, the table
//! of running servers, the token registry and the router. `open(path)`
//! yields a URL a player can stream from with HTTP range requests; encrypted
//! files are decrypted on the fly.

pub mod control;
pub mod http;
pub mod listener;
pub mod pool;
pub mod range;
pub mod registry;
pub mod router;
pub mod streamer;

#[cfg(test)]
mod tests;

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, ServerConfig};
use crate::mime::{ExtensionTable, MimeResolver};
use control::PlayerControl;
use listener::{MediaServer, ServerTable, WorkItem};
use pool::WorkerPool;
use registry::TokenRegistry;
use router::RequestRouter;
use streamer::RangeFileStreamer;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Illegal state: {0}")]
    IllegalState(String),
}

impl ServeError {
    /// HTTP status this error is answered with.
    pub fn status(&self) -> u16 {
        match self {
            ServeError::NotFound(_) => 404,
            ServeError::BadRequest(_) => 400,
            ServeError::Internal(_) | ServeError::IllegalState(_) => 500,
        }
    }
}

impl From<io::Error> for ServeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ServeError::NotFound(err.to_string()),
            _ => ServeError::Internal(err.to_string()),
        }
    }
}

impl From<ConfigError> for ServeError {
    fn from(err: ConfigError) -> Self {
        ServeError::IllegalState(err.to_string())
    }
}

/// The streaming backend: servers, pool, registry and router.
///
/// Dropping the service shuts it down.
pub struct MediaService {
    config: ServerConfig,
    pool: WorkerPool<WorkItem>,
    servers: ServerTable,
    registry: Arc<TokenRegistry>,
    router: Arc<RequestRouter>,
}

impl MediaService {
    pub fn new(config: ServerConfig) -> Result<Self, ServeError> {
        Self::with_resolver(config, Arc::new(ExtensionTable::default()))
    }

    pub fn with_resolver(
        config: ServerConfig,
        resolver: Arc<dyn MimeResolver>,
    ) -> Result<Self, ServeError> {
        config.validate()?;

        let registry = Arc::new(TokenRegistry::new());
        let router = Arc::new(RequestRouter::new(
            Arc::clone(&registry),
            resolver,
            RangeFileStreamer::from_config(&config),
        ));
        let pool_router = Arc::clone(&router);
        let pool = WorkerPool::new(config.max_workers, move |item: WorkItem| {
            pool_router.handle_connection(item)
        });

        log::info!(
            "Media service ready (default endpoint {}, {} cipher, max {} workers)",
            config.endpoint_url(),
            config.cipher,
            config.max_workers
        );
        Ok(Self {
            config,
            pool,
            servers: ServerTable::new(),
            registry,
            router,
        })
    }

    /// Make `path` streamable and return its URL. Idempotent per path.
    ///
    /// The first open starts the default server if it is not running.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<String, ServeError> {
        self.registry.issue(path.as_ref(), || {
            let server = self.default_server()?;
            Ok(server.public_url())
        })
    }

    /// Stop streaming `path`. Closing the last open path stops every server.
    pub fn close(&self, path: impl AsRef<Path>) -> bool {
        self.registry
            .revoke(path.as_ref(), || self.servers.stop_all())
    }

    fn default_server(&self) -> Result<Arc<MediaServer>, ServeError> {
        self.start_server(&self.config.ip, self.config.port)
    }

    /// Start (or reuse) a server on an explicit endpoint.
    pub fn start_server(&self, ip: &str, port: u16) -> Result<Arc<MediaServer>, ServeError> {
        if self.pool.is_shut_down() {
            return Err(ServeError::IllegalState("media service is shut down".to_string()));
        }
        self.servers.get_or_start(ip, port, &self.pool)
    }

    pub fn server(&self, url: &str) -> Option<Arc<MediaServer>> {
        self.servers.get(url)
    }

    pub fn active_servers(&self) -> usize {
        self.servers.len()
    }

    pub fn attach_player(&self, player: Arc<dyn PlayerControl>) {
        self.router.attach_player(player);
    }

    pub fn detach_player(&self, player: &Arc<dyn PlayerControl>) -> bool {
        self.router.detach_player(player)
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool<WorkItem> {
        &self.pool
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stop every server and the worker pool. Idempotent.
    pub fn shutdown(&self) {
        if self.pool.is_shut_down() {
            return;
        }
        self.servers.stop_all();
        self.pool.shutdown();
        log::info!("Media service shut down");
    }
}

impl Drop for MediaService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
