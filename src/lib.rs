//! Embedded media streaming backend.
//!
//! Serves local (optionally encrypted) media files to a player over HTTP
//! range requests. See [`server::MediaService`].

pub mod config;
pub mod crypto;
pub mod mime;
pub mod server;

pub use config::{CipherKind, ConfigError, ServerConfig};
pub use server::control::PlayerControl;
pub use server::{MediaService, ServeError};
