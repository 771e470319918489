//! Server configuration.
//!
//! Precedence, lowest first: built-in defaults, `.env` file, process
//! environment (`MEDIA_*`), then CLI flags applied by the binary.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::crypto::kdf::{DEFAULT_ITERATIONS, FALLBACK_PASSWORD};

pub const ENV_IP: &str = "MEDIA_SERVER_IP";
pub const ENV_PORT: &str = "MEDIA_SERVER_PORT";
pub const ENV_MAX_WORKERS: &str = "MEDIA_MAX_WORKERS";
pub const ENV_CIPHER: &str = "MEDIA_CIPHER";
pub const ENV_KDF_ITERATIONS: &str = "MEDIA_KDF_ITERATIONS";

pub const DEFAULT_IP: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_MAX_WORKERS: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("max_workers must be at least 1")]
    ZeroWorkers,
    #[error("kdf_iterations must be at least 1")]
    ZeroIterations,
    #[error("Server IP must not be empty")]
    EmptyIp,
}

/// Which on-disk format encrypted files are in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CipherKind {
    /// One AES-256-CTR keystream over the whole file.
    #[default]
    Ctr,
    /// Header plus independently encrypted AES-256-CBC chunks.
    Chunked,
}

impl FromStr for CipherKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ctr" => Ok(Self::Ctr),
            "chunked" => Ok(Self::Chunked),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ctr => f.write_str("ctr"),
            Self::Chunked => f.write_str("chunked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host the default server binds to and advertises in URLs.
    pub ip: String,
    /// Port of the default server. 0 picks a free port.
    pub port: u16,
    /// Pool size the workers shrink back to after a burst.
    pub max_workers: usize,
    /// Format of files with an encrypted (`.e*`) extension.
    pub cipher: CipherKind,
    /// PBKDF2 rounds used to stretch stream keys.
    pub kdf_iterations: u32,
    /// Password used when a stream URL has no `k=` segment.
    pub fallback_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT,
            max_workers: DEFAULT_MAX_WORKERS,
            cipher: CipherKind::default(),
            kdf_iterations: DEFAULT_ITERATIONS,
            fallback_key: FALLBACK_PASSWORD.to_string(),
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value: raw })
}

impl ServerConfig {
    /// Defaults overridden by `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("Ignoring unreadable .env file: {}", e),
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `MEDIA_*` name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ip) = lookup(ENV_IP) {
            config.ip = ip.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_PORT) {
            config.port = parse_var(ENV_PORT, raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_WORKERS) {
            config.max_workers = parse_var(ENV_MAX_WORKERS, raw)?;
        }
        if let Some(raw) = lookup(ENV_CIPHER) {
            config.cipher = parse_var(ENV_CIPHER, raw)?;
        }
        if let Some(raw) = lookup(ENV_KDF_ITERATIONS) {
            config.kdf_iterations = parse_var(ENV_KDF_ITERATIONS, raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip.is_empty() {
            return Err(ConfigError::EmptyIp);
        }
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.kdf_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        Ok(())
    }

    /// Key under which the default server is registered.
    pub fn endpoint_url(&self) -> String {
        endpoint_url(&self.ip, self.port)
    }
}

/// `http://{ip}:{port}/`
pub fn endpoint_url(ip: &str, port: u16) -> String {
    format!("http://{}:{}/", ip, port)
}
