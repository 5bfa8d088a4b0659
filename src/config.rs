//! # Client Configuration
//!
//! Only host and port are required to reach a server. The remaining settings
//! harden the connection and default to the behaviour existing servers expect.
//!
//! Settings are read from an optional TOML file and can be overridden by
//! environment variables prefixed with `MEMSERVER_` (for example
//! `MEMSERVER_PORT=5555` or `MEMSERVER_REQUEST_TIMEOUT_MS=2000`).
//!
//! ## Example Configuration File (client.toml)
//! ```toml
//! host = "127.0.0.1"
//! port = 4444
//! request_timeout_ms = 5000
//! framing = "length_prefixed"
//! read_buffer_size = 1024
//! max_frame_size = 16777216
//! nodelay = true
//! ```

use crate::error::Result;
use crate::protocol::Framing;
use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of the environment variables that override file settings.
pub const ENV_PREFIX: &str = "MEMSERVER";

/// Connection settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP address
    pub host: String,

    /// Server TCP port
    pub port: u16,

    /// Upper bound on how long a call waits for its reply. Unset means wait
    /// until the reply arrives or the connection fails.
    pub request_timeout_ms: Option<u64>,

    /// How inbound frames are delimited
    pub framing: Framing,

    /// Size of the single read that makes up one frame under
    /// [`Framing::Delivery`]
    pub read_buffer_size: usize,

    /// Largest payload accepted under [`Framing::LengthPrefixed`]
    pub max_frame_size: usize,

    /// Disable Nagle's algorithm on the socket
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4444,
            request_timeout_ms: None,
            framing: Framing::Delivery,
            read_buffer_size: 1024,
            max_frame_size: 16 * 1024 * 1024,
            nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Default settings pointed at `host:port`.
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Load settings from a TOML file, then apply `MEMSERVER_*` overrides.
    ///
    /// # Errors
    /// * `Error::Config` if the file is missing or a value has the wrong type
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Defaults with `MEMSERVER_*` overrides applied.
    pub fn from_env() -> Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// `host:port`, as handed to the TCP dialer.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}
