//! Error types for memserver client operations

use thiserror::Error;

/// Result type alias for memserver client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a client call can fail.
///
/// Errors fall into three classes:
/// - connection errors (`Connection`, `ConnectionClosed`, `Io`) are fatal to the
///   connection and are delivered to every caller still waiting on it;
/// - validation errors (`InvalidParameter`) are raised before anything is
///   written to the wire;
/// - correlation errors (`Correlation`, `Timeout`) only affect the call that
///   raised them.
#[derive(Error, Debug)]
pub enum Error {
    /// Dialing the server failed
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The connection was torn down while the call was pending, or before it
    /// was issued
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    /// Read or write failure on the underlying stream
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Arguments rejected locally
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// No usable request identifier could be produced
    #[error("Correlation error: {message}")]
    Correlation { message: String },

    /// The reply did not arrive within the configured bound
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: config::ConfigError,
    },
}

impl Error {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection { message: msg.into() }
    }

    /// Create a connection-closed error
    pub fn connection_closed<S: Into<String>>(msg: S) -> Self {
        Error::ConnectionClosed { message: msg.into() }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Error::InvalidParameter { message: msg.into() }
    }

    /// Create a correlation error
    pub fn correlation<S: Into<String>>(msg: S) -> Self {
        Error::Correlation { message: msg.into() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout { message: msg.into() }
    }

    /// Create an I/O error
    pub fn io(err: std::io::Error) -> Self {
        Error::Io { source: err }
    }

    /// True for errors that mean the connection is unusable and must be
    /// re-established by the caller.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::ConnectionClosed { .. } | Error::Io { .. }
        )
    }
}
