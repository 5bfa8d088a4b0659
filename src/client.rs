//! Asynchronous memserver client implementation

use crate::config::ClientConfig;
use crate::connection::{spawn_reader, FrameReader};
use crate::correlator::{Correlator, IdGenerator, RandomIdGenerator};
use crate::error::{Error, Result};
use crate::protocol::{Command, SetOption};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Asynchronous memserver client multiplexing every call over one connection
///
/// `Client` is cheap to clone; clones share the same connection, so any
/// number of tasks can issue commands concurrently. Replies are matched to
/// callers by request id, so a slow command never holds up a fast one and
/// completion order may differ from submission order.
///
/// Every command returns the raw reply payload. No reply decoding is done.
///
/// # Example
///
/// ```rust,no_run
/// use memserver_client::{Client, Result};
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let client = Client::connect("localhost", 4444).await?;
///
///     client.set("mykey", "myvalue").await?;
///     let value = client.get("mykey").await?;
///     assert_eq!(value.as_deref(), Some(&b"myvalue"[..]));
///
///     client.disconnect().await
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    correlator: Arc<Correlator>,
    reader: Mutex<Option<JoinHandle<()>>>,
    addr: String,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Last handle gone: stop the reader so the socket is released.
        self.correlator.teardown("client dropped");
    }
}

impl Client {
    /// Connect to a memserver instance with default settings
    ///
    /// # Arguments
    ///
    /// * `host` - Server host name or IP address
    /// * `port` - Server TCP port
    ///
    /// # Errors
    ///
    /// * `Error::Connection` if the server cannot be reached
    pub async fn connect<S: Into<String>>(host: S, port: u16) -> Result<Self> {
        Self::connect_with_config(&ClientConfig::new(host, port)).await
    }

    /// Connect to a memserver instance with custom settings
    pub async fn connect_with_config(config: &ClientConfig) -> Result<Self> {
        let addr = config.addr();
        info!("Connecting to memserver at {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;

        if config.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| Error::connection(format!("Failed to set TCP_NODELAY: {}", e)))?;
        }

        let client = Self::from_stream(stream, addr.clone(), config);
        info!("Connected to memserver at {}", addr);
        Ok(client)
    }

    /// Run the protocol over an already established stream.
    ///
    /// Must be called from within a Tokio runtime; the connection reader is
    /// spawned onto it.
    pub fn from_stream<S>(stream: S, addr: String, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_id_generator(stream, addr, config, Box::new(RandomIdGenerator))
    }

    /// Like [`Client::from_stream`], drawing request ids from `ids`.
    pub fn with_id_generator<S>(
        stream: S,
        addr: String,
        config: &ClientConfig,
        ids: Box<dyn IdGenerator>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (correlator, shutdown) =
            Correlator::new(Box::new(write_half), ids, config.request_timeout());
        let correlator = Arc::new(correlator);

        let frames = FrameReader::new(
            read_half,
            config.framing,
            config.read_buffer_size,
            config.max_frame_size,
        );
        let reader = spawn_reader(frames, Arc::clone(&correlator), shutdown);

        Client {
            inner: Arc::new(ClientInner {
                correlator,
                reader: Mutex::new(Some(reader)),
                addr,
            }),
        }
    }

    /// Close the connection.
    ///
    /// Calls still waiting for a reply fail with `Error::ConnectionClosed`, as
    /// does every later call on this client or its clones. Disconnecting twice
    /// is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            debug!("Connection to {} already disconnected", self.inner.addr);
            return Ok(());
        };

        info!("Disconnecting from {}", self.inner.addr);
        let shutdown = self.inner.correlator.shutdown_writer().await;
        self.inner.correlator.teardown("client disconnected");

        if let Err(e) = reader.await {
            warn!("Connection reader for {} ended abnormally: {}", self.inner.addr, e);
        }

        shutdown.map_err(Error::io)
    }

    /// Get the value stored at `key`
    ///
    /// # Returns
    ///
    /// `None` if the server replied with an empty payload (no such key)
    pub async fn get<S: AsRef<str>>(&self, key: S) -> Result<Option<Vec<u8>>> {
        let payload = self
            .execute(Command::Get {
                key: key.as_ref().to_string(),
            })
            .await?;
        Ok(if payload.is_empty() { None } else { Some(payload) })
    }

    /// Set `key` to hold `value`
    pub async fn set<K: AsRef<str>, V: AsRef<str>>(&self, key: K, value: V) -> Result<Vec<u8>> {
        self.set_with_options(key, value, Vec::new()).await
    }

    /// Set `key` to hold `value`, followed by modifier clauses such as
    /// expiry or conditional-set flags
    pub async fn set_with_options<K: AsRef<str>, V: AsRef<str>>(
        &self,
        key: K,
        value: V,
        options: Vec<SetOption>,
    ) -> Result<Vec<u8>> {
        self.execute(Command::Set {
            key: key.as_ref().to_string(),
            value: value.as_ref().to_string(),
            options,
        })
        .await
    }

    /// Delete one or more keys
    ///
    /// # Errors
    ///
    /// * `Error::InvalidParameter` if `keys` is empty
    pub async fn del<I>(&self, keys: I) -> Result<Vec<u8>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.execute(Command::Del { keys: owned(keys) }).await
    }

    /// Count how many of `keys` exist
    ///
    /// # Errors
    ///
    /// * `Error::InvalidParameter` if `keys` is empty
    pub async fn exists<I>(&self, keys: I) -> Result<Vec<u8>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.execute(Command::Exists { keys: owned(keys) }).await
    }

    pub async fn append<K: AsRef<str>, V: AsRef<str>>(&self, key: K, value: V) -> Result<Vec<u8>> {
        self.execute(Command::Append {
            key: key.as_ref().to_string(),
            value: value.as_ref().to_string(),
        })
        .await
    }

    /// Set several keys at once from a flat `key, value, key, value, ...` list
    ///
    /// # Errors
    ///
    /// * `Error::InvalidParameter` if the list is empty or has an odd length;
    ///   nothing is sent in that case
    pub async fn mset<I>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.execute(Command::MultiSet { args: owned(args) }).await
    }

    /// Set hash fields from a flat `field, value, field, value, ...` list
    ///
    /// # Errors
    ///
    /// * `Error::InvalidParameter` if `key` is empty, or the list is empty or
    ///   has an odd length
    pub async fn hset<K, I>(&self, key: K, fields: I) -> Result<Vec<u8>>
    where
        K: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.execute(Command::HashSet {
            key: key.as_ref().to_string(),
            fields: owned(fields),
        })
        .await
    }

    /// Set hash fields from `(field, value)` pairs, e.g. a `HashMap`
    pub async fn hset_map<K, I, F, V>(&self, key: K, pairs: I) -> Result<Vec<u8>>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (F, V)>,
        F: AsRef<str>,
        V: AsRef<str>,
    {
        let fields = pairs
            .into_iter()
            .flat_map(|(f, v)| [f.as_ref().to_string(), v.as_ref().to_string()])
            .collect();
        self.execute(Command::HashSet {
            key: key.as_ref().to_string(),
            fields,
        })
        .await
    }

    /// # Errors
    ///
    /// * `Error::InvalidParameter` if `key` or `field` is empty
    pub async fn hget<K: AsRef<str>, F: AsRef<str>>(&self, key: K, field: F) -> Result<Vec<u8>> {
        self.execute(Command::HashGet {
            key: key.as_ref().to_string(),
            field: field.as_ref().to_string(),
        })
        .await
    }

    /// # Errors
    ///
    /// * `Error::InvalidParameter` if `key` is empty or no fields are given
    pub async fn hgetall<K, I>(&self, key: K, fields: I) -> Result<Vec<u8>>
    where
        K: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.execute(Command::HashGetAll {
            key: key.as_ref().to_string(),
            fields: owned(fields),
        })
        .await
    }

    /// # Errors
    ///
    /// * `Error::InvalidParameter` if `key` is empty or no fields are given
    pub async fn hdel<K, I>(&self, key: K, fields: I) -> Result<Vec<u8>>
    where
        K: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.execute(Command::HashDel {
            key: key.as_ref().to_string(),
            fields: owned(fields),
        })
        .await
    }

    /// Validate and send any [`Command`], returning the raw reply payload
    pub async fn execute(&self, command: Command) -> Result<Vec<u8>> {
        command.validate()?;
        debug!("Sending {} command", command.verb());
        self.inner.correlator.send(&command.encode()).await
    }

    /// Number of calls currently waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Number of replies that matched no pending call and were dropped
    pub fn unmatched_frames(&self) -> u64 {
        self.inner.correlator.unmatched_frames()
    }

    /// True once the connection has been torn down for any reason
    pub fn is_closed(&self) -> bool {
        self.inner.correlator.is_closed()
    }

    /// Get the server address this client is connected to
    pub fn server_addr(&self) -> &str {
        &self.inner.addr
    }
}

fn owned<I>(items: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}
