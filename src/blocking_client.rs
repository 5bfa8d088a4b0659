//! Blocking facade over [`Client`]
//!
//! Owns a small Tokio runtime that keeps the connection reader running in the
//! background, so plain threads can share one connection. Each call blocks
//! the calling thread until its own reply arrives.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{Command, SetOption};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Thread-blocking memserver client
///
/// Clones share the connection and the runtime.
///
/// # Example
///
/// ```rust,no_run
/// use memserver_client::BlockingClient;
///
/// let client = BlockingClient::connect("localhost", 4444)?;
/// client.set("mykey", "myvalue")?;
/// let value = client.get("mykey")?;
/// println!("Got = {:?}", value);
/// # Ok::<(), memserver_client::Error>(())
/// ```
#[derive(Clone)]
pub struct BlockingClient {
    // Dropped before the runtime, so the reader is told to stop first.
    inner: Client,
    rt: Arc<Runtime>,
}

impl BlockingClient {
    pub fn connect<S: Into<String>>(host: S, port: u16) -> Result<Self> {
        Self::connect_with_config(&ClientConfig::new(host, port))
    }

    pub fn connect_with_config(config: &ClientConfig) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("memserver-client")
            .enable_all()
            .build()?;

        let inner = rt.block_on(Client::connect_with_config(config))?;
        Ok(BlockingClient {
            inner,
            rt: Arc::new(rt),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.rt.block_on(self.inner.disconnect())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.rt.block_on(self.inner.get(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.set(key, value))
    }

    pub fn set_with_options(&self, key: &str, value: &str, options: Vec<SetOption>) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.set_with_options(key, value, options))
    }

    pub fn del(&self, keys: &[&str]) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.del(keys))
    }

    pub fn exists(&self, keys: &[&str]) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.exists(keys))
    }

    pub fn append(&self, key: &str, value: &str) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.append(key, value))
    }

    pub fn mset(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.mset(args))
    }

    pub fn hset(&self, key: &str, fields: &[&str]) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.hset(key, fields))
    }

    /// Set hash fields from `(field, value)` pairs, e.g. a `HashMap`
    pub fn hset_map<I, F, V>(&self, key: &str, pairs: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = (F, V)>,
        F: AsRef<str>,
        V: AsRef<str>,
    {
        self.rt.block_on(self.inner.hset_map(key, pairs))
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.hget(key, field))
    }

    pub fn hgetall(&self, key: &str, fields: &[&str]) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.hgetall(key, fields))
    }

    pub fn hdel(&self, key: &str, fields: &[&str]) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.hdel(key, fields))
    }

    pub fn execute(&self, command: Command) -> Result<Vec<u8>> {
        self.rt.block_on(self.inner.execute(command))
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending_requests()
    }

    pub fn unmatched_frames(&self) -> u64 {
        self.inner.unmatched_frames()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn server_addr(&self) -> &str {
        self.inner.server_addr()
    }
}
