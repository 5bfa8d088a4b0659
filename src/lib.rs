//! memserver client library
//!
//! A driver for the memserver key-value protocol that lets any number of
//! concurrent callers share one persistent connection.
//!
//! # How it works
//!
//! - **Encoder** ([`protocol`]): commands become `$<len>\n<arg>\n` segments.
//! - **Correlator** ([`correlator`]): every call gets a random 128-bit request
//!   id, parks a single-use waiter under it and writes `<id><command>` in one
//!   serialized write.
//! - **Connection reader** ([`connection`]): one background task reads
//!   `<id><payload>` frames and wakes the caller that owns the id.
//! - **Command API** ([`Client`], [`BlockingClient`]): typed GET, SET, DEL,
//!   EXISTS, APPEND, MSET, HSET, HGET, HGETALL and HDEL builders.
//!
//! Replies are matched purely by id, so they may complete in any order. If the
//! connection fails, every pending call is released with an error; nothing is
//! retried or reconnected automatically.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use memserver_client::{Client, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::connect("localhost", 4444).await?;
//!
//!     // Clones share the connection
//!     let other = client.clone();
//!     let (a, b) = tokio::join!(client.set("a", "1"), other.set("b", "2"));
//!     a?;
//!     b?;
//!
//!     let missing = client.get("never-set").await?;
//!     assert!(missing.is_none());
//!
//!     client.disconnect().await
//! }
//! ```

pub mod blocking_client;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod protocol;

// Re-export main types
pub use blocking_client::BlockingClient;
pub use client::Client;
pub use config::ClientConfig;
pub use correlator::{IdGenerator, RandomIdGenerator, RequestId};
pub use error::{Error, Result};
pub use protocol::{Command, Framing, SetOption};
