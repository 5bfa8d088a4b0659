//! # Request Correlation
//!
//! Many callers share one connection. Each call gets a fresh 128-bit
//! [`RequestId`], parks a single-use waiter in the pending table under that id,
//! writes `<id><command>` to the stream and suspends until the connection
//! reader hands back the payload tagged with the same id.
//!
//! ## Table discipline
//!
//! The pending table sits behind a mutex shared by every caller (insert) and
//! the connection reader (remove). An entry leaves the table exactly once:
//! - the reader resolves it with the matching payload,
//! - the connection is torn down and every entry is failed,
//! - the caller gives up (timeout or cancellation) and removes it itself.
//!
//! Resolution happens while the lock is held, so a caller whose deadline
//! expires can tell unambiguously whether its reply already landed.
//!
//! Once torn down the table stays closed: new calls fail immediately instead
//! of registering a waiter nobody will ever resolve.

use crate::error::{Error, Result};
use crate::protocol::REQUEST_ID_LEN;
use log::{debug, error, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use uuid::Uuid;

/// How many ids registration draws before giving up on a collision.
pub const MAX_ID_ATTEMPTS: usize = 8;

/// Write half of the connection, shared by all callers.
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Waiter = oneshot::Sender<Result<Vec<u8>>>;

/// Identifier correlating one outbound command with its inbound reply.
///
/// Travels as 16 raw bytes in front of both frames; displayed as 32 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        RequestId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        RequestId(*id.as_bytes())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).simple())
    }
}

/// Source of request identifiers.
///
/// Ids only need to be unique among the requests in flight on one
/// connection; the correlator re-draws on collision.
pub trait IdGenerator: Send + Sync {
    /// Produce the next candidate id.
    ///
    /// # Errors
    /// * `Error::Correlation` if no id could be produced
    fn next_id(&self) -> Result<RequestId>;
}

/// Random version 4 UUIDs drawn from the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> Result<RequestId> {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| Error::correlation(format!("failed to generate request id: {}", e)))?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid().into())
    }
}

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<RequestId, Waiter>,
    /// Set once on teardown, with the reason handed to later callers.
    closed: Option<String>,
}

/// Matches replies to the callers that are waiting for them.
pub struct Correlator {
    table: Mutex<PendingTable>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    ids: Box<dyn IdGenerator>,
    request_timeout: Option<Duration>,
    unmatched: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Correlator {
    /// Create a correlator writing to `writer`.
    ///
    /// The returned receiver flips to `true` when the connection is torn down;
    /// the connection reader watches it to know when to stop.
    pub(crate) fn new(
        writer: BoxedWriter,
        ids: Box<dyn IdGenerator>,
        request_timeout: Option<Duration>,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let correlator = Correlator {
            table: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(writer),
            ids,
            request_timeout,
            unmatched: AtomicU64::new(0),
            shutdown,
        };
        (correlator, shutdown_rx)
    }

    /// Send an encoded command and wait for its reply payload.
    ///
    /// # Errors
    /// * `Error::ConnectionClosed` if the connection is (or becomes) torn down
    /// * `Error::Io` if writing the frame fails; this also tears the
    ///   connection down for every other pending caller
    /// * `Error::Correlation` if no request id could be allocated
    /// * `Error::Timeout` if a request timeout is configured and expires
    pub async fn send(&self, command: &[u8]) -> Result<Vec<u8>> {
        let (id, rx) = self.register()?;
        let mut guard = PendingGuard {
            correlator: self,
            id,
            armed: true,
        };

        let frame = encode_frame(&id, command);
        if let Err(err) = self.write_frame(&frame).await {
            guard.armed = false;
            self.take(&id);
            error!("Failed to write request {}: {}", id, err);
            self.teardown(&format!("write failed: {}", err));
            return Err(Error::io(err));
        }
        debug!("Sent request {} ({} bytes)", id, frame.len());

        let result = self.await_reply(id, rx).await;
        guard.armed = false;
        result
    }

    /// Hand `payload` to the caller waiting on `id`.
    ///
    /// Returns false when nobody is waiting for `id`; the payload is dropped
    /// and counted in [`Correlator::unmatched_frames`].
    pub fn resolve(&self, id: RequestId, payload: Vec<u8>) -> bool {
        let len = payload.len();
        let mut table = self.table();
        if let Some(waiter) = table.waiters.remove(&id) {
            if waiter.send(Ok(payload)).is_err() {
                debug!("Caller for request {} stopped waiting", id);
            }
            return true;
        }
        drop(table);

        let unmatched = self.unmatched.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Dropping {} byte reply for unknown request {} ({} unmatched so far)",
            len, id, unmatched
        );
        false
    }

    /// Close the table and fail every pending waiter with `reason`.
    ///
    /// Idempotent; the first reason sticks. Returns how many waiters were
    /// released by this call.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut table = self.table();
        if table.closed.is_none() {
            table.closed = Some(reason.to_string());
        }
        let waiters: Vec<(RequestId, Waiter)> = table.waiters.drain().collect();
        drop(table);

        let released = waiters.len();
        for (id, waiter) in waiters {
            debug!("Failing request {}: {}", id, reason);
            let _ = waiter.send(Err(Error::connection_closed(reason)));
        }
        released
    }

    /// Tear the connection down: fail every waiter and stop the reader.
    pub fn teardown(&self, reason: &str) {
        self.fail_all(reason);
        self.shutdown.send_replace(true);
    }

    /// Shut down the write half of the stream.
    pub(crate) async fn shutdown_writer(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.table().waiters.len()
    }

    /// Number of inbound frames that matched no pending call.
    pub fn unmatched_frames(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed.is_some()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        // The table is never left half-updated, so a poisoned lock is still usable.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> Result<(RequestId, oneshot::Receiver<Result<Vec<u8>>>)> {
        let mut table = self.table();
        if let Some(reason) = &table.closed {
            return Err(Error::connection_closed(reason.clone()));
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.next_id()?;
            if table.waiters.contains_key(&id) {
                warn!("Request id {} is already in flight, drawing another", id);
                continue;
            }
            let (tx, rx) = oneshot::channel();
            table.waiters.insert(id, tx);
            return Ok((id, rx));
        }

        Err(Error::correlation(format!(
            "no free request id after {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    fn take(&self, id: &RequestId) -> Option<Waiter> {
        self.table().waiters.remove(id)
    }

    async fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        let mut progress = WriteProgress {
            correlator: self,
            written: 0,
            len: frame.len(),
        };
        while progress.written < frame.len() {
            let written = match writer.write(&frame[progress.written..]).await {
                Ok(0) => Err(std::io::ErrorKind::WriteZero.into()),
                other => other,
            };
            match written {
                Ok(n) => progress.written += n,
                Err(e) => {
                    // The caller tears down with the real cause.
                    progress.written = progress.len;
                    return Err(e);
                }
            }
        }
        writer.flush().await
    }

    async fn await_reply(
        &self,
        id: RequestId,
        mut rx: oneshot::Receiver<Result<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let delivered = match self.request_timeout {
            None => rx.await.ok(),
            Some(limit) => match timeout(limit, &mut rx).await {
                Ok(outcome) => outcome.ok(),
                Err(_) => return self.expire(id, limit, rx),
            },
        };

        delivered.unwrap_or_else(|| Err(Error::connection_closed("response waiter dropped")))
    }

    /// Settle a call whose deadline passed.
    fn expire(
        &self,
        id: RequestId,
        limit: Duration,
        mut rx: oneshot::Receiver<Result<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        if self.take(&id).is_some() {
            warn!("Request {} not answered within {:?}", id, limit);
            return Err(Error::timeout(format!(
                "request {} not answered within {:?}",
                id, limit
            )));
        }
        // Entry already gone: the reply (or teardown error) was sent under
        // the table lock before we could take it.
        rx.try_recv()
            .unwrap_or_else(|_| Err(Error::connection_closed("response waiter dropped")))
    }
}

/// Removes the caller's entry if the call future is dropped before it
/// completes.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: RequestId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.correlator.take(&self.id).is_some() {
            debug!("Request {} abandoned by caller", self.id);
        }
    }
}

/// Tracks how much of a frame reached the writer.
///
/// Dropped mid-frame means the caller was cancelled with part of its frame
/// already on the stream. Nothing written after that could be framed
/// correctly, so the connection is torn down.
struct WriteProgress<'a> {
    correlator: &'a Correlator,
    written: usize,
    len: usize,
}

impl Drop for WriteProgress<'_> {
    fn drop(&mut self) {
        if self.written > 0 && self.written < self.len {
            error!(
                "Request cancelled after writing {} of {} bytes",
                self.written, self.len
            );
            self.correlator.teardown("request cancelled mid-write");
        }
    }
}

/// `<16 raw id bytes><encoded command>`
pub fn encode_frame(id: &RequestId, command: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_ID_LEN + command.len());
    frame.extend_from_slice(id.as_bytes());
    frame.extend_from_slice(command);
    frame
}
