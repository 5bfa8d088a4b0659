//! # Connection Reader
//!
//! A single task owns the read half of the stream for the whole life of the
//! connection. It pulls identifier-prefixed frames off the stream and passes
//! each payload to the [`Correlator`], which wakes the matching caller.
//!
//! The loop ends when the server closes the stream, a read fails, or the
//! connection is shut down locally. Whatever the cause, every call still
//! waiting is released with a connection-closed error on the way out.

use crate::correlator::{Correlator, RequestId};
use crate::protocol::{Framing, REQUEST_ID_LEN};
use log::{debug, error, info};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Reads inbound frames in the configured [`Framing`].
pub struct FrameReader<R> {
    reader: R,
    framing: Framing,
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `read_buffer_size` bounds a whole frame in [`Framing::Delivery`] and is
    /// raised to fit at least the id; `max_frame_size` bounds the payload in
    /// [`Framing::LengthPrefixed`].
    pub fn new(reader: R, framing: Framing, read_buffer_size: usize, max_frame_size: usize) -> Self {
        FrameReader {
            reader,
            framing,
            buf: vec![0u8; read_buffer_size.max(REQUEST_ID_LEN + 1)],
            max_frame_size,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames.
    pub async fn read_frame(&mut self) -> io::Result<Option<(RequestId, Vec<u8>)>> {
        match self.framing {
            Framing::Delivery => self.read_delivery().await,
            Framing::LengthPrefixed => self.read_length_prefixed().await,
        }
    }

    async fn read_delivery(&mut self) -> io::Result<Option<(RequestId, Vec<u8>)>> {
        let mut n = self.reader.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if n < REQUEST_ID_LEN {
            // The id itself is fixed width, so finish it; the payload is
            // whatever this delivery carried, which is nothing.
            self.reader.read_exact(&mut self.buf[n..REQUEST_ID_LEN]).await?;
            n = REQUEST_ID_LEN;
        }

        let id = request_id(&self.buf[..REQUEST_ID_LEN]);
        Ok(Some((id, self.buf[REQUEST_ID_LEN..n].to_vec())))
    }

    async fn read_length_prefixed(&mut self) -> io::Result<Option<(RequestId, Vec<u8>)>> {
        let mut id = [0u8; REQUEST_ID_LEN];
        match self.reader.read_exact(&mut id).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = self.reader.read_u32().await? as usize;
        if len > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    len, self.max_frame_size
                ),
            ));
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some((RequestId::from_bytes(id), payload)))
    }
}

fn request_id(bytes: &[u8]) -> RequestId {
    let mut id = [0u8; REQUEST_ID_LEN];
    id.copy_from_slice(bytes);
    RequestId::from_bytes(id)
}

/// Spawn the reader task for a connection.
pub(crate) fn spawn_reader<R>(
    frames: FrameReader<R>,
    correlator: Arc<Correlator>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(read_loop(frames, correlator, shutdown))
}

async fn read_loop<R>(
    mut frames: FrameReader<R>,
    correlator: Arc<Correlator>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Connection reader asked to stop");
                    break "connection shut down".to_string();
                }
            }
            frame = frames.read_frame() => match frame {
                Ok(Some((id, payload))) => {
                    debug!("Received reply for request {} ({} bytes)", id, payload.len());
                    correlator.resolve(id, payload);
                }
                Ok(None) => {
                    info!("Server closed connection");
                    break "server closed connection".to_string();
                }
                Err(err) => {
                    error!("Connection read failed: {}", err);
                    break format!("read failed: {}", err);
                }
            },
        }
    };

    let released = correlator.fail_all(&reason);
    if released > 0 {
        info!("Released {} pending request(s): {}", released, reason);
    }
}
