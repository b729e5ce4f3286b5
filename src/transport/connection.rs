//! Connection handle and per-connection tasks
//!
//! Every live TCP peer, on either side of the protocol, is driven by:
//! - a receive loop that pulls one frame per socket read through [`FrameReader`]
//! - a writer task that owns the write half and drains an outbound channel
//! - optionally a keep-alive task that queues a PINGREQ every interval
//!
//! All of them stop when the connection's [`CancellationToken`] is cancelled.
//! [`ConnectionHandle`] is the cheap, cloneable face of the connection: it
//! queues encoded frames and closes the connection.
//!
//! The outbound queue is bounded. A peer that stops reading fills it, and the
//! next send fails instead of buffering without limit.

use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::transport::packet::{Packet, PacketKind};
use crate::utils::{Error, Result};

pub type ConnectionId = Uuid;

/// How long a closing writer may spend flushing what is still queued.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity plus outbound side of one connection.
///
/// Equality and hashing use the connection id only.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    sender: Sender<Bytes>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr, sender: Sender<Bytes>, closed: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            sender,
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues an already encoded frame for the writer task.
    ///
    /// Fails once the handle is closed, the writer has gone away, or the
    /// outbound queue is full. Never waits.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        self.sender.try_send(frame).map_err(|error| match error {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send(packet.encode()?)
    }

    /// Closes the connection. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.closed
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Reads frames with one fixed-size read per frame.
///
/// The wire format has no outer length header, so a read that returns several
/// coalesced frames, or part of one, is decoded as if it were exactly one frame.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, buffer_size: usize) -> Self {
        Self {
            inner,
            buf: vec![0; buffer_size.max(1)],
        }
    }

    /// Performs one read. `Ok(None)` means the peer closed the stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }

    /// Waits for the next frame that decodes, returning it with its raw bytes.
    ///
    /// Undecodable frames are logged and skipped. Returns `None` when the peer
    /// closed, the read failed, or `closed` was cancelled.
    pub async fn next_packet(
        &mut self,
        closed: &CancellationToken,
        peer: SocketAddr,
    ) -> Option<(Packet, Bytes)> {
        loop {
            let read = tokio::select! {
                biased;
                _ = closed.cancelled() => return None,
                read = self.next_frame() => read,
            };

            match read {
                Ok(Some(frame)) => match Packet::decode(&frame) {
                    Ok(packet) => {
                        trace!(%peer, kind = %packet.kind(), len = frame.len(), "frame received");
                        return Some((packet, frame));
                    }
                    Err(error) => {
                        warn!(%peer, %error, len = frame.len(), "dropping undecodable frame");
                    }
                },
                Ok(None) => {
                    debug!(%peer, "peer closed the stream");
                    return None;
                }
                Err(error) => {
                    warn!(%peer, %error, "read failed");
                    return None;
                }
            }
        }
    }
}

/// Spawns the task that writes queued frames to `writer`.
///
/// On close, frames queued before the close are still written, then the write
/// half is shut down; both within [`FLUSH_TIMEOUT`]. A close that lands in the
/// middle of a write drops the rest of the queue. A write failure closes the
/// connection.
pub fn spawn_writer<W>(
    writer: W,
    mut outbound: Receiver<Bytes>,
    closed: CancellationToken,
    peer: SocketAddr,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = writer;
        let mut interrupted = false;
        loop {
            let frame = tokio::select! {
                biased;
                _ = closed.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            // A write that can complete wins; only a blocked one is cut short.
            tokio::select! {
                biased;
                written = writer.write_all(&frame) => {
                    if let Err(error) = written {
                        warn!(%peer, %error, "write failed, closing connection");
                        closed.cancel();
                        return;
                    }
                }
                _ = closed.cancelled() => {
                    interrupted = true;
                    break;
                }
            }
        }

        outbound.close();
        let flush = async {
            if !interrupted {
                while let Ok(frame) = outbound.try_recv() {
                    writer.write_all(&frame).await?;
                }
            }
            writer.shutdown().await?;
            Ok::<_, io::Error>(())
        };
        match time::timeout(FLUSH_TIMEOUT, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(%peer, %error, "dropping queued frames after close"),
            Err(_) => debug!(%peer, "peer is not reading, dropping queued frames"),
        }
        closed.cancel();
        trace!(%peer, "writer stopped");
    })
}

/// Spawns the keep-alive emitter: one PINGREQ per `period`, the first one a
/// full period after start rather than right away, so it never shares a read
/// with the CONNECT exchange. A missing PINGRESP is never acted upon.
pub fn spawn_keep_alive(handle: ConnectionHandle, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ping = Packet::new(PacketKind::PingReq);

        loop {
            tokio::select! {
                _ = handle.closed() => break,
                _ = ticker.tick() => {
                    if let Err(error) = handle.send_packet(&ping) {
                        debug!(peer = %handle.peer(), %error, "keep-alive stopped");
                        break;
                    }
                    trace!(peer = %handle.peer(), "PINGREQ queued");
                }
            }
        }
    })
}

/// Per-connection buffer sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Bytes per socket read; one read is one frame.
    pub read_buffer_size: usize,
    /// Frames that may wait for the writer before sends start failing.
    pub queue_capacity: usize,
}

/// A started connection: its handle, its receive side and its writer task.
pub struct Connection<R = OwnedReadHalf> {
    pub handle: ConnectionHandle,
    pub reader: FrameReader<R>,
    pub writer: JoinHandle<()>,
}

impl Connection<OwnedReadHalf> {
    /// Splits `stream` and starts its writer task.
    pub fn open(stream: TcpStream, closed: CancellationToken, limits: Limits) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_parts(read_half, write_half, peer, closed, limits))
    }
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn from_parts<W>(
        read_half: R,
        write_half: W,
        peer: SocketAddr,
        closed: CancellationToken,
        limits: Limits,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, outbound) = mpsc::channel(limits.queue_capacity.max(1));
        let writer = spawn_writer(write_half, outbound, closed.clone(), peer);
        Self {
            handle: ConnectionHandle::new(peer, sender, closed),
            reader: FrameReader::new(read_half, limits.read_buffer_size),
            writer,
        }
    }
}
