//! Broker engine
//!
//! Owns the listening socket and runs:
//! - one acceptor task, which spawns a connection task per accepted peer
//! - per connection, a receive loop that decodes one packet per read and
//!   dispatches it, plus the writer task started by [`Connection::open`]
//!
//! Connections are served without a CONNECT handshake; CONNECT is simply
//! answered with CONNACK. A connection ends on DISCONNECT, end of stream, a read
//! error or a failed reply, and always leaves through
//! [`Registry::remove_connection`](crate::broker::registry::Registry::remove_connection),
//! which tolerates being reached twice.
//!
//! Shutdown cancels the broker token. Every connection token is a child of it,
//! so cancelling unblocks the accept call and every pending read at once. The
//! acceptor then waits up to `shutdown_timeout` for connection tasks and aborts
//! the stragglers.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::registry::SharedRegistry;
use crate::config::{ServerSettings, Settings};
use crate::transport::{Connection, ConnectionHandle, Limits, Packet, PacketKind};
use crate::utils::{Error, Result};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Broker {
    local_addr: SocketAddr,
    registry: SharedRegistry,
    shutdown: CancellationToken,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Broker {
    /// Binds the listener and starts accepting connections.
    ///
    /// Bind failures are returned as [`Error::Bind`]; the broker never starts
    /// serving in that case.
    pub async fn start(settings: &Settings) -> Result<Self> {
        let listener = bind(&settings.server).await?;
        let local_addr = listener.local_addr()?;
        let limits = settings.broker.limits();
        let shutdown_timeout = Duration::from_millis(settings.broker.shutdown_timeout_ms);

        let registry = SharedRegistry::new();
        let shutdown = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            shutdown.clone(),
            limits,
            shutdown_timeout,
        ));

        info!(%local_addr, backlog = settings.server.backlog, "broker listening");

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            acceptor: Mutex::new(Some(acceptor)),
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stops accepting, closes every connection and waits for the tasks to
    /// finish. Tasks that outlive the timeout are abandoned. Calling this again
    /// is a no-op.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(acceptor) = acceptor else {
            return;
        };

        info!(addr = %self.local_addr, "broker stopping");
        let abort = acceptor.abort_handle();
        match time::timeout(self.shutdown_timeout * 2, acceptor).await {
            Ok(Ok(())) => info!(addr = %self.local_addr, "broker stopped"),
            Ok(Err(error)) => error!(%error, "acceptor task failed"),
            Err(_) => {
                warn!("acceptor did not stop in time, abandoning it");
                abort.abort();
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bind(server: &ServerSettings) -> Result<TcpListener> {
    let host = if server.host.is_empty() {
        "0.0.0.0"
    } else {
        server.host.as_str()
    };
    let addr = format!("{host}:{}", server.port);
    let bind_error = |source| Error::Bind {
        addr: addr.clone(),
        source,
    };

    let resolved = lookup_host(&addr)
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| Error::Resolve(addr.clone()))?;

    let socket = if resolved.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(resolved).map_err(bind_error)?;
    socket.listen(server.backlog).map_err(bind_error)
}

async fn accept_loop(
    listener: TcpListener,
    registry: SharedRegistry,
    shutdown: CancellationToken,
    limits: Limits,
    shutdown_timeout: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(joined);
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "connection accepted");
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        registry.clone(),
                        shutdown.child_token(),
                        limits,
                    ));
                }
                Err(error) => {
                    error!(%error, "accept failed");
                    time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    debug!(open = connections.len(), "listener closed, draining connections");

    let drained = time::timeout(shutdown_timeout, async {
        while let Some(joined) = connections.join_next().await {
            log_connection_exit(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(abandoned = connections.len(), "connection tasks did not stop in time");
        connections.abort_all();
    }
}

fn log_connection_exit(joined: std::result::Result<(), JoinError>) {
    if let Err(error) = joined {
        if error.is_panic() {
            error!(%error, "connection task panicked");
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: SharedRegistry,
    closed: CancellationToken,
    limits: Limits,
) {
    let Connection {
        handle,
        mut reader,
        writer,
    } = match Connection::open(stream, closed.clone(), limits) {
        Ok(connection) => connection,
        Err(error) => {
            warn!(%peer, %error, "could not set up connection");
            return;
        }
    };

    while let Some((packet, frame)) = reader.next_packet(&closed, peer).await {
        if dispatch(&registry, &handle, &packet, frame).is_break() {
            break;
        }
    }

    registry.lock().remove_connection(&handle);
    if let Err(error) = writer.await {
        warn!(%peer, %error, "writer task failed");
    }
    info!(%peer, conn = %handle.id(), "connection closed");
}

/// Handles one decoded packet from `handle`. `frame` is the raw read it was
/// decoded from and is what gets forwarded on PUBLISH.
///
/// Returns `Break` when the connection should be closed.
pub(crate) fn dispatch(
    registry: &SharedRegistry,
    handle: &ConnectionHandle,
    packet: &Packet,
    frame: Bytes,
) -> ControlFlow<()> {
    let peer = handle.peer();

    let replied = match packet.kind() {
        PacketKind::Connect => {
            debug!(%peer, "CONNECT");
            handle.send_packet(&Packet::new(PacketKind::ConnAck))
        }
        PacketKind::Publish => {
            match packet.topic() {
                Some(topic) => {
                    let delivered = registry.lock().publish(topic, &frame);
                    debug!(%peer, topic, delivered, "PUBLISH");
                }
                None => warn!(%peer, "PUBLISH without a topic, nothing to forward"),
            }
            handle.send_packet(&Packet::new(PacketKind::PubAck))
        }
        PacketKind::Subscribe => {
            let mut registry = registry.lock();
            if registry.subscribe(handle, packet.topic().unwrap_or_default()) {
                handle.send_packet(&Packet::new(PacketKind::SubAck))
            } else {
                Ok(())
            }
        }
        PacketKind::PingReq => handle.send_packet(&Packet::new(PacketKind::PingResp)),
        PacketKind::Disconnect => {
            info!(%peer, "client disconnected gracefully");
            return ControlFlow::Break(());
        }
        kind @ (PacketKind::ConnAck
        | PacketKind::PubAck
        | PacketKind::SubAck
        | PacketKind::PingResp) => {
            debug!(%peer, %kind, "ignoring acknowledgement sent to the broker");
            Ok(())
        }
    };

    match replied {
        Ok(()) => ControlFlow::Continue(()),
        Err(error) => {
            warn!(%peer, %error, kind = %packet.kind(), "reply failed, closing connection");
            ControlFlow::Break(())
        }
    }
}
