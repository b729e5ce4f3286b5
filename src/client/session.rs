//! Client session
//!
//! The peer side of the protocol. A [`Session`] owns one outbound connection
//! and runs the same tasks as a broker connection (receive loop, writer) plus a
//! keep-alive emitter. Inbound PUBLISH is handed to the callback registered for
//! its exact topic; one callback per topic, the latest subscribe wins.
//!
//! Requests that expect an acknowledgement (CONNECT, PUBLISH, SUBSCRIBE) queue a
//! waiter per ack kind. A connection's replies arrive in request order, so the
//! oldest waiter still listening gets each ack.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientSettings;
use crate::transport::connection::spawn_keep_alive;
use crate::transport::{Connection, ConnectionHandle, FrameReader, Packet, PacketKind};
use crate::utils::{Error, Result};

/// Called with `(topic, payload)` for every message received on a subscribed topic.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct AckWaiters {
    conn_ack: VecDeque<oneshot::Sender<()>>,
    pub_ack: VecDeque<oneshot::Sender<()>>,
    sub_ack: VecDeque<oneshot::Sender<()>>,
}

impl AckWaiters {
    fn queue(&mut self, kind: PacketKind) -> Option<&mut VecDeque<oneshot::Sender<()>>> {
        match kind {
            PacketKind::ConnAck => Some(&mut self.conn_ack),
            PacketKind::PubAck => Some(&mut self.pub_ack),
            PacketKind::SubAck => Some(&mut self.sub_ack),
            _ => None,
        }
    }

    /// Wakes the oldest waiter for `kind` that is still listening.
    fn resolve(&mut self, kind: PacketKind) -> bool {
        let Some(queue) = self.queue(kind) else {
            return false;
        };
        while let Some(waiter) = queue.pop_front() {
            if waiter.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    fn clear(&mut self) {
        self.conn_ack.clear();
        self.pub_ack.clear();
        self.sub_ack.clear();
    }
}

/// State shared between a [`Session`] and its receive loop.
#[derive(Default)]
pub(crate) struct SessionState {
    callbacks: Mutex<HashMap<String, MessageCallback>>,
    acks: Mutex<AckWaiters>,
}

impl SessionState {
    fn callbacks(&self) -> MutexGuard<'_, HashMap<String, MessageCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acks(&self) -> MutexGuard<'_, AckWaiters> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `callback` for `topic`, returning the one it replaced.
    pub(crate) fn set_callback(&self, topic: &str, callback: MessageCallback) -> Option<MessageCallback> {
        self.callbacks().insert(topic.to_string(), callback)
    }

    /// Puts back what [`set_callback`](Self::set_callback) replaced, removing
    /// the entry if there was nothing before.
    pub(crate) fn restore_callback(&self, topic: &str, previous: Option<MessageCallback>) {
        let mut callbacks = self.callbacks();
        match previous {
            Some(callback) => {
                callbacks.insert(topic.to_string(), callback);
            }
            None => {
                callbacks.remove(topic);
            }
        }
    }

    pub(crate) fn has_callback(&self, topic: &str) -> bool {
        self.callbacks().contains_key(topic)
    }

    /// Handles one inbound packet. Returns `Break` when the session is over.
    pub(crate) fn dispatch(&self, handle: &ConnectionHandle, packet: &Packet) -> ControlFlow<()> {
        let peer = handle.peer();
        match packet.kind() {
            PacketKind::Publish => match packet.topic() {
                Some(topic) => {
                    let payload = packet.payload().map(|p| &p[..]).unwrap_or_default();
                    self.deliver(topic, payload);
                }
                None => warn!(%peer, "PUBLISH without a topic"),
            },
            PacketKind::PingReq => {
                if let Err(error) = handle.send_packet(&Packet::new(PacketKind::PingResp)) {
                    warn!(%peer, %error, "could not answer PINGREQ");
                    return ControlFlow::Break(());
                }
            }
            PacketKind::PingResp => trace!(%peer, "PINGRESP"),
            kind @ (PacketKind::ConnAck | PacketKind::PubAck | PacketKind::SubAck) => {
                if !self.acks().resolve(kind) {
                    debug!(%peer, %kind, "acknowledgement nobody was waiting for");
                }
            }
            PacketKind::Disconnect => {
                info!(%peer, "broker ended the session");
                return ControlFlow::Break(());
            }
            kind @ (PacketKind::Connect | PacketKind::Subscribe) => {
                debug!(%peer, %kind, "ignoring request sent to a client");
            }
        }
        ControlFlow::Continue(())
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        let Some(callback) = self.callbacks().get(topic).cloned() else {
            debug!(topic, "message for a topic without callback");
            return;
        };

        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(topic, payload))) {
            error!(topic, reason = panic_message(&*panic), "subscriber callback panicked");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    handle: ConnectionHandle,
    state: Arc<SessionState>,
) {
    let peer = handle.peer();
    while let Some((packet, _)) = reader.next_packet(handle.token(), peer).await {
        if state.dispatch(&handle, &packet).is_break() {
            break;
        }
    }
    handle.close();
    state.acks().clear();
    debug!(%peer, "receive loop stopped");
}

/// A connection to a broker with publish and subscribe operations.
pub struct Session {
    handle: ConnectionHandle,
    state: Arc<SessionState>,
    ack_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Connects to the broker, sends CONNECT and waits for CONNACK, then starts
    /// the keep-alive task.
    pub async fn connect(settings: &ClientSettings) -> Result<Session> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let stream = TcpStream::connect(&addr).await?;
        let Connection {
            handle,
            reader,
            writer,
        } = Connection::open(stream, CancellationToken::new(), settings.limits())?;

        let state = Arc::new(SessionState::default());
        let receiver = tokio::spawn(receive_loop(reader, handle.clone(), state.clone()));
        let mut session = Session {
            handle,
            state,
            ack_timeout: Duration::from_millis(settings.ack_timeout_ms),
            tasks: vec![receiver, writer],
        };

        if let Err(error) = session
            .request(Packet::new(PacketKind::Connect), PacketKind::ConnAck)
            .await
        {
            warn!(%addr, %error, "broker did not accept the connection");
            session.shutdown().await;
            return Err(error);
        }

        if settings.keep_alive_secs > 0 {
            let period = Duration::from_secs(settings.keep_alive_secs);
            session
                .tasks
                .push(spawn_keep_alive(session.handle.clone(), period));
        }

        info!(peer = %session.peer(), "connected to broker");
        Ok(session)
    }

    pub fn peer(&self) -> SocketAddr {
        self.handle.peer()
    }

    pub fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Resolves once the connection is gone, whichever side ended it.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.handle.closed()
    }

    /// Publishes `payload` on `topic` and waits for the broker's PUBACK.
    ///
    /// PUBACK confirms the broker received the message, not that any
    /// subscriber got it.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        if topic.is_empty() {
            return Err(Error::EmptyTopic);
        }
        self.request(Packet::publish(topic, payload), PacketKind::PubAck)
            .await
    }

    /// Registers `callback` for `topic` and subscribes, waiting for SUBACK.
    ///
    /// The callback is installed before the request goes out so no message
    /// published after the SUBACK can be missed. If the subscription fails,
    /// the callback of an earlier successful subscribe to `topic` is put back.
    pub async fn subscribe<F>(&self, topic: &str, callback: F) -> Result<()>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        if topic.is_empty() {
            return Err(Error::EmptyTopic);
        }

        let previous = self.state.set_callback(topic, Arc::new(callback));
        match self
            .request(Packet::subscribe(topic), PacketKind::SubAck)
            .await
        {
            Ok(()) => {
                info!(topic, "subscribed");
                Ok(())
            }
            Err(error) => {
                self.state.restore_callback(topic, previous);
                warn!(topic, %error, "subscribe failed");
                Err(error)
            }
        }
    }

    pub fn has_callback(&self, topic: &str) -> bool {
        self.state.has_callback(topic)
    }

    /// Sends DISCONNECT and tears the session down. Safe to call twice.
    pub async fn disconnect(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        if let Err(error) = self
            .handle
            .send_packet(&Packet::new(PacketKind::Disconnect))
        {
            debug!(peer = %self.peer(), %error, "DISCONNECT not sent");
        }
        self.shutdown().await;
        info!(peer = %self.peer(), "disconnected");
    }

    async fn request(&self, packet: Packet, ack: PacketKind) -> Result<()> {
        let frame = packet.encode()?;
        let (waiter, acked) = oneshot::channel();
        {
            // Queue and send under one lock so waiter order matches wire order.
            let mut acks = self.state.acks();
            self.handle.send(frame)?;
            if let Some(queue) = acks.queue(ack) {
                queue.push_back(waiter);
            }
        }

        match time::timeout(self.ack_timeout, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::AckTimeout(ack.as_str())),
        }
    }

    async fn shutdown(&mut self) {
        self.handle.close();
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            match time::timeout(TASK_JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, "session task failed"),
                Err(_) => {
                    warn!("session task did not stop in time, abandoning it");
                    abort.abort();
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.handle.close();
    }
}
