use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Receiver};
use tokio_util::sync::CancellationToken;

use super::session::{Session, SessionState};
use crate::config::ClientSettings;
use crate::transport::{ConnectionHandle, Packet, PacketKind};
use crate::utils::Error;

type Received = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

fn handle() -> (ConnectionHandle, Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(16);
    let handle = ConnectionHandle::new(
        "127.0.0.1:1883".parse().unwrap(),
        tx,
        CancellationToken::new(),
    );
    (handle, rx)
}

fn recorder(received: &Received) -> super::MessageCallback {
    let received = received.clone();
    Arc::new(move |topic: &str, payload: &[u8]| {
        received
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
    })
}

fn exploding(_topic: &str, _payload: &[u8]) {
    panic!("callback failure");
}

fn client_settings(port: u16) -> ClientSettings {
    ClientSettings {
        host: "127.0.0.1".to_string(),
        port,
        keep_alive_secs: 0,
        ack_timeout_ms: 200,
        read_buffer_size: 1024,
        outbound_queue_size: 16,
    }
}

#[test]
fn test_publish_invokes_topic_callback() {
    let state = SessionState::default();
    let (h, _rx) = handle();
    let received = Received::default();
    state.set_callback("sensors/temp", recorder(&received));

    let flow = state.dispatch(&h, &Packet::publish("sensors/temp", &b"21.5"[..]));
    assert_eq!(flow, ControlFlow::Continue(()));
    assert_eq!(
        *received.lock().unwrap(),
        vec![("sensors/temp".to_string(), b"21.5".to_vec())]
    );
}

#[test]
fn test_publish_for_other_topic_is_ignored() {
    let state = SessionState::default();
    let (h, _rx) = handle();
    let received = Received::default();
    state.set_callback("a", recorder(&received));

    state.dispatch(&h, &Packet::publish("b", &b"x"[..]));
    state.dispatch(&h, &Packet::publish("a/b", &b"x"[..]));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn test_second_callback_replaces_first() {
    let state = SessionState::default();
    let (h, _rx) = handle();
    let first = Received::default();
    let second = Received::default();
    state.set_callback("t", recorder(&first));
    state.set_callback("t", recorder(&second));

    state.dispatch(&h, &Packet::publish("t", &b"1"[..]));
    assert!(first.lock().unwrap().is_empty());
    assert_eq!(second.lock().unwrap().len(), 1);
}

#[test]
fn test_panicking_callback_does_not_stop_dispatch() {
    let state = SessionState::default();
    let (h, _rx) = handle();
    let received = Received::default();
    state.set_callback("boom", Arc::new(exploding));
    state.set_callback("ok", recorder(&received));

    let flow = state.dispatch(&h, &Packet::publish("boom", &b"x"[..]));
    assert_eq!(flow, ControlFlow::Continue(()));

    state.dispatch(&h, &Packet::publish("ok", &b"y"[..]));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[test]
fn test_pingreq_gets_exactly_one_pingresp() {
    let state = SessionState::default();
    let (h, mut rx) = handle();

    state.dispatch(&h, &Packet::new(PacketKind::PingReq));
    assert_eq!(&rx.try_recv().unwrap()[..], &[PacketKind::PingResp as u8][..]);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_disconnect_ends_session() {
    let state = SessionState::default();
    let (h, _rx) = handle();
    assert_eq!(
        state.dispatch(&h, &Packet::new(PacketKind::Disconnect)),
        ControlFlow::Break(())
    );
}

#[test]
fn test_unexpected_acks_are_tolerated() {
    let state = SessionState::default();
    let (h, mut rx) = handle();
    for kind in [PacketKind::SubAck, PacketKind::PubAck, PacketKind::PingResp] {
        assert_eq!(
            state.dispatch(&h, &Packet::new(kind)),
            ControlFlow::Continue(())
        );
    }
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_restore_callback_without_previous_removes_entry() {
    let state = SessionState::default();
    let received = Received::default();
    let previous = state.set_callback("t", recorder(&received));
    assert!(previous.is_none());
    assert!(state.has_callback("t"));
    state.restore_callback("t", previous);
    assert!(!state.has_callback("t"));
}

#[test]
fn test_restore_callback_puts_previous_back() {
    let state = SessionState::default();
    let (h, _rx) = handle();
    let first = Received::default();
    let second = Received::default();
    state.set_callback("t", recorder(&first));
    let previous = state.set_callback("t", recorder(&second));
    state.restore_callback("t", previous);

    state.dispatch(&h, &Packet::publish("t", &b"1"[..]));
    assert_eq!(first.lock().unwrap().len(), 1);
    assert!(second.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_session_against_scripted_broker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[PacketKind::Connect as u8]);
        socket.write_all(&[PacketKind::ConnAck as u8]).await.unwrap();

        // SUBSCRIBE is never acknowledged.
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(
            Packet::decode(&buf[..n]).unwrap(),
            Packet::subscribe("quiet")
        );

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(
            Packet::decode(&buf[..n]).unwrap(),
            Packet::publish("t", &b"v"[..])
        );
        socket.write_all(&[PacketKind::PubAck as u8]).await.unwrap();

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[PacketKind::Disconnect as u8]);
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    });

    let mut session = Session::connect(&client_settings(port)).await.unwrap();
    assert!(session.is_connected());

    assert!(matches!(
        session.subscribe("", |_, _| {}).await,
        Err(Error::EmptyTopic)
    ));

    let err = session.subscribe("quiet", |_, _| {}).await.unwrap_err();
    assert!(matches!(err, Error::AckTimeout("SUBACK")));
    assert!(!session.has_callback("quiet"));

    session.publish("t", &b"v"[..]).await.unwrap();

    session.disconnect().await;
    session.disconnect().await;
    assert!(!session.is_connected());

    broker.await.unwrap();
}

#[tokio::test]
async fn test_connect_fails_without_connack() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let silent = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let result = Session::connect(&client_settings(port)).await;
    assert!(matches!(result, Err(Error::AckTimeout("CONNACK"))));
    silent.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused_is_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = Session::connect(&client_settings(port)).await;
    assert!(matches!(result, Err(Error::Io(_))));
}

#[tokio::test]
async fn test_failed_resubscribe_keeps_working_callback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let broker = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[PacketKind::Connect as u8]);
        socket.write_all(&[PacketKind::ConnAck as u8]).await.unwrap();

        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::subscribe("t"));
        socket.write_all(&[PacketKind::SubAck as u8]).await.unwrap();

        // The repeated SUBSCRIBE goes unanswered until the client gives up.
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::subscribe("t"));
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        let frame = Packet::publish("t", &b"kept"[..]).encode().unwrap();
        socket.write_all(&frame).await.unwrap();

        while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let mut session = Session::connect(&client_settings(port)).await.unwrap();
    let first = Received::default();
    let second = Received::default();

    let sink = first.clone();
    session
        .subscribe("t", move |topic, payload| {
            sink.lock().unwrap().push((topic.to_string(), payload.to_vec()));
        })
        .await
        .unwrap();

    let sink = second.clone();
    let err = session
        .subscribe("t", move |topic, payload| {
            sink.lock().unwrap().push((topic.to_string(), payload.to_vec()));
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AckTimeout("SUBACK")));
    assert!(session.has_callback("t"));

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while first.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *first.lock().unwrap(),
        vec![("t".to_string(), b"kept".to_vec())]
    );
    assert!(second.lock().unwrap().is_empty());

    session.disconnect().await;
    broker.await.unwrap();
}
