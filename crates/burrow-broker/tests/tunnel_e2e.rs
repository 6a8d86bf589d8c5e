//! End-to-end tunnel lifecycle tests
//!
//! The operator session is simulated with an in-memory duplex pipe and the
//! HTTP leg with a second pipe standing in for the response body.

use burrow_broker::{
    BrokerConfig, BrokerError, SessionState, TokenPublisher, TunnelBroker, TunnelToken,
};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Publishes tokens to the test instead of the log
struct ChannelPublisher(mpsc::UnboundedSender<TunnelToken>);

impl TokenPublisher for ChannelPublisher {
    fn publish(&self, _user: &str, token: TunnelToken) {
        let _ = self.0.send(token);
    }
}

/// Yields some bytes, then fails like a reset connection
struct FailingReader {
    sent: bool,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "session reset",
            )));
        }
        self.sent = true;
        buf.put_slice(b"partial");
        Poll::Ready(Ok(()))
    }
}

fn broker(config: BrokerConfig) -> (Arc<TunnelBroker>, mpsc::UnboundedReceiver<TunnelToken>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let broker = TunnelBroker::new(config).with_publisher(Arc::new(ChannelPublisher(tx)));
    (Arc::new(broker), rx)
}

/// Start a session for `user`; returns the operator's end of the connection
fn start_session(
    broker: &Arc<TunnelBroker>,
    user: &str,
) -> (
    DuplexStream,
    JoinHandle<Result<burrow_broker::SessionReport, BrokerError>>,
) {
    let (operator, server) = tokio::io::duplex(4096);
    let (input, output) = tokio::io::split(server);
    let handler = broker.session(user);
    assert_eq!(handler.state(), SessionState::Connected);
    let task = tokio::spawn(handler.run(input, output));
    (operator, task)
}

#[tokio::test]
async fn test_session_relays_to_http_destination() {
    let (broker, mut tokens) = broker(BrokerConfig::default());
    let (mut operator, session) = start_session(&broker, "alice");

    let token = tokens.recv().await.unwrap();
    assert_eq!(broker.pending_count(), 1);

    let (destination, mut body) = tokio::io::duplex(4096);
    let waiter = broker.hand_off(token, destination).unwrap();
    let http = tokio::spawn(waiter.wait(None));

    operator.write_all(b"hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !http.is_finished(),
        "HTTP leg returned before end-of-stream"
    );

    operator.shutdown().await.unwrap();

    assert_eq!(http.await.unwrap().unwrap(), 5);

    let mut received = Vec::new();
    body.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hello\n\n!!! DONE");

    let mut transcript = String::new();
    operator.read_to_string(&mut transcript).await.unwrap();
    assert_eq!(transcript, "user: alice connected\n\n\n!!! DONE");

    let report = session.await.unwrap().unwrap();
    assert_eq!(report.token, token);
    assert_eq!(report.bytes_relayed, 5);
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn test_announce_token_to_session() {
    let (broker, mut tokens) = broker(BrokerConfig::default().with_announce_token(true));
    let (mut operator, _session) = start_session(&broker, "bob");

    let token = tokens.recv().await.unwrap();
    let expected = format!("user: bob connected\ntunnel id: {}\n", token);

    let mut greeting = vec![0u8; expected.len()];
    operator.read_exact(&mut greeting).await.unwrap();
    assert_eq!(String::from_utf8(greeting).unwrap(), expected);
}

#[tokio::test]
async fn test_claimed_token_cannot_be_claimed_again() {
    let (broker, mut tokens) = broker(BrokerConfig::default());
    let (_operator, _session) = start_session(&broker, "alice");
    let token = tokens.recv().await.unwrap();

    let _waiter = broker.hand_off(token, tokio::io::sink()).unwrap();

    assert!(matches!(
        broker.hand_off(token, tokio::io::sink()),
        Err(BrokerError::TokenNotFound)
    ));
}

#[tokio::test]
async fn test_disconnect_before_claim_removes_slot() {
    let (broker, mut tokens) = broker(BrokerConfig::default());
    let (_operator, session) = start_session(&broker, "alice");
    let token = tokens.recv().await.unwrap();
    assert!(broker.registry().contains(token));

    session.abort();
    assert!(session.await.unwrap_err().is_cancelled());

    assert!(broker.registry().claim(token).is_none());
    assert!(matches!(
        broker.hand_off(token, tokio::io::sink()),
        Err(BrokerError::TokenNotFound)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_claim_timeout_removes_slot() {
    let config = BrokerConfig::default().with_claim_timeout(Some(Duration::from_secs(30)));
    let (broker, mut tokens) = broker(config);
    let (_operator, session) = start_session(&broker, "alice");
    let token = tokens.recv().await.unwrap();

    let result = session.await.unwrap();

    assert!(matches!(result, Err(BrokerError::TimedOut(_))));
    assert!(!broker.registry().contains(token));
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_relay_timeout_cancels_session() {
    let config = BrokerConfig::default().with_relay_timeout(Some(Duration::from_secs(10)));
    let (broker, mut tokens) = broker(config);
    let (_operator, session) = start_session(&broker, "alice");
    let token = tokens.recv().await.unwrap();

    // The operator never sends end-of-stream
    let relay = broker
        .hand_off_with_deadline(token, tokio::io::sink())
        .unwrap();
    assert!(matches!(relay.await, Err(BrokerError::TimedOut(_))));

    assert!(matches!(
        session.await.unwrap(),
        Err(BrokerError::Cancelled)
    ));
}

#[tokio::test]
async fn test_session_io_error_releases_http_leg() {
    let (broker, mut tokens) = broker(BrokerConfig::default());
    let (_operator_output, server_output) = tokio::io::duplex(4096);

    let handler = broker.session("alice");
    let session = tokio::spawn(handler.run(FailingReader { sent: false }, server_output));
    let token = tokens.recv().await.unwrap();

    let relay = broker
        .hand_off_with_deadline(token, tokio::io::sink())
        .unwrap();

    match relay.await {
        Err(BrokerError::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(
        session.await.unwrap(),
        Err(BrokerError::Transport(_))
    ));
}

#[tokio::test]
async fn test_http_leg_gone_aborts_session() {
    let (broker, mut tokens) = broker(BrokerConfig::default());
    let (mut operator, session) = start_session(&broker, "alice");
    let token = tokens.recv().await.unwrap();

    let (destination, body) = tokio::io::duplex(64);
    let waiter = broker.hand_off(token, destination).unwrap();

    // HTTP client disconnects: its end of the pipe and its waiter go away
    drop(body);
    drop(waiter);

    // The session may already have noticed the cancellation and hung up
    let _ = operator.write_all(b"nobody is listening").await;

    assert!(session.await.unwrap().is_err());
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_tunnels_are_paired_by_token() {
    let (broker, mut tokens) = broker(BrokerConfig::default());

    let mut sessions = Vec::new();
    for i in 0..8 {
        let (operator, session) = start_session(&broker, &format!("user{i}"));
        let token = tokens.recv().await.unwrap();
        sessions.push((i, token, operator, session));
    }
    assert_eq!(broker.pending_count(), 8);

    let mut handles = Vec::new();
    for (i, token, mut operator, session) in sessions {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let (destination, mut body) = tokio::io::duplex(4096);
            let waiter = broker.hand_off(token, destination).unwrap();

            operator
                .write_all(format!("payload-{i}").as_bytes())
                .await
                .unwrap();
            operator.shutdown().await.unwrap();

            waiter.wait(None).await.unwrap();
            let mut received = String::new();
            body.read_to_string(&mut received).await.unwrap();
            session.await.unwrap().unwrap();

            assert_eq!(received, format!("payload-{i}\n\n!!! DONE"));
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(broker.pending_count(), 0);
}
