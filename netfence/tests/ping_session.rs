//! Ping protocol integration tests against a scripted loopback
//! server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use netfence::ping::wire;
use netfence::ping::{
    IpVersion, PingClient, PingEndpoint, PingSession, PingSessionConfig, ProbeError,
    SessionSource,
};
use netfence::session::SessionInitError;

const TOKEN_BYTES: &[u8] = b"integration-token";

/// Endpoint source pointing at the loopback responder. Records every
/// `stale` value the session reports and stamps each grant with the
/// next generation.
struct TestSource {
    port: u16,
    token: String,
    generation: AtomicU64,
    stales: Mutex<Vec<Option<u64>>>,
}

impl TestSource {
    fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            token: BASE64.encode(TOKEN_BYTES),
            generation: AtomicU64::new(0),
            stales: Mutex::new(Vec::new()),
        })
    }

    fn stales(&self) -> Vec<Option<u64>> {
        self.stales.lock().unwrap().clone()
    }
}

/// Newtype handle the actor owns; the orphan rule forbids
/// implementing `SessionSource` for `Arc<TestSource>` outside the
/// crate that defines the trait.
struct SourceHandle(Arc<TestSource>);

impl SessionSource for SourceHandle {
    fn endpoint(
        &self,
        stale: Option<u64>,
    ) -> impl std::future::Future<Output = Result<PingEndpoint, SessionInitError>> + Send {
        self.0.stales.lock().unwrap().push(stale);
        let generation = self.0.generation.fetch_add(1, Ordering::SeqCst) + 1;
        std::future::ready(Ok(PingEndpoint {
            host: "127.0.0.1".to_string(),
            port: self.0.port,
            token: self.0.token.clone(),
            ip_version: Some(IpVersion::V4),
            generation,
        }))
    }
}

async fn bind_responder() -> (Arc<UdpSocket>, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    (Arc::new(socket), port)
}

fn success_reply(request: &[u8]) -> Vec<u8> {
    let mut reply = Vec::from(wire::TAG_SUCCESS);
    reply.extend_from_slice(&request[4..8]);
    reply
}

fn error_reply(sequence: u32) -> Vec<u8> {
    let mut reply = Vec::from(wire::TAG_ERROR);
    reply.extend_from_slice(&sequence.to_be_bytes());
    reply
}

/// Responder that acknowledges every request and forwards a copy of
/// what it received.
fn spawn_echo(socket: Arc<UdpSocket>, seen: mpsc::UnboundedSender<Vec<u8>>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let request = buf[..len].to_vec();
            let reply = success_reply(&request);
            let _ = seen.send(request);
            let _ = socket.send_to(&reply, peer).await;
        }
    });
}

fn spawn_session(
    port: u16,
    probe_timeout: Duration,
) -> (Arc<TestSource>, PingClient, CancellationToken) {
    let source = TestSource::new(port);
    let cancel = CancellationToken::new();
    let config = PingSessionConfig {
        probe_timeout,
        ..PingSessionConfig::default()
    };
    let (client, _task) =
        PingSession::spawn(config, SourceHandle(Arc::clone(&source)), cancel.clone());
    (source, client, cancel)
}

#[tokio::test]
async fn test_probe_roundtrip_carries_token_and_sequence() {
    let (socket, port) = bind_responder().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    spawn_echo(socket, seen_tx);

    let (_source, client, cancel) = spawn_session(port, Duration::from_secs(1));
    let rtt = client.probe().await.expect("probe succeeds");
    assert!(rtt < Duration::from_secs(1));

    let request = seen_rx.recv().await.expect("responder saw the request");
    assert_eq!(request[..4], wire::TAG_REQUEST);
    let sequence = u32::from_be_bytes([request[4], request[5], request[6], request[7]]);
    assert!(sequence > 0, "sequence numbering starts above zero");
    assert_eq!(
        &request[wire::HEADER_LEN..],
        TOKEN_BYTES,
        "raw token bytes ride after the header"
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_reordered_replies_resolve_the_right_probes() {
    let (socket, port) = bind_responder().await;
    // Hold the first reply back until the second request arrived, then
    // answer in reverse order.
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        let first = buf[..len].to_vec();
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let second = buf[..len].to_vec();
        for request in [second, first] {
            socket.send_to(&success_reply(&request), peer).await.unwrap();
        }
    });

    let (_source, client, cancel) = spawn_session(port, Duration::from_secs(1));
    let (a, b) = tokio::join!(client.probe(), client.probe());
    a.expect("first probe resolves");
    b.expect("second probe resolves");

    cancel.cancel();
}

#[tokio::test]
async fn test_rejected_probe_reinitializes_with_stale_report() {
    let (socket, port) = bind_responder().await;
    // Reject the first request with its own sequence, accept later
    // ones.
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let mut rejected = false;
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let request = buf[..len].to_vec();
            let sequence =
                u32::from_be_bytes([request[4], request[5], request[6], request[7]]);
            let reply = if rejected {
                success_reply(&request)
            } else {
                rejected = true;
                error_reply(sequence)
            };
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    let (source, client, cancel) = spawn_session(port, Duration::from_secs(1));

    let first = client.probe().await;
    assert_eq!(first, Err(ProbeError::NeedsReinitialization));

    // The next probe transparently negotiates a fresh endpoint and
    // succeeds.
    client.probe().await.expect("second probe succeeds");
    assert_eq!(
        source.stales(),
        vec![None, Some(1)],
        "re-negotiation names the rejected grant"
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_session_level_error_fails_all_pending_probes() {
    let (socket, port) = bind_responder().await;
    // Collect two requests, then condemn the session with the
    // conventional sequence zero.
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
        let _ = socket.recv_from(&mut buf).await.unwrap();
        socket.send_to(&error_reply(0), peer).await.unwrap();
    });

    let (_source, client, cancel) = spawn_session(port, Duration::from_secs(5));
    let (a, b) = tokio::join!(client.probe(), client.probe());
    assert_eq!(a, Err(ProbeError::NeedsReinitialization));
    assert_eq!(b, Err(ProbeError::NeedsReinitialization));

    cancel.cancel();
}

#[tokio::test]
async fn test_unanswered_probe_times_out() {
    let (socket, port) = bind_responder().await;
    // Swallow every request.
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while socket.recv_from(&mut buf).await.is_ok() {}
    });

    let (_source, client, cancel) = spawn_session(port, Duration::from_millis(100));
    let started = std::time::Instant::now();
    let outcome = client.probe().await;
    assert_eq!(outcome, Err(ProbeError::TimedOut));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(5));

    cancel.cancel();
}

#[tokio::test]
async fn test_malformed_datagrams_are_ignored() {
    let (socket, port) = bind_responder().await;
    // Spray garbage before the real acknowledgement: a short
    // datagram, an unknown tag, and a success for a sequence that was
    // never sent.
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let request = buf[..len].to_vec();
            let _ = socket.send_to(b"RR", peer).await;
            let mut unknown = Vec::from(*b"ZZ99");
            unknown.extend_from_slice(&request[4..8]);
            let _ = socket.send_to(&unknown, peer).await;
            let mut wrong_sequence = Vec::from(wire::TAG_SUCCESS);
            wrong_sequence.extend_from_slice(&u32::MAX.to_be_bytes());
            let _ = socket.send_to(&wrong_sequence, peer).await;
            let _ = socket.send_to(&success_reply(&request), peer).await;
        }
    });

    let (_source, client, cancel) = spawn_session(port, Duration::from_secs(1));
    client
        .probe()
        .await
        .expect("probe survives the garbage and succeeds");

    cancel.cancel();
}
