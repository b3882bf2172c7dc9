//! End-to-end measurement flows: service facade, loopback ping
//! server, scripted control server, capturing result sink.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use netfence::config::CoverageConfig;
use netfence::fence::{Fence, LocationSample, PingOutcome};
use netfence::geo::Coordinate;
use netfence::ping::wire;
use netfence::resend::{DeliveryBatch, DeliveryError, ResultSender};
use netfence::service::{
    ActivityLease, CoverageService, LocationSource, RadioSource, StopCause,
};
use netfence::session::{SessionGrant, SessionInitError, SessionProvider, SessionRequest};
use netfence::store::{SpoolStore, StartMode};

/// Ping server that acknowledges every request.
async fn bind_echo_responder() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            if len >= wire::HEADER_LEN && buf[..4] == wire::TAG_REQUEST {
                let mut reply = Vec::from(wire::TAG_SUCCESS);
                reply.extend_from_slice(&buf[4..8]);
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });
    port
}

struct ScriptedProvider {
    grants: Mutex<VecDeque<SessionGrant>>,
    requests: Mutex<Vec<Option<String>>>,
}

impl ScriptedProvider {
    fn new(grants: Vec<SessionGrant>) -> Arc<Self> {
        Arc::new(Self {
            grants: Mutex::new(grants.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<Option<String>> {
        self.requests.lock().unwrap().clone()
    }
}

impl SessionProvider for ScriptedProvider {
    fn request_session(
        &self,
        request: SessionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SessionGrant, SessionInitError>> + Send + '_>> {
        self.requests
            .lock()
            .unwrap()
            .push(request.previous_test_uuid);
        let next = self.grants.lock().unwrap().pop_front();
        Box::pin(std::future::ready(match next {
            Some(grant) => Ok(grant),
            None => Err(SessionInitError::new("no more scripted grants")),
        }))
    }
}

#[derive(Default)]
struct CapturingSender {
    batches: Mutex<Vec<DeliveryBatch>>,
}

impl CapturingSender {
    fn batches(&self) -> Vec<DeliveryBatch> {
        self.batches.lock().unwrap().clone()
    }
}

impl ResultSender for CapturingSender {
    fn send_fences(
        &self,
        batch: DeliveryBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
        self.batches.lock().unwrap().push(batch);
        Box::pin(std::future::ready(Ok(())))
    }
}

struct ChannelLocations(mpsc::Receiver<LocationSample>);

impl LocationSource for ChannelLocations {
    fn next_location(&mut self) -> impl Future<Output = Option<LocationSample>> + Send {
        self.0.recv()
    }
}

struct ChannelRadio(mpsc::Receiver<String>);

impl RadioSource for ChannelRadio {
    fn next_technology(&mut self) -> impl Future<Output = Option<String>> + Send {
        self.0.recv()
    }
}

fn sources() -> (
    mpsc::Sender<LocationSample>,
    mpsc::Sender<String>,
    ChannelLocations,
    ChannelRadio,
) {
    let (loc_tx, loc_rx) = mpsc::channel(32);
    let (radio_tx, radio_rx) = mpsc::channel(32);
    (
        loc_tx,
        radio_tx,
        ChannelLocations(loc_rx),
        ChannelRadio(radio_rx),
    )
}

fn grant(test_uuid: &str, port: u16) -> SessionGrant {
    SessionGrant {
        test_uuid: test_uuid.to_string(),
        ping_host: "127.0.0.1".to_string(),
        ping_port: port,
        ping_token: BASE64.encode(b"flow-token"),
        ip_version: None,
        max_sub_session: Duration::ZERO,
        max_total: Duration::ZERO,
    }
}

fn fast_config(dir: &TempDir) -> CoverageConfig {
    CoverageConfig {
        ping_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(150),
        spool_dir: dir.path().to_path_buf(),
        ..CoverageConfig::default()
    }
}

/// A location fix on the equator with good accuracy. 0.0003 degrees
/// of longitude is roughly 33 metres, past the default fence radius.
fn fix(longitude: f64) -> LocationSample {
    LocationSample::new(Coordinate::new(0.0, longitude), Utc::now(), 5.0)
}

#[tokio::test]
async fn test_walk_is_segmented_and_delivered() {
    let port = bind_echo_responder().await;
    let dir = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(vec![grant("sub-1", port)]);
    let sender = Arc::new(CapturingSender::default());
    let service =
        CoverageService::new(fast_config(&dir), provider.clone(), sender.clone()).unwrap();

    let (loc_tx, radio_tx, locations, radio) = sources();
    let handle = service
        .start_measurement(locations, radio, ActivityLease::none())
        .await
        .unwrap();

    radio_tx.send("LTE".to_string()).await.unwrap();
    loc_tx.send(fix(0.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    loc_tx.send(fix(0.0003)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(handle.stop().await, StopCause::Requested);

    let batches = sender.batches();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.test_uuid, "sub-1");
    assert_eq!(batch.fences.len(), 2, "the move splits the walk in two");

    let first = &batch.fences[0];
    let second = &batch.fences[1];
    assert!(first.entered_at_us < second.entered_at_us);
    assert_eq!(first.technology.as_deref(), Some("LTE"));
    assert_eq!(
        second.technology.as_deref(),
        Some("LTE"),
        "a new fence inherits the last observed technology"
    );
    assert!(first.avg_ping_ms.is_some(), "loopback probes succeed");
    assert!(first.duration_ms.is_some());
    assert!(second.duration_ms.is_some());

    // Everything was accepted; nothing is left for a later cold start.
    let report = service.deliver_backlog(StartMode::Cold).await;
    assert_eq!(report.sub_sessions_sent, 0);
}

#[tokio::test]
async fn test_renewal_chains_sub_sessions() {
    let port = bind_echo_responder().await;
    let dir = TempDir::new().unwrap();
    let mut short_grant = grant("sub-1", port);
    short_grant.max_sub_session = Duration::from_millis(80);
    let provider = ScriptedProvider::new(vec![short_grant, grant("sub-2", port)]);
    let sender = Arc::new(CapturingSender::default());
    let service =
        CoverageService::new(fast_config(&dir), provider.clone(), sender.clone()).unwrap();

    let (loc_tx, radio_tx, locations, radio) = sources();
    let handle = service
        .start_measurement(locations, radio, ActivityLease::none())
        .await
        .unwrap();

    radio_tx.send("NRNSA".to_string()).await.unwrap();
    loc_tx.send(fix(0.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    // The second fence opens well before the first grant expires and
    // stays open across the renewal at ~80ms.
    loc_tx.send(fix(0.0003)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(160)).await;
    handle.stop().await;

    assert_eq!(
        provider.requests(),
        vec![None, Some("sub-1".to_string())],
        "renewal names the sub-session it continues"
    );

    let batches = sender.batches();
    assert_eq!(batches.len(), 2, "one batch per sub-session");
    assert_eq!(batches[0].test_uuid, "sub-2", "newest first");
    assert_eq!(batches[1].test_uuid, "sub-1");
    assert_eq!(batches[1].fences.len(), 1);
    assert_eq!(batches[0].fences.len(), 1);
    // The crossing fence entered before sub-2's anchor existed.
    assert!(batches[0].fences[0].offset_ms < 0);
}

#[tokio::test]
async fn test_cold_start_recovers_interrupted_measurement() {
    let dir = TempDir::new().unwrap();
    let started = Utc::now() - chrono::Duration::minutes(10);

    fn closed_fence(entered: chrono::DateTime<Utc>, ping_ms: u64) -> Fence {
        let mut fence = Fence::open(Coordinate::new(47.0, 16.0), entered, 20.0);
        fence.record_ping(PingOutcome::interval(
            entered,
            Duration::from_millis(ping_ms),
        ));
        fence.close(entered + chrono::Duration::seconds(30));
        fence
    }

    {
        let mut spool = SpoolStore::open(dir.path()).unwrap();
        spool.begin_sub_session(started, None).unwrap();
        spool
            .assign_identity("crashed-uuid".to_string(), started)
            .unwrap();
        spool.save_fence(closed_fence(started, 12)).unwrap();
        spool
            .save_fence(closed_fence(started + chrono::Duration::minutes(1), 30))
            .unwrap();
        // Dropped without finalize, like a process crash.
    }

    let provider = ScriptedProvider::new(vec![grant("unused", 9)]);
    let sender = Arc::new(CapturingSender::default());
    let service = CoverageService::new(fast_config(&dir), provider, sender.clone()).unwrap();

    // Warm passes leave the unfinished record alone.
    let warm = service.deliver_backlog(StartMode::Warm).await;
    assert_eq!(warm.sub_sessions_sent, 0);
    assert!(sender.batches().is_empty());

    // A cold start recovers and delivers it.
    let cold = service.deliver_backlog(StartMode::Cold).await;
    assert_eq!(cold.sub_sessions_sent, 1);
    assert_eq!(cold.fences_sent, 2);
    let batches = sender.batches();
    assert_eq!(batches[0].test_uuid, "crashed-uuid");
    assert_eq!(batches[0].fences.len(), 2);

    // Recovered once, gone for good.
    let again = service.deliver_backlog(StartMode::Cold).await;
    assert_eq!(again.sub_sessions_sent, 0);
}

#[tokio::test]
async fn test_measurement_without_identity_is_never_delivered() {
    struct FailingProvider;

    impl SessionProvider for FailingProvider {
        fn request_session(
            &self,
            _request: SessionRequest,
        ) -> Pin<Box<dyn Future<Output = Result<SessionGrant, SessionInitError>> + Send + '_>>
        {
            Box::pin(std::future::ready(Err(SessionInitError::new(
                "control server down",
            ))))
        }
    }

    let dir = TempDir::new().unwrap();
    let sender = Arc::new(CapturingSender::default());
    let service = CoverageService::new(
        fast_config(&dir),
        Arc::new(FailingProvider),
        sender.clone(),
    )
    .unwrap();

    let (loc_tx, _radio_tx, locations, radio) = sources();
    let handle = service
        .start_measurement(locations, radio, ActivityLease::none())
        .await
        .unwrap();
    loc_tx.send(fix(0.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.stop().await;

    // Fences were recorded, but without a server identity they are
    // held back rather than sent.
    assert!(sender.batches().is_empty());
}
