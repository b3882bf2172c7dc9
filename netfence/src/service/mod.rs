//! The coverage measurement service.
//!
//! [`CoverageService`] is the single entry point: it owns the spool
//! worker and the delivery coordinator, and wires a fresh set of
//! measurement tasks together for each [`start_measurement`] call.
//!
//! A running measurement is five cooperating tasks: the two source
//! pumps, the probe schedule, the ping socket actor, and the fence
//! aggregator, joined by one shared event channel and supervised by a
//! task that runs the stop sequence once the cancellation token
//! fires.
//!
//! [`start_measurement`]: CoverageService::start_measurement

mod driver;

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, CoverageConfig};
use crate::event::{EventFeed, MeasurementEvent};
use crate::fence::aggregator::{AggregatorConfig, FenceAggregator};
use crate::fence::LocationSample;
use crate::ping::{PingSession, PingSessionConfig};
use crate::resend::{DeliveryReport, ResendCoordinator, ResultSender};
use crate::session::{SessionCoordinator, SessionProvider};
use crate::store::{SpoolStore, StartMode, StoreError, StoreHandle, StoreWorker};

use driver::ProbeDriver;

/// Event channel capacity shared by all producers of a measurement.
const EVENT_CAPACITY: usize = 512;

/// Streams location fixes into a measurement. Returning `None` ends
/// the stream; the measurement keeps running on the fences it already
/// has until stopped.
pub trait LocationSource: Send + 'static {
    fn next_location(&mut self) -> impl Future<Output = Option<LocationSample>> + Send;
}

/// Streams radio technology changes into a measurement. Only changes
/// need to be reported, not a steady sample rate.
pub trait RadioSource: Send + 'static {
    fn next_technology(&mut self) -> impl Future<Output = Option<String>> + Send;
}

/// Holds a platform anti-doze token for the life of a measurement.
///
/// The token is dropped only after the stop sequence has finished its
/// final delivery pass, so the platform cannot suspend the process
/// while spooled fences are still being sent.
pub struct ActivityLease {
    _token: Option<Box<dyn Any + Send>>,
}

impl ActivityLease {
    /// Wrap a platform token.
    pub fn new(token: impl Any + Send) -> Self {
        Self {
            _token: Some(Box::new(token)),
        }
    }

    /// A lease holding nothing, for platforms without doze control.
    pub fn none() -> Self {
        Self { _token: None }
    }
}

/// Why a measurement ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The caller asked for the stop.
    Requested,
    /// The total measurement window granted by the server elapsed.
    TotalWindowExpired,
}

/// Errors starting the service or a measurement.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("a measurement is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The measurement engine facade.
pub struct CoverageService {
    config: CoverageConfig,
    provider: Arc<dyn SessionProvider>,
    store: StoreHandle,
    resend: ResendCoordinator,
    measuring: Arc<AtomicBool>,
}

impl CoverageService {
    /// Validate the configuration, open the spool, and spawn the store
    /// worker. Must be called within a Tokio runtime.
    pub fn new(
        config: CoverageConfig,
        provider: Arc<dyn SessionProvider>,
        sender: Arc<dyn ResultSender>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let spool = SpoolStore::open(config.spool_dir.clone())?;
        let (store, _worker) = StoreWorker::spawn(spool);
        let resend = ResendCoordinator::new(store.clone(), sender, config.max_resend_age);
        Ok(Self {
            config,
            provider,
            store,
            resend,
            measuring: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether a measurement is currently running.
    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::Acquire)
    }

    /// Deliver spooled sub-sessions outside a measurement.
    ///
    /// Run with [`StartMode::Cold`] at application startup to recover
    /// whatever earlier runs left behind.
    pub async fn deliver_backlog(&self, mode: StartMode) -> DeliveryReport {
        self.resend.deliver(mode).await
    }

    /// Start a measurement. Only one runs at a time.
    ///
    /// The sub-session record begins immediately; the session grant is
    /// negotiated lazily by the first probe, and fences recorded before
    /// the grant arrives end up with negative time offsets relative to
    /// the session anchor.
    pub async fn start_measurement(
        &self,
        locations: impl LocationSource,
        radio: impl RadioSource,
        lease: ActivityLease,
    ) -> Result<MeasurementHandle, ServiceError> {
        if self
            .measuring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::AlreadyRunning);
        }

        if let Err(e) = self.store.begin_sub_session(Utc::now(), None).await {
            self.measuring.store(false, Ordering::Release);
            return Err(e.into());
        }
        info!("measurement starting");

        let cancel = CancellationToken::new();
        let (feed, events) = EventFeed::channel(EVENT_CAPACITY);

        let aggregator = FenceAggregator::new(
            AggregatorConfig {
                fence_radius_m: self.config.fence_radius_m,
                min_location_accuracy_m: self.config.min_location_accuracy_m,
                settle_after: self.config.probe_timeout,
            },
            self.store.clone(),
            events,
        )
        .start();

        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&self.provider),
            self.store.clone(),
            feed.clone(),
        ));

        let (ping, ping_task) = PingSession::spawn(
            PingSessionConfig {
                probe_timeout: self.config.probe_timeout,
                ..PingSessionConfig::default()
            },
            Arc::clone(&coordinator),
            cancel.clone(),
        );

        let (cause_tx, cause_rx) = oneshot::channel();
        let driver = ProbeDriver::new(
            self.config.ping_interval,
            coordinator,
            ping,
            feed.clone(),
            cancel.clone(),
            cause_tx,
        )
        .start();

        let pumps = vec![
            tokio::spawn(pump_locations(locations, feed.clone(), cancel.clone())),
            tokio::spawn(pump_radio(radio, feed.clone(), cancel.clone())),
        ];

        let (done_tx, done_rx) = oneshot::channel();
        let supervisor = Supervisor {
            cancel: cancel.clone(),
            feed,
            aggregator,
            ping: ping_task,
            driver,
            pumps,
            store: self.store.clone(),
            resend: self.resend.clone(),
            measuring: Arc::clone(&self.measuring),
            lease,
            cause: cause_rx,
            done: done_tx,
        };
        tokio::spawn(supervisor.run());

        Ok(MeasurementHandle {
            cancel,
            done: done_rx,
        })
    }
}

/// Control handle for a running measurement.
pub struct MeasurementHandle {
    cancel: CancellationToken,
    done: oneshot::Receiver<StopCause>,
}

impl MeasurementHandle {
    /// Begin the stop sequence without waiting for it.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the measurement and wait until the final delivery pass has
    /// finished.
    pub async fn stop(self) -> StopCause {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the measurement to end on its own, either through the
    /// total session window or an earlier [`request_stop`].
    ///
    /// [`request_stop`]: MeasurementHandle::request_stop
    pub async fn wait(self) -> StopCause {
        self.done.await.unwrap_or(StopCause::Requested)
    }
}

/// Runs the stop sequence: wind down producers, drain the aggregator,
/// finalize the record, deliver, release the lease.
struct Supervisor {
    cancel: CancellationToken,
    feed: EventFeed,
    aggregator: JoinHandle<()>,
    ping: JoinHandle<()>,
    driver: JoinHandle<()>,
    pumps: Vec<JoinHandle<()>>,
    store: StoreHandle,
    resend: ResendCoordinator,
    measuring: Arc<AtomicBool>,
    lease: ActivityLease,
    cause: oneshot::Receiver<StopCause>,
    done: oneshot::Sender<StopCause>,
}

impl Supervisor {
    async fn run(mut self) {
        self.cancel.cancelled().await;

        // Producers first. Once the last feed clone is gone the
        // aggregator drains what is buffered, persists the open fence,
        // and exits.
        let _ = self.driver.await;
        let _ = self.ping.await;
        for pump in self.pumps {
            let _ = pump.await;
        }
        drop(self.feed);
        let _ = self.aggregator.await;

        match self.store.finalize_current(Utc::now()).await {
            Ok(id) => debug!(sub_session = %id, "sub-session finalized"),
            Err(e) => warn!(error = %e, "failed to finalize sub-session at stop"),
        }
        let report = self.resend.deliver(StartMode::Warm).await;

        // Everything durable is settled; the platform may doze again.
        drop(self.lease);
        self.measuring.store(false, Ordering::Release);

        let cause = self.cause.try_recv().unwrap_or(StopCause::Requested);
        info!(
            cause = ?cause,
            sub_sessions_sent = report.sub_sessions_sent,
            fences_sent = report.fences_sent,
            "measurement stopped"
        );
        let _ = self.done.send(cause);
    }
}

async fn pump_locations(
    mut source: impl LocationSource,
    feed: EventFeed,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sample = source.next_location() => match sample {
                Some(sample) => {
                    if feed
                        .send(MeasurementEvent::Location(sample))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => {
                    debug!("location source ended");
                    break;
                }
            },
        }
    }
}

async fn pump_radio(mut source: impl RadioSource, feed: EventFeed, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            code = source.next_technology() => match code {
                Some(code) => {
                    if feed
                        .send(MeasurementEvent::Technology(code))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => {
                    debug!("radio source ended");
                    break;
                }
            },
        }
    }
}
