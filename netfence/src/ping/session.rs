//! The probing actor and its client handle.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire;
use super::ProbeError;
use crate::session::SessionInitError;

/// Largest server datagram we accept.
const MAX_DATAGRAM: usize = 512;

/// IP version preference for the probe socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Where and how to probe, as negotiated by the session layer.
#[derive(Debug, Clone)]
pub struct PingEndpoint {
    pub host: String,
    pub port: u16,
    /// Base64-encoded session token. Decoded once when the endpoint
    /// is opened; the raw bytes ride along in every request.
    pub token: String,
    pub ip_version: Option<IpVersion>,
    /// Stamp of the session grant this endpoint came from. Reported
    /// back on teardown so the source can tell whether the failed
    /// grant is still the one it would hand out.
    pub generation: u64,
}

/// Supplies ping endpoints on demand.
///
/// `stale` carries the generation of an endpoint the server rejected,
/// if any. A source that still holds that same grant should negotiate
/// a fresh one instead of handing it back.
pub trait SessionSource: Send + Sync + 'static {
    fn endpoint(
        &self,
        stale: Option<u64>,
    ) -> impl Future<Output = Result<PingEndpoint, SessionInitError>> + Send;
}

/// Ping session tuning.
#[derive(Debug, Clone)]
pub struct PingSessionConfig {
    /// How long a probe may stay unanswered before it times out.
    pub probe_timeout: Duration,

    /// Command channel capacity.
    pub command_capacity: usize,
}

impl Default for PingSessionConfig {
    fn default() -> Self {
        Self {
            probe_timeout: crate::config::DEFAULT_PROBE_TIMEOUT,
            command_capacity: 64,
        }
    }
}

enum PingCommand {
    Probe {
        reply: oneshot::Sender<Result<Duration, ProbeError>>,
    },
    /// Drop the endpoint so the next probe negotiates against the
    /// current grant. Used after a session renewal.
    Reset,
}

struct ActiveEndpoint {
    socket: UdpSocket,
    token: Vec<u8>,
    generation: u64,
}

struct PendingProbe {
    sent_at: std::time::Instant,
    deadline: Instant,
    reply: oneshot::Sender<Result<Duration, ProbeError>>,
}

/// Actor owning the UDP socket, the sequence counter, and the table
/// of in-flight probes.
///
/// The endpoint is lazy: nothing is negotiated or bound until the
/// first probe asks for it, and after a teardown the next probe
/// re-initiates transparently.
pub struct PingSession<S> {
    config: PingSessionConfig,
    source: S,
    commands: mpsc::Receiver<PingCommand>,
    cancel: CancellationToken,
    endpoint: Option<ActiveEndpoint>,
    /// Generation of the endpoint that was last torn down by the
    /// server, passed to the source on the next negotiation.
    stale: Option<u64>,
    pending: HashMap<u32, PendingProbe>,
    sequence: u32,
    probes_sent: u64,
    probes_failed: u64,
}

impl<S: SessionSource> PingSession<S> {
    /// Spawn the probing actor and return its client handle.
    pub fn spawn(
        config: PingSessionConfig,
        source: S,
        cancel: CancellationToken,
    ) -> (PingClient, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity);
        let session = Self {
            config,
            source,
            commands: rx,
            cancel,
            endpoint: None,
            stale: None,
            pending: HashMap::new(),
            sequence: 0,
            probes_sent: 0,
            probes_failed: 0,
        };
        let task = tokio::spawn(session.run());
        (PingClient { commands: tx }, task)
    }

    async fn run(mut self) {
        info!(
            timeout_ms = self.config.probe_timeout.as_millis() as u64,
            "ping session started"
        );
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let next_deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(PingCommand::Probe { reply }) => self.handle_probe(reply).await,
                    Some(PingCommand::Reset) => self.reset(),
                    None => break,
                },
                result = Self::recv_datagram(self.endpoint.as_ref(), &mut buf) => match result {
                    Ok(len) => self.handle_datagram(&buf[..len]),
                    Err(e) => {
                        warn!(error = %e, "socket receive failed, tearing down endpoint");
                        self.fail_all_pending(ProbeError::Transport(e.to_string()));
                        self.teardown();
                    }
                },
                _ = Self::sleep_until(next_deadline) => self.expire_overdue(Instant::now()),
            }
        }
        self.fail_all_pending(ProbeError::SessionClosed);
        info!(
            probes_sent = self.probes_sent,
            probes_failed = self.probes_failed,
            "ping session stopped"
        );
    }

    async fn handle_probe(&mut self, reply: oneshot::Sender<Result<Duration, ProbeError>>) {
        if let Err(e) = self.ensure_endpoint().await {
            self.probes_failed += 1;
            let _ = reply.send(Err(e));
            return;
        }
        let endpoint = match self.endpoint.as_ref() {
            Some(endpoint) => endpoint,
            None => {
                let _ = reply.send(Err(ProbeError::SessionClosed));
                return;
            }
        };

        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;
        let datagram = wire::encode_request(sequence, &endpoint.token);
        let sent_at = std::time::Instant::now();
        if let Err(e) = endpoint.socket.send(&datagram).await {
            warn!(sequence, error = %e, "probe send failed");
            self.probes_failed += 1;
            let _ = reply.send(Err(ProbeError::Transport(e.to_string())));
            return;
        }

        let deadline = Instant::now() + self.config.probe_timeout;
        self.pending.insert(
            sequence,
            PendingProbe {
                sent_at,
                deadline,
                reply,
            },
        );
        self.probes_sent += 1;
    }

    /// Negotiate and open the endpoint if none is active.
    async fn ensure_endpoint(&mut self) -> Result<(), ProbeError> {
        if self.endpoint.is_some() {
            return Ok(());
        }

        let endpoint = self
            .source
            .endpoint(self.stale)
            .await
            .map_err(|e| ProbeError::Initiation(e.to_string()))?;
        let token = BASE64
            .decode(endpoint.token.as_bytes())
            .map_err(|e| ProbeError::Initiation(format!("invalid session token: {e}")))?;
        let socket = Self::open_socket(&endpoint)
            .await
            .map_err(|e| ProbeError::Initiation(e.to_string()))?;

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            generation = endpoint.generation,
            "ping endpoint ready"
        );
        self.endpoint = Some(ActiveEndpoint {
            socket,
            token,
            generation: endpoint.generation,
        });
        self.stale = None;
        Ok(())
    }

    async fn open_socket(endpoint: &PingEndpoint) -> io::Result<UdpSocket> {
        let mut candidates = lookup_host((endpoint.host.as_str(), endpoint.port)).await?;
        let addr = candidates.find(|addr| match endpoint.ip_version {
            Some(IpVersion::V4) => addr.is_ipv4(),
            Some(IpVersion::V6) => addr.is_ipv6(),
            None => true,
        });
        let addr = match addr {
            Some(addr) => addr,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no address matched the requested IP version",
                ))
            }
        };

        let bind_addr = if addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        let response = match wire::parse_response(datagram) {
            Some(response) => response,
            None => {
                debug!(len = datagram.len(), "ignoring unrecognized datagram");
                return;
            }
        };
        match response {
            wire::Response::Success { sequence } => match self.pending.remove(&sequence) {
                Some(probe) => {
                    let _ = probe.reply.send(Ok(probe.sent_at.elapsed()));
                }
                None => debug!(sequence, "response for unknown probe, ignoring"),
            },
            wire::Response::Error { sequence } => {
                if let Some(probe) = self.pending.remove(&sequence) {
                    warn!(sequence, "server rejected probe, tearing down endpoint");
                    self.probes_failed += 1;
                    let _ = probe.reply.send(Err(ProbeError::NeedsReinitialization));
                } else {
                    // Error for a sequence we never sent (zero by
                    // convention) condemns the whole session.
                    warn!(
                        sequence,
                        pending = self.pending.len(),
                        "session-level error, failing all pending probes"
                    );
                    self.fail_all_pending(ProbeError::NeedsReinitialization);
                }
                self.teardown();
            }
        }
    }

    fn expire_overdue(&mut self, now: Instant) {
        let overdue: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, probe)| probe.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in overdue {
            if let Some(probe) = self.pending.remove(&sequence) {
                debug!(sequence, "probe timed out");
                self.probes_failed += 1;
                let _ = probe.reply.send(Err(ProbeError::TimedOut));
            }
        }
    }

    fn fail_all_pending(&mut self, error: ProbeError) {
        for (_, probe) in self.pending.drain() {
            self.probes_failed += 1;
            let _ = probe.reply.send(Err(error.clone()));
        }
    }

    /// Drop the endpoint after a server-side rejection, remembering
    /// which grant failed.
    fn teardown(&mut self) {
        if let Some(active) = self.endpoint.take() {
            self.stale = Some(active.generation);
            debug!(generation = active.generation, "ping endpoint torn down");
        }
    }

    /// Drop the endpoint without blaming the grant. The next probe
    /// negotiates against whatever the source currently holds.
    fn reset(&mut self) {
        self.endpoint = None;
        self.stale = None;
        debug!("ping endpoint reset");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|probe| probe.deadline).min()
    }

    async fn recv_datagram(
        endpoint: Option<&ActiveEndpoint>,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        match endpoint {
            Some(active) => active.socket.recv(buf).await,
            None => std::future::pending::<io::Result<usize>>().await,
        }
    }

    async fn sleep_until(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}

/// Cloneable handle for running probes against the session actor.
#[derive(Clone)]
pub struct PingClient {
    commands: mpsc::Sender<PingCommand>,
}

impl PingClient {
    /// Run a single probe and wait for its outcome.
    pub async fn probe(&self) -> Result<Duration, ProbeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PingCommand::Probe { reply })
            .await
            .map_err(|_| ProbeError::SessionClosed)?;
        response.await.map_err(|_| ProbeError::SessionClosed)?
    }

    /// Ask the actor to drop its endpoint and renegotiate lazily.
    pub async fn reset(&self) {
        let _ = self.commands.send(PingCommand::Reset).await;
    }
}
