//! The session coordinator.
//!
//! Owns the current grant and everything that has to happen when it
//! changes: negotiating with the provider, finalizing the outgoing
//! sub-session record, beginning the chained successor, and stamping
//! the server identity onto the current record.
//!
//! Renewal is request-first. The installed grant stays in place until
//! the provider answers, so a failed renewal degrades to "keep
//! probing on the old session and try again next tick" instead of
//! tearing the measurement down.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    SessionGrant, SessionInitError, SessionProvider, SessionRequest, SessionWindows,
    WindowVerdict,
};
use crate::event::EventFeed;
use crate::ping::{PingEndpoint, SessionSource};
use crate::store::StoreHandle;

struct GrantState {
    grant: SessionGrant,
    /// Monotonic stamp distinguishing this grant from its
    /// predecessors, carried into the ping endpoint.
    generation: u64,
    installed_at: Instant,
}

struct Inner {
    current: Option<GrantState>,
    next_generation: u64,
}

pub struct SessionCoordinator {
    provider: Arc<dyn SessionProvider>,
    store: StoreHandle,
    feed: EventFeed,
    started_at: Instant,
    inner: Mutex<Inner>,
}

impl SessionCoordinator {
    /// Create a coordinator with no grant installed. The first
    /// endpoint request negotiates one.
    pub fn new(provider: Arc<dyn SessionProvider>, store: StoreHandle, feed: EventFeed) -> Self {
        Self {
            provider,
            store,
            feed,
            started_at: Instant::now(),
            inner: Mutex::new(Inner {
                current: None,
                next_generation: 1,
            }),
        }
    }

    /// Resolve the ping endpoint for the current grant, negotiating a
    /// fresh grant first when none is installed or the caller reports
    /// the installed one as rejected.
    pub async fn ping_endpoint(
        &self,
        stale: Option<u64>,
    ) -> Result<PingEndpoint, SessionInitError> {
        let mut inner = self.inner.lock().await;
        let need_new = match &inner.current {
            Some(state) => stale == Some(state.generation),
            None => true,
        };
        if need_new {
            self.request_and_install(&mut inner).await?;
        }
        match &inner.current {
            Some(state) => Ok(Self::endpoint_of(state)),
            None => Err(SessionInitError::new("no session grant installed")),
        }
    }

    /// Judge the current grant against its lifetime windows.
    pub async fn window_verdict(&self) -> WindowVerdict {
        let inner = self.inner.lock().await;
        match &inner.current {
            Some(state) => {
                let windows = SessionWindows {
                    max_sub_session: state.grant.max_sub_session,
                    max_total: state.grant.max_total,
                };
                windows.verdict(self.started_at.elapsed(), state.installed_at.elapsed())
            }
            None => WindowVerdict::Continue,
        }
    }

    /// Negotiate a replacement grant because the current one ran out
    /// its window.
    ///
    /// Rechecks under the lock: if another caller rotated the grant
    /// while this one waited, there is nothing left to do.
    pub async fn renew(&self) -> Result<(), SessionInitError> {
        let mut inner = self.inner.lock().await;
        let due = match &inner.current {
            Some(state) => {
                !state.grant.max_sub_session.is_zero()
                    && state.installed_at.elapsed() >= state.grant.max_sub_session
            }
            None => true,
        };
        if !due {
            debug!("grant already rotated, skipping renewal");
            return Ok(());
        }
        self.request_and_install(&mut inner).await
    }

    async fn request_and_install(&self, inner: &mut Inner) -> Result<(), SessionInitError> {
        let previous = inner
            .current
            .as_ref()
            .map(|state| state.grant.test_uuid.clone());
        let grant = self
            .provider
            .request_session(SessionRequest {
                previous_test_uuid: previous.clone(),
            })
            .await?;

        let now = Utc::now();
        if previous.is_some() {
            // Sub-session rotation. Fences settling in the aggregator
            // must land in the outgoing record, so drain them behind
            // a flush barrier before finalizing it.
            if self.feed.flush().await.is_err() {
                debug!("event feed closed, skipping flush barrier");
            }
            if let Err(e) = self.store.finalize_current(now).await {
                warn!(error = %e, "failed to finalize sub-session before rotation");
            }
            if let Err(e) = self.store.begin_sub_session(now, previous).await {
                warn!(error = %e, "failed to begin chained sub-session");
            }
        }
        if let Err(e) = self
            .store
            .assign_identity(grant.test_uuid.clone(), now)
            .await
        {
            warn!(error = %e, "failed to record sub-session identity");
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        info!(test_uuid = %grant.test_uuid, generation, "session grant installed");
        inner.current = Some(GrantState {
            grant,
            generation,
            installed_at: Instant::now(),
        });
        Ok(())
    }

    fn endpoint_of(state: &GrantState) -> PingEndpoint {
        PingEndpoint {
            host: state.grant.ping_host.clone(),
            port: state.grant.ping_port,
            token: state.grant.ping_token.clone(),
            ip_version: state.grant.ip_version,
            generation: state.generation,
        }
    }
}

impl SessionSource for Arc<SessionCoordinator> {
    fn endpoint(
        &self,
        stale: Option<u64>,
    ) -> impl std::future::Future<Output = Result<PingEndpoint, SessionInitError>> + Send {
        let coordinator = Arc::clone(self);
        async move { coordinator.ping_endpoint(stale).await }
    }
}
