//! Single-writer worker owning the spool.
//!
//! [`SpoolStore`] is not safe for concurrent mutation, so exactly one
//! task owns it and every caller goes through a [`StoreHandle`]. Each
//! command carries a oneshot reply channel; because the worker
//! processes its queue in FIFO order, write ordering across the engine
//! follows command submission order. In particular, an identity
//! assignment can never interleave halfway into a fence save.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::spool::{CleanupSummary, SpoolStore};
use super::{CoverageSubSession, StartMode, StoreError};
use crate::fence::Fence;

/// Queue depth for store commands. Writers await capacity, so this
/// only bounds burst size.
const COMMAND_CAPACITY: usize = 256;

/// Commands accepted by the store worker.
#[derive(Debug)]
enum StoreCommand {
    Begin {
        at: DateTime<Utc>,
        loop_uuid: Option<String>,
        reply: oneshot::Sender<Result<Uuid, StoreError>>,
    },
    SaveFence {
        fence: Fence,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    AssignIdentity {
        test_uuid: String,
        anchor_at: DateTime<Utc>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    FinalizeCurrent {
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<Uuid, StoreError>>,
    },
    Eligible {
        mode: StartMode,
        reply: oneshot::Sender<Vec<CoverageSubSession>>,
    },
    Delete {
        id: Uuid,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Cleanup {
        now: DateTime<Utc>,
        max_age: Duration,
        reply: oneshot::Sender<Result<CleanupSummary, StoreError>>,
    },
}

/// The worker task owning the spool.
pub struct StoreWorker {
    store: SpoolStore,
    rx: mpsc::Receiver<StoreCommand>,
}

impl StoreWorker {
    /// Spawn a worker over the given spool. Returns the handle and the
    /// worker's join handle. The worker exits once every handle clone
    /// has been dropped.
    pub fn spawn(store: SpoolStore) -> (StoreHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let worker = Self { store, rx };
        let task = tokio::spawn(worker.run());
        (StoreHandle { tx }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }
        debug!(records = self.store.record_count(), "store worker stopped");
    }

    fn handle(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::Begin {
                at,
                loop_uuid,
                reply,
            } => {
                let _ = reply.send(self.store.begin_sub_session(at, loop_uuid));
            }
            StoreCommand::SaveFence { fence, reply } => {
                let _ = reply.send(self.store.save_fence(fence));
            }
            StoreCommand::AssignIdentity {
                test_uuid,
                anchor_at,
                reply,
            } => {
                let _ = reply.send(self.store.assign_identity(test_uuid, anchor_at));
            }
            StoreCommand::FinalizeCurrent { at, reply } => {
                let _ = reply.send(self.store.finalize_current(at));
            }
            StoreCommand::Eligible { mode, reply } => {
                let _ = reply.send(self.store.eligible(mode));
            }
            StoreCommand::Delete { id, reply } => {
                let _ = reply.send(self.store.delete(id));
            }
            StoreCommand::Cleanup {
                now,
                max_age,
                reply,
            } => {
                let _ = reply.send(self.store.cleanup(now, max_age));
            }
        }
    }
}

/// Clone-able handle to the store worker.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    async fn dispatch<T>(
        &self,
        command: StoreCommand,
        rx: oneshot::Receiver<Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StoreError::WorkerGone)?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Begin a new sub-session and make it current.
    pub async fn begin_sub_session(
        &self,
        at: DateTime<Utc>,
        loop_uuid: Option<String>,
    ) -> Result<Uuid, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            StoreCommand::Begin {
                at,
                loop_uuid,
                reply,
            },
            rx,
        )
        .await
    }

    /// Persist a fence into the current sub-session.
    pub async fn save_fence(&self, fence: Fence) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(StoreCommand::SaveFence { fence, reply }, rx)
            .await
    }

    /// Atomically assign the server identity and anchor to the current
    /// sub-session.
    pub async fn assign_identity(
        &self,
        test_uuid: String,
        anchor_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            StoreCommand::AssignIdentity {
                test_uuid,
                anchor_at,
                reply,
            },
            rx,
        )
        .await
    }

    /// End the current sub-session.
    pub async fn finalize_current(&self, at: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(StoreCommand::FinalizeCurrent { at, reply }, rx)
            .await
    }

    /// Sub-sessions eligible for delivery in the given start mode.
    pub async fn eligible(&self, mode: StartMode) -> Result<Vec<CoverageSubSession>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Eligible { mode, reply })
            .await
            .map_err(|_| StoreError::WorkerGone)?;
        rx.await.map_err(|_| StoreError::WorkerGone)
    }

    /// Delete a sub-session and its spool document.
    pub async fn delete_sub_session(&self, id: Uuid) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(StoreCommand::Delete { id, reply }, rx).await
    }

    /// Run an age-based cleanup pass.
    pub async fn cleanup(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<CleanupSummary, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            StoreCommand::Cleanup {
                now,
                max_age,
                reply,
            },
            rx,
        )
        .await
    }
}
