//! Host-facing facade: start a send, start a receive, reset.
//!
//! The service owns the store handle and at most one live session per role.
//! Starting a role that is already running tears the old session down first,
//! and `reset` is not complete until the session tasks have fully unwound,
//! so a host can restart immediately without racing leftover state.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::error::TransferError;
use crate::core::events::{Role, SessionMessage};
use crate::core::pipeline::ChunkSource;
use crate::core::session::{run_receiver, run_sender};
use crate::core::signaling::{RendezvousStore, SessionId};
use crate::utils::sos::SignalOfStop;

/// One live session task and its cancellation handle.
struct ActiveSession {
    session: SessionId,
    stop: SignalOfStop,
    task: JoinHandle<()>,
}

/// Entry point for hosts: spawns session tasks and fans their messages into
/// one channel.
pub struct TransferService<S: RendezvousStore> {
    store: Arc<S>,
    host_tx: mpsc::UnboundedSender<SessionMessage>,
    sending: Option<ActiveSession>,
    receiving: Option<ActiveSession>,
}

impl<S: RendezvousStore> TransferService<S> {
    /// Build a service and the message stream the host should consume.
    pub fn new(store: Arc<S>) -> (Self, mpsc::UnboundedReceiver<SessionMessage>) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                host_tx,
                sending: None,
                receiving: None,
            },
            host_rx,
        )
    }

    /// Begin sending `path`, replacing any sending session already running.
    ///
    /// The file is opened before anything is spawned, so an unreadable path
    /// fails here instead of surfacing later as a session failure. Returns
    /// the session id to hand to the receiving peer out-of-band.
    pub async fn start_send(&mut self, path: impl AsRef<Path>) -> Result<SessionId, TransferError> {
        self.stop_role(Role::Sender).await;

        let path = path.as_ref();
        let source = ChunkSource::open(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let session = SessionId::generate();
        let stop = SignalOfStop::new();
        info!(
            event = "send_session_starting",
            %session,
            file = %file_name,
            size = source.total_size(),
            "Spawning sender"
        );
        let task = tokio::spawn(run_sender(
            self.store.clone(),
            session,
            file_name,
            source,
            self.host_tx.clone(),
            stop.clone(),
        ));
        self.sending = Some(ActiveSession {
            session,
            stop,
            task,
        });
        Ok(session)
    }

    /// Begin receiving the transfer published under `session`, replacing any
    /// receiving session already running.
    pub async fn start_receive(&mut self, session: SessionId) {
        self.stop_role(Role::Receiver).await;

        let stop = SignalOfStop::new();
        info!(event = "receive_session_starting", %session, "Spawning receiver");
        let task = tokio::spawn(run_receiver(
            self.store.clone(),
            session,
            self.host_tx.clone(),
            stop.clone(),
        ));
        self.receiving = Some(ActiveSession {
            session,
            stop,
            task,
        });
    }

    /// Cancel both roles and wait until their tasks have fully unwound,
    /// transport closed and store slots cleared included.
    pub async fn reset(&mut self) {
        self.stop_role(Role::Sender).await;
        self.stop_role(Role::Receiver).await;
    }

    async fn stop_role(&mut self, role: Role) {
        let active = match role {
            Role::Sender => self.sending.take(),
            Role::Receiver => self.receiving.take(),
        };
        if let Some(active) = active {
            info!(event = "session_stopping", session = %active.session, %role, "Cancelling session task");
            active.stop.cancel();
            if let Err(err) = active.task.await {
                warn!(
                    event = "session_join_failed",
                    session = %active.session,
                    error = %err,
                    "Session task ended abnormally"
                );
            }
        }
    }
}

impl<S: RendezvousStore> Drop for TransferService<S> {
    fn drop(&mut self) {
        // Tasks cannot be joined here; cancellation lets them unwind on
        // their own.
        if let Some(active) = &self.sending {
            active.stop.cancel();
        }
        if let Some(active) = &self.receiving {
            active.stop.cancel();
        }
    }
}
