//! Rendezvous signaling: how two peers that share nothing but a session id
//! exchange their WebRTC descriptors.
//!
//! The store is a dumb key-value surface with change notification. Each
//! session owns exactly two slots:
//!
//! - `signaling/{session}/offer`, written by the sender
//! - `signaling/{session}/answer`, written by the receiver
//!
//! Every slot is write-once in practice, read once by the opposite role, and
//! purged by the consumer the moment it resolves. No transfer payload ever
//! touches the store.

mod memory;

pub use memory::MemoryStore;

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::core::error::TransferError;
use crate::utils::sos::SignalOfStop;

// ── Session identity ────────────────────────────────────────────────────────

/// Random identifier binding one sender and one receiver to a store path.
///
/// Travels out-of-band (chat, voice, QR) in its hyphenated text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Mint a fresh v4 identifier for a new sending session.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| TransferError::signaling(format!("not a valid session id: {s:?}")))
    }
}

// ── Slots and payloads ──────────────────────────────────────────────────────

/// The two descriptor slots a session occupies in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSlot {
    Offer,
    Answer,
}

impl SignalSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalSlot::Offer => "offer",
            SignalSlot::Answer => "answer",
        }
    }
}

impl fmt::Display for SignalSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store path for one descriptor slot of one session.
pub fn signal_path(session: SessionId, slot: SignalSlot) -> String {
    format!("signaling/{session}/{slot}")
}

/// JSON document stored in a descriptor slot.
///
/// Offers additionally advertise the file's name and size so the receiver
/// can show something before the first metadata frame arrives; the channel
/// metadata stays authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(rename = "type")]
    pub kind: SignalSlot,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl SignalPayload {
    pub fn offer(sdp: String, file_name: String, file_size: u64) -> Self {
        Self {
            kind: SignalSlot::Offer,
            sdp,
            file_name: Some(file_name),
            file_size: Some(file_size),
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SignalSlot::Answer,
            sdp,
            file_name: None,
            file_size: None,
        }
    }
}

// ── Store contract ──────────────────────────────────────────────────────────

/// Backend-agnostic rendezvous store.
///
/// Implementations only need three primitives; sessions build the
/// one-shot consume semantics on top via [`await_descriptor`].
pub trait RendezvousStore: Send + Sync + 'static {
    /// Write `payload` into a slot, replacing any previous value.
    fn publish(
        &self,
        session: SessionId,
        slot: SignalSlot,
        payload: SignalPayload,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Watch a slot. The receiver holds the current value (possibly `None`)
    /// and wakes on every subsequent write or purge.
    fn subscribe(
        &self,
        session: SessionId,
        slot: SignalSlot,
    ) -> impl Future<Output = Result<watch::Receiver<Option<SignalPayload>>, TransferError>> + Send;

    /// Delete a slot's value. Purging an absent slot is a no-op.
    fn purge(
        &self,
        session: SessionId,
        slot: SignalSlot,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Resolve a descriptor slot exactly once: wait for a value, stop watching,
/// purge the slot, return the payload.
///
/// Returns `Ok(None)` when `stop` fires first; the slot is left untouched in
/// that case. The wait itself is unbounded, peers may take minutes to show
/// up, so cancellation is the only way out.
pub async fn await_descriptor<S: RendezvousStore>(
    store: &S,
    session: SessionId,
    slot: SignalSlot,
    stop: &SignalOfStop,
) -> Result<Option<SignalPayload>, TransferError> {
    let mut rx = store.subscribe(session, slot).await?;
    let payload = loop {
        let current = rx.borrow_and_update().clone();
        if let Some(payload) = current {
            break payload;
        }
        match stop.select(rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => {
                return Err(TransferError::signaling(format!(
                    "watch on {} ended before a descriptor arrived",
                    signal_path(session, slot)
                )));
            }
            Err(()) => return Ok(None),
        }
    };
    drop(rx);
    store.purge(session, slot).await?;
    debug!(event = "descriptor_consumed", %session, %slot, "Descriptor consumed, slot purged");
    Ok(Some(payload))
}
