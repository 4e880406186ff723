//! Peer-to-peer file handoff over WebRTC data channels.
//!
//! Two peers that share nothing but a session id meet through a rendezvous
//! key-value store, negotiate a direct connection, and stream one file over
//! a single ordered, reliable data channel: a JSON metadata frame, raw
//! 16 KiB chunks, then an EOF marker. The store carries only SDP
//! descriptors; file bytes never touch it.
//!
//! Hosts drive everything through [`TransferService`] and react to the
//! [`SessionMessage`] stream it emits. The store is pluggable via
//! [`RendezvousStore`]; [`MemoryStore`] ships for in-process use and tests.

pub mod core;
pub mod utils;

pub use crate::core::config;
pub use crate::core::error::TransferError;
pub use crate::core::events::{ReceivedFile, Role, SessionMessage};
pub use crate::core::service::TransferService;
pub use crate::core::session::TransferState;
pub use crate::core::signaling::{
    MemoryStore, RendezvousStore, SessionId, SignalPayload, SignalSlot,
};
pub use crate::utils::sos::SignalOfStop;
