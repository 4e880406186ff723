//! Centralized tuning constants for transfer sessions.
//!
//! Everything time- or size-sensitive lives here so the transfer pipeline,
//! transport, and signaling layers stay in agreement without threading a
//! config struct through every call site.

use std::time::Duration;

// ── Chunking ────────────────────────────────────────────────────────────────

/// Size of each file slice read from disk and sent as one binary message.
///
/// 16 KiB sits comfortably below the 64 KiB SCTP message ceiling shared by
/// every mainstream WebRTC stack, so a chunk never needs fragmentation at
/// the transport layer.
pub const CHUNK_SIZE: usize = 16 * 1024;

// ── Backpressure ────────────────────────────────────────────────────────────

/// High watermark for the data channel's buffered amount.
///
/// The sender suspends disk reads while `buffered_amount` exceeds this, so
/// at most two chunks queue inside the channel at any moment.
pub const BUFFERED_AMOUNT_HIGH: usize = 2 * CHUNK_SIZE;

/// How often the sender re-checks `buffered_amount` while backpressure holds.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the sender re-checks `buffered_amount` while draining to zero
/// after the final chunk.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on a single backpressure or drain wait.
///
/// A channel whose buffered amount never falls for this long is treated as
/// dead and the session fails instead of spinning forever.
pub const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(30);

// ── Negotiation ─────────────────────────────────────────────────────────────

/// Maximum wait for ICE gathering to reach the `Complete` state.
///
/// Descriptors are exchanged without trickle, so the full candidate set must
/// be present before the SDP is published.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum wait for the data channel to open once the remote descriptor has
/// been applied. The preceding wait for a peer to appear is unbounded; this
/// one is not, because both sides are already committed.
pub const DATA_CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

// ── Transport ───────────────────────────────────────────────────────────────

/// Label of the single ordered, reliable data channel used per session.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// Whether ICE may offer loopback addresses as host candidates.
///
/// Required for two peers inside the same process or container, where `lo`
/// can be the only interface available.
pub const INCLUDE_LOOPBACK_CANDIDATES: bool = true;
