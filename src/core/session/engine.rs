//! Pure per-session state machine.
//!
//! Every stimulus a session can receive, store resolutions, channel traffic,
//! driver milestones, failures, is normalized into a [`SessionEvent`] and fed
//! through [`SessionEngine::process_event`]. The engine owns the state
//! transitions, byte accounting, and reassembly, and answers with an
//! [`EngineOutcome`]: IO for the driver to perform plus an optional status
//! line for the host. It never awaits and never touches the network, so the
//! whole protocol is testable without a peer.

use std::fmt;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::core::error::TransferError;
use crate::core::events::{ReceivedFile, Role};
use crate::core::pipeline::Reassembler;
use crate::core::progress::ProgressReporter;
use crate::core::session::wire::{self, ControlMessage};
use crate::core::signaling::{SignalPayload, SignalSlot};

// ── States ──────────────────────────────────────────────────────────────────

/// Lifecycle of one transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Constructed but not yet started.
    Idle,
    /// Waiting for the counterpart descriptor in the rendezvous store.
    AwaitingPeer,
    /// Descriptor consumed; negotiation and channel-open in flight.
    Connecting,
    /// Payload moving on the data channel.
    Transferring,
    Completed,
    Failed { reason: String },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed { .. })
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Idle => "idle",
            TransferState::AwaitingPeer => "awaiting-peer",
            TransferState::Connecting => "connecting",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Failed { .. } => "failed",
        };
        f.write_str(name)
    }
}

// ── Events and actions ──────────────────────────────────────────────────────

/// One stimulus for the engine, drawn from the session's single inbound queue.
#[derive(Debug)]
pub enum SessionEvent {
    /// The counterpart descriptor resolved from the rendezvous store.
    DescriptorResolved(SignalPayload),
    /// The data channel reported open.
    ChannelOpen,
    /// A text frame arrived on the channel.
    ChannelText(String),
    /// A binary frame arrived on the channel.
    ChannelBinary(Bytes),
    /// The channel closed, gracefully or not.
    ChannelClosed,
    /// The channel or peer connection reported an error.
    ChannelError(String),
    /// Driver milestone: one chunk was handed to the channel.
    ChunkSent { bytes: u64 },
    /// Driver milestone: all chunks and the terminal marker are enqueued.
    SendFinished,
    /// Driver milestone: the channel's buffered amount reached zero.
    Drained,
    /// Driver-detected failure outside the engine's sight.
    Fault(TransferError),
}

impl SessionEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            SessionEvent::DescriptorResolved(_) => "descriptor_resolved",
            SessionEvent::ChannelOpen => "channel_open",
            SessionEvent::ChannelText(_) => "channel_text",
            SessionEvent::ChannelBinary(_) => "channel_binary",
            SessionEvent::ChannelClosed => "channel_closed",
            SessionEvent::ChannelError(_) => "channel_error",
            SessionEvent::ChunkSent { .. } => "chunk_sent",
            SessionEvent::SendFinished => "send_finished",
            SessionEvent::Drained => "drained",
            SessionEvent::Fault(_) => "fault",
        }
    }
}

/// IO the driver must perform in response to an event.
#[derive(Debug)]
pub enum SessionAction {
    /// Apply the peer's descriptor to the local connection; the receiving
    /// role also answers it.
    ApplyRemoteDescriptor(SignalPayload),
    /// Start the chunk pump.
    BeginStreaming,
    /// Poll the channel's buffered amount down to zero.
    AwaitDrain,
    /// Report a progress change to the host.
    EmitProgress { percent: u8 },
    /// Report terminal success to the host.
    EmitCompleted { received: Option<ReceivedFile> },
    /// Report terminal failure to the host.
    EmitFailed { reason: String },
    /// Close the data channel and peer connection.
    ReleaseTransport,
}

/// What one event produced: IO to perform plus an optional status line.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    pub actions: Vec<SessionAction>,
    pub status: Option<String>,
}

impl EngineOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    fn with_status(status: impl Into<String>) -> Self {
        Self {
            actions: Vec::new(),
            status: Some(status.into()),
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// State machine for one session, one role.
pub struct SessionEngine {
    role: Role,
    state: TransferState,
    file_name: String,
    total_size: u64,
    sent: u64,
    send_finished: bool,
    reporter: ProgressReporter,
    reassembler: Reassembler,
}

impl SessionEngine {
    pub fn new_sender(file_name: impl Into<String>, total_size: u64) -> Self {
        Self {
            role: Role::Sender,
            state: TransferState::Idle,
            file_name: file_name.into(),
            total_size,
            sent: 0,
            send_finished: false,
            reporter: ProgressReporter::new(),
            reassembler: Reassembler::new(),
        }
    }

    pub fn new_receiver() -> Self {
        Self {
            role: Role::Receiver,
            state: TransferState::Idle,
            file_name: String::new(),
            total_size: 0,
            sent: 0,
            send_finished: false,
            reporter: ProgressReporter::new(),
            reassembler: Reassembler::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Leave `Idle`. Separate from construction so the initial status flows
    /// through the same outcome path as everything else.
    pub fn start(&mut self) -> EngineOutcome {
        if self.state != TransferState::Idle {
            warn!(event = "start_ignored", state = %self.state, "Engine already started");
            return EngineOutcome::empty();
        }
        self.state = TransferState::AwaitingPeer;
        info!(event = "session_started", role = %self.role, "Session entering AwaitingPeer");
        match self.role {
            Role::Sender => EngineOutcome::with_status("Creating connection and generating offer..."),
            Role::Receiver => EngineOutcome::with_status("Looking for offer..."),
        }
    }

    /// Feed one event through the state machine.
    pub fn process_event(&mut self, event: SessionEvent) -> EngineOutcome {
        if self.state.is_terminal() {
            // Close and error callbacks routinely fire during teardown.
            debug!(
                event = "event_after_terminal",
                kind = event.kind(),
                state = %self.state,
                "Dropping event in terminal state"
            );
            return EngineOutcome::empty();
        }
        match event {
            SessionEvent::DescriptorResolved(payload) => self.on_descriptor(payload),
            SessionEvent::ChannelOpen => self.on_channel_open(),
            SessionEvent::ChannelText(text) => self.on_channel_text(&text),
            SessionEvent::ChannelBinary(chunk) => self.on_channel_binary(chunk),
            SessionEvent::ChannelClosed => self.on_channel_closed(),
            SessionEvent::ChannelError(detail) => self.fail(TransferError::transport(detail)),
            SessionEvent::ChunkSent { bytes } => self.on_chunk_sent(bytes),
            SessionEvent::SendFinished => self.on_send_finished(),
            SessionEvent::Drained => self.on_drained(),
            SessionEvent::Fault(err) => self.fail(err),
        }
    }

    // ── Negotiation ─────────────────────────────────────────────────────

    fn on_descriptor(&mut self, payload: SignalPayload) -> EngineOutcome {
        if self.state != TransferState::AwaitingPeer {
            warn!(
                event = "descriptor_ignored",
                role = %self.role,
                state = %self.state,
                "Descriptor outside AwaitingPeer"
            );
            return EngineOutcome::empty();
        }
        let expected = match self.role {
            Role::Sender => SignalSlot::Answer,
            Role::Receiver => SignalSlot::Offer,
        };
        if payload.kind != expected {
            return self.fail(TransferError::signaling(format!(
                "malformed descriptor: expected an {expected}, got an {}",
                payload.kind
            )));
        }
        if self.role == Role::Receiver {
            if let Some(name) = payload.file_name.clone() {
                self.reassembler.hint_name(name);
            }
        }
        self.state = TransferState::Connecting;
        info!(event = "descriptor_resolved", role = %self.role, "Remote descriptor consumed");
        let status = match self.role {
            Role::Sender => "Answer received. Connecting...",
            Role::Receiver => "Offer received. Connecting...",
        };
        EngineOutcome {
            actions: vec![SessionAction::ApplyRemoteDescriptor(payload)],
            status: Some(status.into()),
        }
    }

    fn on_channel_open(&mut self) -> EngineOutcome {
        if self.state != TransferState::Connecting {
            debug!(event = "channel_open_ignored", state = %self.state, "Open outside Connecting");
            return EngineOutcome::empty();
        }
        self.state = TransferState::Transferring;
        info!(event = "channel_open", role = %self.role, "Data channel open");
        match self.role {
            Role::Sender => EngineOutcome {
                actions: vec![SessionAction::BeginStreaming],
                status: Some(format!("Data channel open. Sending {}...", self.file_name)),
            },
            // The driver already announced the connection when it published
            // the answer; a second status here would duplicate it.
            Role::Receiver => EngineOutcome::empty(),
        }
    }

    // ── Inbound traffic (receiver) ──────────────────────────────────────

    fn on_channel_text(&mut self, text: &str) -> EngineOutcome {
        if self.role == Role::Sender {
            warn!(event = "unexpected_text_frame", "Sender got a text frame; ignoring");
            return EngineOutcome::empty();
        }
        // A frame on the wire implies the channel is live even if the open
        // callback has not been observed yet.
        if self.state == TransferState::Connecting {
            self.state = TransferState::Transferring;
        }
        if self.state != TransferState::Transferring {
            warn!(event = "text_frame_ignored", state = %self.state, "Text frame outside Transferring");
            return EngineOutcome::empty();
        }
        match wire::decode(text) {
            Some(ControlMessage::Metadata { name, size }) => {
                match self.reassembler.on_metadata(name.clone(), size) {
                    Ok(()) => {
                        info!(
                            event = "metadata_received",
                            file = %name,
                            size,
                            "Transfer metadata announced"
                        );
                        let mut outcome =
                            EngineOutcome::with_status(format!("Receiving {name} ({size} bytes)..."));
                        // Chunks may have raced ahead of the metadata frame.
                        if let Some(pct) =
                            self.reporter.record(self.reassembler.received_bytes(), size)
                        {
                            outcome
                                .actions
                                .push(SessionAction::EmitProgress { percent: pct });
                        }
                        outcome
                    }
                    Err(err) => self.fail(err),
                }
            }
            Some(ControlMessage::Eof) => self.finalize(true),
            None => {
                warn!(
                    event = "unrecognized_text_frame",
                    len = text.len(),
                    "Ignoring non-control text frame"
                );
                EngineOutcome::empty()
            }
        }
    }

    fn on_channel_binary(&mut self, chunk: Bytes) -> EngineOutcome {
        if self.role == Role::Sender {
            warn!(event = "unexpected_binary_frame", "Sender got a binary frame; ignoring");
            return EngineOutcome::empty();
        }
        if self.state == TransferState::Connecting {
            self.state = TransferState::Transferring;
        }
        if self.state != TransferState::Transferring {
            warn!(event = "binary_frame_ignored", state = %self.state, "Chunk outside Transferring");
            return EngineOutcome::empty();
        }
        self.reassembler.on_chunk(chunk);
        // Progress stays silent until the declared size is known.
        if let Some(expected) = self.reassembler.expected_size() {
            if expected > 0 {
                if let Some(pct) = self
                    .reporter
                    .record(self.reassembler.received_bytes(), expected)
                {
                    return EngineOutcome {
                        actions: vec![SessionAction::EmitProgress { percent: pct }],
                        status: Some(format!("Receiving file: {pct}%")),
                    };
                }
            }
        }
        EngineOutcome::empty()
    }

    fn on_channel_closed(&mut self) -> EngineOutcome {
        match self.role {
            Role::Sender => {
                // Any close before the drain confirms delivery is a failure.
                self.fail(TransferError::transport(
                    "data channel closed before the transfer finished",
                ))
            }
            Role::Receiver => match self.state {
                TransferState::Transferring => self.finalize(false),
                _ => self.fail(TransferError::transport(
                    "data channel closed during negotiation",
                )),
            },
        }
    }

    // ── Outbound milestones (sender) ────────────────────────────────────

    fn on_chunk_sent(&mut self, bytes: u64) -> EngineOutcome {
        if self.role != Role::Sender || self.state != TransferState::Transferring {
            debug!(event = "chunk_milestone_ignored", state = %self.state, "ChunkSent outside Transferring");
            return EngineOutcome::empty();
        }
        self.sent += bytes;
        if let Some(pct) = self.reporter.record(self.sent, self.total_size) {
            return EngineOutcome {
                actions: vec![SessionAction::EmitProgress { percent: pct }],
                status: Some(format!("Sending file: {pct}%")),
            };
        }
        EngineOutcome::empty()
    }

    fn on_send_finished(&mut self) -> EngineOutcome {
        if self.role != Role::Sender || self.state != TransferState::Transferring {
            debug!(event = "send_finished_ignored", state = %self.state, "SendFinished outside Transferring");
            return EngineOutcome::empty();
        }
        self.send_finished = true;
        debug!(
            event = "send_finished",
            sent = self.sent,
            "All chunks and the terminal marker enqueued"
        );
        EngineOutcome {
            actions: vec![SessionAction::AwaitDrain],
            status: None,
        }
    }

    fn on_drained(&mut self) -> EngineOutcome {
        if self.role != Role::Sender
            || !self.send_finished
            || self.state != TransferState::Transferring
        {
            debug!(event = "drain_milestone_ignored", state = %self.state, "Drained out of order");
            return EngineOutcome::empty();
        }
        self.state = TransferState::Completed;
        info!(
            event = "transfer_complete",
            role = %self.role,
            sent = self.sent,
            "Send side fully flushed"
        );
        let mut actions = Vec::new();
        // Zero-byte files never see a chunk milestone; top up to 100 here.
        if let Some(pct) = self.reporter.record(self.total_size, self.total_size) {
            actions.push(SessionAction::EmitProgress { percent: pct });
        }
        actions.push(SessionAction::EmitCompleted { received: None });
        actions.push(SessionAction::ReleaseTransport);
        EngineOutcome {
            actions,
            status: Some("File transfer complete.".into()),
        }
    }

    // ── Terminal paths ──────────────────────────────────────────────────

    /// Receiver-side close-out, shared by the EOF frame (`graceful`) and an
    /// ungraceful channel close.
    fn finalize(&mut self, graceful: bool) -> EngineOutcome {
        let received = self.reassembler.received_bytes();
        let expected = self.reassembler.expected_size();
        if received == 0 && expected.map_or(false, |e| e > 0) {
            return self.fail(TransferError::protocol(
                "connection closed before any file data arrived",
            ));
        }
        if !graceful {
            warn!(
                event = "ungraceful_close",
                received,
                expected = ?expected,
                "Channel closed without a terminal marker; assembling what arrived"
            );
        }
        let file = self.reassembler.finalize();
        let mut actions = Vec::new();
        if let Some(e) = expected {
            if let Some(pct) = self.reporter.record(received, e) {
                actions.push(SessionAction::EmitProgress { percent: pct });
            }
        }
        let status = match expected {
            Some(e) if e != received => {
                warn!(
                    event = "size_mismatch",
                    received,
                    expected = e,
                    "Received byte count differs from the declared size"
                );
                format!("Transfer ended early: received {received} of {e} bytes.")
            }
            Some(_) => "File transfer complete.".to_string(),
            None => format!("File received ({received} bytes, declared size unknown)."),
        };
        self.state = TransferState::Completed;
        info!(
            event = "transfer_complete",
            role = %self.role,
            received,
            "Inbound file assembled"
        );
        actions.push(SessionAction::EmitCompleted {
            received: Some(file),
        });
        actions.push(SessionAction::ReleaseTransport);
        EngineOutcome {
            actions,
            status: Some(status),
        }
    }

    fn fail(&mut self, err: TransferError) -> EngineOutcome {
        let reason = err.to_string();
        error!(
            event = "session_failed",
            role = %self.role,
            %reason,
            "Session entering the failed state"
        );
        self.state = TransferState::Failed {
            reason: reason.clone(),
        };
        EngineOutcome {
            actions: vec![
                SessionAction::EmitFailed {
                    reason: reason.clone(),
                },
                SessionAction::ReleaseTransport,
            ],
            status: Some(format!("Transfer failed: {reason}")),
        }
    }
}
