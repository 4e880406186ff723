//! Session drivers: one spawned task per role, one inbound event queue each.
//!
//! A driver owns all IO for its session: rendezvous resolution, negotiation,
//! the chunk pump, and teardown. Protocol decisions stay inside the
//! [`SessionEngine`]; the driver feeds it events, performs the actions it
//! returns, and relays its statuses to the host. Cancellation is raced at
//! every suspension point, so `reset` never waits on a stuck peer.

pub mod engine;
pub mod wire;

pub use engine::{EngineOutcome, SessionAction, SessionEngine, SessionEvent, TransferState};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::{CHUNK_SIZE, DATA_CHANNEL_OPEN_TIMEOUT};
use crate::core::error::TransferError;
use crate::core::events::{notify_host, HostSender, Role, SessionMessage};
use crate::core::pipeline::ChunkSource;
use crate::core::session::wire::ControlMessage;
use crate::core::signaling::{
    await_descriptor, RendezvousStore, SessionId, SignalPayload, SignalSlot,
};
use crate::core::transport::{await_drained, await_sendable, PeerLink};
use crate::utils::sos::SignalOfStop;

/// Everything a flow step needs, bundled to keep signatures flat.
struct SessionCtx<'a, S: RendezvousStore> {
    store: &'a S,
    session: SessionId,
    engine: &'a mut SessionEngine,
    link: &'a PeerLink,
    events: &'a mut mpsc::UnboundedReceiver<SessionEvent>,
    host: &'a HostSender,
    stop: &'a SignalOfStop,
}

fn reset_error() -> TransferError {
    TransferError::transport("session reset")
}

/// Relay an outcome's status and host-facing actions.
fn emit_engine(host: &HostSender, role: Role, outcome: &EngineOutcome) {
    if let Some(status) = &outcome.status {
        notify_host(host, SessionMessage::Status(status.clone()));
    }
    for action in &outcome.actions {
        match action {
            SessionAction::EmitProgress { percent } => notify_host(
                host,
                SessionMessage::Progress {
                    role,
                    percent: *percent,
                },
            ),
            SessionAction::EmitCompleted { received } => notify_host(
                host,
                SessionMessage::Completed {
                    role,
                    received: received.clone(),
                },
            ),
            SessionAction::EmitFailed { reason } => notify_host(
                host,
                SessionMessage::Failed {
                    role,
                    reason: reason.clone(),
                },
            ),
            _ => {}
        }
    }
}

fn take_remote_descriptor(outcome: EngineOutcome) -> Option<SignalPayload> {
    outcome.actions.into_iter().find_map(|action| match action {
        SessionAction::ApplyRemoteDescriptor(payload) => Some(payload),
        _ => None,
    })
}

/// Fold a flow result into the engine: cancellations end quietly, real
/// errors become a terminal `Fault`.
fn conclude(
    result: Result<(), TransferError>,
    engine: &mut SessionEngine,
    role: Role,
    host: &HostSender,
    stop: &SignalOfStop,
) {
    match result {
        Ok(()) => {}
        Err(_) if stop.cancelled() => {
            info!(event = "session_cancelled", %role, "Session stopped by the host");
        }
        Err(err) => emit_engine(host, role, &engine.process_event(SessionEvent::Fault(err))),
    }
}

/// Close the transport and clear this role's own published slot. Purging is
/// idempotent, so it is safe even when the peer already consumed the slot.
async fn teardown<S: RendezvousStore>(
    store: &S,
    session: SessionId,
    own_slot: SignalSlot,
    link: &PeerLink,
) {
    link.close().await;
    if let Err(err) = store.purge(session, own_slot).await {
        warn!(
            event = "teardown_purge_failed",
            %session,
            slot = %own_slot,
            error = %err,
            "Could not clear the published descriptor"
        );
    }
    info!(event = "session_torn_down", %session, "Session resources released");
}

// ── Sender ──────────────────────────────────────────────────────────────────

pub(crate) async fn run_sender<S: RendezvousStore>(
    store: Arc<S>,
    session: SessionId,
    file_name: String,
    mut source: ChunkSource,
    host: HostSender,
    stop: SignalOfStop,
) {
    let mut engine = SessionEngine::new_sender(&file_name, source.total_size());
    emit_engine(&host, Role::Sender, &engine.start());

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let link = match PeerLink::initiator(event_tx).await {
        Ok(link) => link,
        Err(err) => {
            emit_engine(
                &host,
                Role::Sender,
                &engine.process_event(SessionEvent::Fault(err)),
            );
            return;
        }
    };

    let result = {
        let mut ctx = SessionCtx {
            store: &*store,
            session,
            engine: &mut engine,
            link: &link,
            events: &mut events,
            host: &host,
            stop: &stop,
        };
        sender_flow(&mut ctx, &mut source).await
    };
    conclude(result, &mut engine, Role::Sender, &host, &stop);
    teardown(&*store, session, SignalSlot::Offer, &link).await;
}

async fn sender_flow<S: RendezvousStore>(
    ctx: &mut SessionCtx<'_, S>,
    source: &mut ChunkSource,
) -> Result<(), TransferError> {
    let offer_sdp = match ctx.stop.select(ctx.link.create_offer_sdp()).await {
        Ok(res) => res?,
        Err(()) => return Err(reset_error()),
    };
    let payload = SignalPayload::offer(
        offer_sdp,
        ctx.engine.file_name().to_owned(),
        source.total_size(),
    );
    match ctx
        .stop
        .select(ctx.store.publish(ctx.session, SignalSlot::Offer, payload))
        .await
    {
        Ok(res) => res?,
        Err(()) => return Err(reset_error()),
    }
    info!(event = "offer_published", session = %ctx.session, "Offer waiting for a peer");
    notify_host(
        ctx.host,
        SessionMessage::Status(format!(
            "Offer created. Share this session id: {}",
            ctx.session
        )),
    );

    // One-shot: resolves when the receiver answers, or on cancellation.
    let descriptor =
        match await_descriptor(ctx.store, ctx.session, SignalSlot::Answer, ctx.stop).await? {
            Some(payload) => payload,
            None => return Err(reset_error()),
        };
    let outcome = ctx
        .engine
        .process_event(SessionEvent::DescriptorResolved(descriptor));
    emit_engine(ctx.host, Role::Sender, &outcome);
    let Some(remote) = take_remote_descriptor(outcome) else {
        // The engine rejected the descriptor and already reported failure.
        return Ok(());
    };
    ctx.link.apply_answer_sdp(&remote.sdp).await?;

    wait_for_channel_open(ctx).await?;
    if ctx.engine.state().is_terminal() {
        return Ok(());
    }

    stream_chunks(ctx, source).await?;

    let outcome = ctx.engine.process_event(SessionEvent::SendFinished);
    emit_engine(ctx.host, Role::Sender, &outcome);

    let channel = ctx.link.channel().await?;
    await_drained(&channel, ctx.stop).await?;

    let outcome = ctx.engine.process_event(SessionEvent::Drained);
    emit_engine(ctx.host, Role::Sender, &outcome);
    Ok(())
}

/// Pump queued events until the channel opens or the session dies.
async fn wait_for_channel_open<S: RendezvousStore>(
    ctx: &mut SessionCtx<'_, S>,
) -> Result<(), TransferError> {
    let deadline = Instant::now() + DATA_CHANNEL_OPEN_TIMEOUT;
    loop {
        let event = tokio::select! {
            _ = ctx.stop.wait() => return Err(reset_error()),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(TransferError::negotiation(
                    "timed out waiting for the data channel to open",
                ));
            }
            event = ctx.events.recv() => match event {
                Some(event) => event,
                None => return Err(TransferError::transport("transport event stream ended")),
            },
        };
        let outcome = ctx.engine.process_event(event);
        emit_engine(ctx.host, ctx.engine.role(), &outcome);
        if ctx.engine.state().is_terminal()
            || matches!(ctx.engine.state(), TransferState::Transferring)
        {
            return Ok(());
        }
    }
}

/// Metadata frame, every chunk under backpressure, then the terminal marker.
async fn stream_chunks<S: RendezvousStore>(
    ctx: &mut SessionCtx<'_, S>,
    source: &mut ChunkSource,
) -> Result<(), TransferError> {
    let channel = ctx.link.channel().await?;

    let metadata = ControlMessage::Metadata {
        name: ctx.engine.file_name().to_owned(),
        size: source.total_size(),
    };
    channel
        .send_text(wire::encode(&metadata)?)
        .await
        .map_err(|e| TransferError::transport(format!("metadata send failed: {e}")))?;
    info!(
        event = "file_send_start",
        file = %ctx.engine.file_name(),
        size = source.total_size(),
        chunks = source.total_chunks(),
        "Streaming file to peer"
    );

    let total = source.total_size();
    let mut offset = 0u64;
    while offset < total {
        await_sendable(&channel, ctx.stop).await?;
        let chunk = source.read(offset, CHUNK_SIZE).await?;
        let len = chunk.len() as u64;
        channel
            .send(&chunk)
            .await
            .map_err(|e| TransferError::transport(format!("chunk send failed at offset {offset}: {e}")))?;
        offset += len;
        let outcome = ctx
            .engine
            .process_event(SessionEvent::ChunkSent { bytes: len });
        emit_engine(ctx.host, Role::Sender, &outcome);
    }

    channel
        .send_text(wire::encode(&ControlMessage::Eof)?)
        .await
        .map_err(|e| TransferError::transport(format!("terminal marker send failed: {e}")))?;
    debug!(
        event = "terminal_marker_sent",
        sent = offset,
        "EOF frame enqueued behind the last chunk"
    );
    Ok(())
}

// ── Receiver ────────────────────────────────────────────────────────────────

pub(crate) async fn run_receiver<S: RendezvousStore>(
    store: Arc<S>,
    session: SessionId,
    host: HostSender,
    stop: SignalOfStop,
) {
    let mut engine = SessionEngine::new_receiver();
    emit_engine(&host, Role::Receiver, &engine.start());

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let link = match PeerLink::responder(event_tx).await {
        Ok(link) => link,
        Err(err) => {
            emit_engine(
                &host,
                Role::Receiver,
                &engine.process_event(SessionEvent::Fault(err)),
            );
            return;
        }
    };

    let result = {
        let mut ctx = SessionCtx {
            store: &*store,
            session,
            engine: &mut engine,
            link: &link,
            events: &mut events,
            host: &host,
            stop: &stop,
        };
        receiver_flow(&mut ctx).await
    };
    conclude(result, &mut engine, Role::Receiver, &host, &stop);
    teardown(&*store, session, SignalSlot::Answer, &link).await;
}

async fn receiver_flow<S: RendezvousStore>(
    ctx: &mut SessionCtx<'_, S>,
) -> Result<(), TransferError> {
    // One-shot: resolves when a sender's offer appears, or on cancellation.
    let descriptor =
        match await_descriptor(ctx.store, ctx.session, SignalSlot::Offer, ctx.stop).await? {
            Some(payload) => payload,
            None => return Err(reset_error()),
        };
    let outcome = ctx
        .engine
        .process_event(SessionEvent::DescriptorResolved(descriptor));
    emit_engine(ctx.host, Role::Receiver, &outcome);
    let Some(remote) = take_remote_descriptor(outcome) else {
        return Ok(());
    };

    let answer_sdp = match ctx.stop.select(ctx.link.accept_offer_sdp(&remote.sdp)).await {
        Ok(res) => res?,
        Err(()) => return Err(reset_error()),
    };
    match ctx
        .stop
        .select(ctx.store.publish(
            ctx.session,
            SignalSlot::Answer,
            SignalPayload::answer(answer_sdp),
        ))
        .await
    {
        Ok(res) => res?,
        Err(()) => return Err(reset_error()),
    }
    info!(event = "answer_published", session = %ctx.session, "Answer written; waiting for the channel");
    notify_host(
        ctx.host,
        SessionMessage::Status("Connection established. Receiving file...".into()),
    );

    drive_receiver_events(ctx).await
}

/// Pump the event queue until the session reaches a terminal state. The
/// channel-open deadline only arms while negotiation is still outstanding;
/// once data flows, the peer sets the pace.
async fn drive_receiver_events<S: RendezvousStore>(
    ctx: &mut SessionCtx<'_, S>,
) -> Result<(), TransferError> {
    let open_deadline = Instant::now() + DATA_CHANNEL_OPEN_TIMEOUT;
    loop {
        let connecting = matches!(ctx.engine.state(), TransferState::Connecting);
        let event = tokio::select! {
            _ = ctx.stop.wait() => return Err(reset_error()),
            _ = tokio::time::sleep_until(open_deadline), if connecting => {
                return Err(TransferError::negotiation(
                    "timed out waiting for the data channel to open",
                ));
            }
            event = ctx.events.recv() => match event {
                Some(event) => event,
                None => return Err(TransferError::transport("transport event stream ended")),
            },
        };
        let outcome = ctx.engine.process_event(event);
        emit_engine(ctx.host, Role::Receiver, &outcome);
        if ctx.engine.state().is_terminal() {
            return Ok(());
        }
    }
}
