//! Buffered-amount gates for the sending side.
//!
//! The data channel absorbs writes without blocking, so an unpaced sender
//! can balloon memory inside the SCTP stack. Both gates poll
//! `buffered_amount` instead of relying on the low-watermark callback: the
//! polling loop lives in the session task, where cancellation and stall
//! detection already have a home.

use std::future::Future;
use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::core::config::{
    BACKPRESSURE_POLL_INTERVAL, BUFFERED_AMOUNT_HIGH, DRAIN_POLL_INTERVAL, SEND_STALL_TIMEOUT,
};
use crate::core::error::TransferError;
use crate::utils::sos::SignalOfStop;

/// What the gates poll: channel liveness and the queued byte count. The
/// production gauge reads the data channel; tests substitute scripted
/// readings.
trait ChannelGauge {
    fn is_open(&self) -> bool;
    fn buffered(&self) -> impl Future<Output = usize> + Send;
}

impl ChannelGauge for Arc<RTCDataChannel> {
    fn is_open(&self) -> bool {
        self.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered(&self) -> usize {
        self.buffered_amount().await
    }
}

/// Wait until the channel can absorb another chunk.
///
/// Suspends while `buffered_amount` sits above the high watermark. Exits
/// early when the channel leaves `Open`, when the stall timeout passes, or
/// when `stop` fires; the watermark is never crossed by force.
pub(crate) async fn await_sendable(
    channel: &Arc<RTCDataChannel>,
    stop: &SignalOfStop,
) -> Result<(), TransferError> {
    sendable_gate(channel, stop, Instant::now() + SEND_STALL_TIMEOUT).await
}

/// Wait until every queued byte has left the channel.
///
/// Runs after the final chunk and the terminal marker are enqueued, so a
/// successful return means the whole file was handed to the transport.
pub(crate) async fn await_drained(
    channel: &Arc<RTCDataChannel>,
    stop: &SignalOfStop,
) -> Result<(), TransferError> {
    drain_gate(channel, stop, Instant::now() + SEND_STALL_TIMEOUT).await
}

async fn sendable_gate<G: ChannelGauge>(
    gauge: &G,
    stop: &SignalOfStop,
    deadline: Instant,
) -> Result<(), TransferError> {
    let mut engaged = false;
    loop {
        if stop.cancelled() {
            return Err(TransferError::transport("session reset"));
        }
        if !gauge.is_open() {
            return Err(TransferError::transport("data channel is no longer open"));
        }
        let buffered = gauge.buffered().await;
        if buffered <= BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        if !engaged {
            debug!(
                event = "backpressure_engaged",
                buffered,
                watermark = BUFFERED_AMOUNT_HIGH,
                "Send paused until the channel drains"
            );
            engaged = true;
        }
        if Instant::now() >= deadline {
            return Err(TransferError::transport(format!(
                "send stalled: buffered amount stuck at {buffered} bytes"
            )));
        }
        sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }
}

async fn drain_gate<G: ChannelGauge>(
    gauge: &G,
    stop: &SignalOfStop,
    deadline: Instant,
) -> Result<(), TransferError> {
    loop {
        if stop.cancelled() {
            return Err(TransferError::transport("session reset"));
        }
        // Buffered amount is checked before the ready state: a receiver that
        // got the terminal marker may close the channel while this loop
        // sleeps, and drained-then-closed is still a successful drain.
        let buffered = gauge.buffered().await;
        if buffered == 0 {
            debug!(
                event = "send_buffer_drained",
                "Every queued byte handed to the transport"
            );
            return Ok(());
        }
        if !gauge.is_open() {
            return Err(TransferError::transport(
                "data channel closed before its buffer drained",
            ));
        }
        if Instant::now() >= deadline {
            return Err(TransferError::transport(format!(
                "drain stalled: {buffered} bytes still buffered"
            )));
        }
        trace!(event = "drain_wait", buffered, "Waiting for the send buffer to empty");
        sleep(DRAIN_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::core::config::CHUNK_SIZE;

    /// Gauge fed from a scripted reading sequence; the last reading repeats
    /// once the script runs out.
    struct ScriptedGauge {
        open: AtomicBool,
        readings: Mutex<VecDeque<usize>>,
        served: Mutex<Vec<usize>>,
    }

    impl ScriptedGauge {
        fn new(readings: &[usize]) -> Self {
            Self {
                open: AtomicBool::new(true),
                readings: Mutex::new(readings.iter().copied().collect()),
                served: Mutex::new(Vec::new()),
            }
        }

        fn closed(readings: &[usize]) -> Self {
            let gauge = Self::new(readings);
            gauge.open.store(false, Ordering::Release);
            gauge
        }

        fn served(&self) -> Vec<usize> {
            self.served.lock().unwrap().clone()
        }
    }

    impl ChannelGauge for ScriptedGauge {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        async fn buffered(&self) -> usize {
            let value = {
                let mut readings = self.readings.lock().unwrap();
                if readings.len() > 1 {
                    readings.pop_front().unwrap()
                } else {
                    *readings.front().expect("reading script must not be empty")
                }
            };
            self.served.lock().unwrap().push(value);
            value
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + SEND_STALL_TIMEOUT
    }

    #[tokio::test]
    async fn sendable_opens_only_at_or_below_the_watermark() {
        let gauge = ScriptedGauge::new(&[
            BUFFERED_AMOUNT_HIGH + 3 * CHUNK_SIZE,
            BUFFERED_AMOUNT_HIGH + CHUNK_SIZE,
            BUFFERED_AMOUNT_HIGH + 1,
            BUFFERED_AMOUNT_HIGH,
        ]);
        let stop = SignalOfStop::new();

        sendable_gate(&gauge, &stop, far_deadline())
            .await
            .expect("gate should open");

        let served = gauge.served();
        let (last, waits) = served.split_last().expect("at least one reading");
        assert!(
            waits.iter().all(|b| *b > BUFFERED_AMOUNT_HIGH),
            "gate opened while above the watermark: {served:?}"
        );
        assert!(*last <= BUFFERED_AMOUNT_HIGH);
        // One chunk enqueued after the gate opens keeps unsent bytes within
        // three chunks.
        assert!(*last + CHUNK_SIZE <= 3 * CHUNK_SIZE);
    }

    #[tokio::test]
    async fn sendable_returns_at_once_under_the_watermark() {
        let gauge = ScriptedGauge::new(&[0]);
        let stop = SignalOfStop::new();

        sendable_gate(&gauge, &stop, far_deadline())
            .await
            .expect("no wait needed");

        assert_eq!(gauge.served(), vec![0]);
    }

    #[tokio::test]
    async fn sendable_fails_once_the_stall_deadline_passes() {
        // The reading never falls below the watermark.
        let gauge = ScriptedGauge::new(&[BUFFERED_AMOUNT_HIGH + 1]);
        let stop = SignalOfStop::new();

        let err = sendable_gate(&gauge, &stop, Instant::now() + Duration::from_millis(60))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Transport(_)));
        assert!(err.to_string().contains("send stalled"), "error was: {err}");
    }

    #[tokio::test]
    async fn sendable_fails_when_the_channel_is_not_open() {
        let gauge = ScriptedGauge::closed(&[BUFFERED_AMOUNT_HIGH + 1]);
        let stop = SignalOfStop::new();

        let err = sendable_gate(&gauge, &stop, far_deadline()).await.unwrap_err();

        assert!(matches!(err, TransferError::Transport(_)));
        assert!(err.to_string().contains("no longer open"), "error was: {err}");
    }

    #[tokio::test]
    async fn sendable_unblocks_on_cancellation() {
        let gauge = Arc::new(ScriptedGauge::new(&[BUFFERED_AMOUNT_HIGH + 1]));
        let stop = SignalOfStop::new();

        let waiter = {
            let gauge = gauge.clone();
            let stop = stop.clone();
            tokio::spawn(async move { sendable_gate(&*gauge, &stop, far_deadline()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("gate should resolve after cancel")
            .expect("gate task should not panic")
            .unwrap_err();

        assert!(err.to_string().contains("session reset"), "error was: {err}");
    }

    #[tokio::test]
    async fn drain_waits_until_the_buffer_hits_zero() {
        let gauge = ScriptedGauge::new(&[3 * CHUNK_SIZE, CHUNK_SIZE, 512, 0]);
        let stop = SignalOfStop::new();

        drain_gate(&gauge, &stop, far_deadline())
            .await
            .expect("drain should finish");

        assert_eq!(gauge.served().last(), Some(&0));
    }

    #[tokio::test]
    async fn drain_succeeds_when_the_peer_closes_after_the_last_byte() {
        // Zero buffered wins over a closed ready state.
        let gauge = ScriptedGauge::closed(&[0]);
        let stop = SignalOfStop::new();

        drain_gate(&gauge, &stop, far_deadline())
            .await
            .expect("an empty buffer is a finished drain");
    }

    #[tokio::test]
    async fn drain_fails_when_the_channel_closes_with_bytes_left() {
        let gauge = ScriptedGauge::closed(&[CHUNK_SIZE]);
        let stop = SignalOfStop::new();

        let err = drain_gate(&gauge, &stop, far_deadline()).await.unwrap_err();

        assert!(
            err.to_string().contains("before its buffer drained"),
            "error was: {err}"
        );
    }

    #[tokio::test]
    async fn drain_fails_once_the_stall_deadline_passes() {
        let gauge = ScriptedGauge::new(&[CHUNK_SIZE]);
        let stop = SignalOfStop::new();

        let err = drain_gate(&gauge, &stop, Instant::now() + Duration::from_millis(120))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("drain stalled"), "error was: {err}");
    }
}
