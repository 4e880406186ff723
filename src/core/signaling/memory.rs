//! In-process rendezvous store backed by watch channels.
//!
//! One `watch::Sender` per occupied slot: publish replaces the value, purge
//! replaces it with `None`, subscribers wake on both. This is the store the
//! tests and the loopback demo run against; a hosted backend implements the
//! same trait against its own wire.

use std::collections::HashMap;

use tokio::sync::{watch, RwLock};
use tracing::debug;

use super::{signal_path, RendezvousStore, SessionId, SignalPayload, SignalSlot};
use crate::core::error::TransferError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<String, watch::Sender<Option<SignalPayload>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for a slot, created empty on first touch.
    async fn slot_channel(&self, path: &str) -> watch::Sender<Option<SignalPayload>> {
        if let Some(tx) = self.slots.read().await.get(path) {
            return tx.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

impl RendezvousStore for MemoryStore {
    async fn publish(
        &self,
        session: SessionId,
        slot: SignalSlot,
        payload: SignalPayload,
    ) -> Result<(), TransferError> {
        let path = signal_path(session, slot);
        self.slot_channel(&path).await.send_replace(Some(payload));
        debug!(event = "slot_published", %path, "Descriptor written");
        Ok(())
    }

    async fn subscribe(
        &self,
        session: SessionId,
        slot: SignalSlot,
    ) -> Result<watch::Receiver<Option<SignalPayload>>, TransferError> {
        let path = signal_path(session, slot);
        Ok(self.slot_channel(&path).await.subscribe())
    }

    async fn purge(&self, session: SessionId, slot: SignalSlot) -> Result<(), TransferError> {
        let path = signal_path(session, slot);
        let mut slots = self.slots.write().await;
        if let Some(tx) = slots.get(&path) {
            tx.send_replace(None);
            // Keep the channel alive for remaining watchers; reap it once
            // nobody is listening so stale sessions do not pile up.
            if tx.receiver_count() == 0 {
                slots.remove(&path);
            }
        }
        debug!(event = "slot_purged", %path, "Descriptor removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signaling::await_descriptor;
    use crate::utils::sos::SignalOfStop;
    use std::time::Duration;

    fn offer(sdp: &str) -> SignalPayload {
        SignalPayload::offer(sdp.to_string(), "notes.txt".to_string(), 42)
    }

    #[tokio::test]
    async fn subscribe_after_publish_sees_the_current_value() {
        let store = MemoryStore::new();
        let session = SessionId::generate();
        store
            .publish(session, SignalSlot::Offer, offer("sdp-1"))
            .await
            .expect("publish");

        let rx = store
            .subscribe(session, SignalSlot::Offer)
            .await
            .expect("subscribe");
        let current = rx.borrow().clone();
        assert_eq!(current, Some(offer("sdp-1")));
    }

    #[tokio::test]
    async fn subscribe_before_publish_wakes_on_write() {
        let store = MemoryStore::new();
        let session = SessionId::generate();
        let mut rx = store
            .subscribe(session, SignalSlot::Answer)
            .await
            .expect("subscribe");
        assert_eq!(rx.borrow_and_update().clone(), None);

        store
            .publish(session, SignalSlot::Answer, SignalPayload::answer("sdp-a".into()))
            .await
            .expect("publish");

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("watcher should wake")
            .expect("channel should stay open");
        assert_eq!(
            rx.borrow().clone(),
            Some(SignalPayload::answer("sdp-a".into()))
        );
    }

    #[tokio::test]
    async fn purge_empties_the_slot() {
        let store = MemoryStore::new();
        let session = SessionId::generate();
        store
            .publish(session, SignalSlot::Offer, offer("sdp-1"))
            .await
            .expect("publish");
        store
            .purge(session, SignalSlot::Offer)
            .await
            .expect("purge");

        let rx = store
            .subscribe(session, SignalSlot::Offer)
            .await
            .expect("subscribe");
        assert_eq!(rx.borrow().clone(), None);
    }

    #[tokio::test]
    async fn purging_an_absent_slot_is_a_no_op() {
        let store = MemoryStore::new();
        let session = SessionId::generate();
        store
            .purge(session, SignalSlot::Answer)
            .await
            .expect("purge of untouched slot");
    }

    #[tokio::test]
    async fn await_descriptor_consumes_exactly_once() {
        let store = MemoryStore::new();
        let session = SessionId::generate();
        let stop = SignalOfStop::new();

        store
            .publish(session, SignalSlot::Offer, offer("sdp-1"))
            .await
            .expect("publish");

        let resolved = await_descriptor(&store, session, SignalSlot::Offer, &stop)
            .await
            .expect("await")
            .expect("descriptor should resolve");
        assert_eq!(resolved, offer("sdp-1"));

        // The slot was purged on consumption; a later write is a fresh value
        // seen only by fresh watchers.
        let rx = store
            .subscribe(session, SignalSlot::Offer)
            .await
            .expect("subscribe");
        assert_eq!(rx.borrow().clone(), None);

        store
            .publish(session, SignalSlot::Offer, offer("sdp-2"))
            .await
            .expect("republish");
        let rx = store
            .subscribe(session, SignalSlot::Offer)
            .await
            .expect("subscribe");
        assert_eq!(rx.borrow().clone(), Some(offer("sdp-2")));
    }

    #[tokio::test]
    async fn await_descriptor_resolves_a_late_publish() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let session = SessionId::generate();
        let stop = SignalOfStop::new();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move {
                await_descriptor(&*store, session, SignalSlot::Answer, &stop).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .publish(session, SignalSlot::Answer, SignalPayload::answer("sdp-a".into()))
            .await
            .expect("publish");

        let resolved = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher should resolve")
            .expect("watcher task should not panic")
            .expect("await")
            .expect("descriptor should resolve");
        assert_eq!(resolved, SignalPayload::answer("sdp-a".into()));
    }

    #[tokio::test]
    async fn await_descriptor_backs_off_on_cancellation() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let session = SessionId::generate();
        let stop = SignalOfStop::new();

        let watcher = {
            let store = store.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                await_descriptor(&*store, session, SignalSlot::Offer, &stop).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        let resolved = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher should resolve")
            .expect("watcher task should not panic")
            .expect("await");
        assert_eq!(resolved, None);

        // Cancellation leaves the slot untouched for a future session.
        store
            .publish(session, SignalSlot::Offer, offer("sdp-1"))
            .await
            .expect("publish");
        let rx = store
            .subscribe(session, SignalSlot::Offer)
            .await
            .expect("subscribe");
        assert_eq!(rx.borrow().clone(), Some(offer("sdp-1")));
    }
}
