//! Rendezvous channel — a shared, ordered, append-only publish/subscribe
//! feed used for initial discovery and last-resort delivery.
//!
//! Every subscriber observes every entry ever appended, its own
//! included, so the inbound pump filters aggressively before anything
//! reaches the bus.

use std::sync::Arc;

use async_trait::async_trait;

use weft_core::{Envelope, EnvelopeKind};

use crate::router::Node;

/// The external rendezvous service.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Append one entry to the shared feed.
    async fn publish(&self, entry: String) -> anyhow::Result<()>;

    /// Next entry off the feed (oldest first, replaying history), or
    /// `None` once the feed is gone.
    async fn next_entry(&self) -> Option<String>;
}

/// The node's reserved rendezvous slot.
pub(crate) struct RendezvousLink {
    backend: Arc<dyn Rendezvous>,
}

impl RendezvousLink {
    pub(crate) fn new(backend: Arc<dyn Rendezvous>) -> Arc<Self> {
        Arc::new(Self { backend })
    }

    /// Publish an envelope onto the shared feed. The hop budget is
    /// zeroed first: the feed already reaches everyone, so relaying the
    /// entry onward would only duplicate it.
    pub(crate) async fn send(&self, mut envelope: Envelope) {
        envelope.ttl = 0;
        match envelope.encode() {
            Ok(entry) => {
                if let Err(error) = self.backend.publish(entry).await {
                    tracing::warn!(error = %error, "rendezvous publish failed");
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to encode rendezvous envelope");
            }
        }
    }
}

/// Pump entries off the feed into the node's bus.
///
/// Dropped on the floor: entries we authored, entries addressed to
/// someone else, and stale `request-peer` entries from peers that sort
/// below us — the deterministic tie-break that keeps many nodes from
/// all answering the same old discovery request.
pub(crate) fn spawn_pump(node: Arc<Node>, link: Arc<RendezvousLink>) {
    tokio::spawn(async move {
        while let Some(entry) = link.backend.next_entry().await {
            let envelope = match Envelope::decode(&entry) {
                Ok(envelope) => envelope,
                Err(error) => {
                    tracing::debug!(error = %error, "skipping undecodable rendezvous entry");
                    continue;
                }
            };
            if envelope.from == *node.id() {
                continue;
            }
            if !envelope.addressed_to(node.id()) {
                continue;
            }
            if envelope.kind == EnvelopeKind::RequestPeer && envelope.from < *node.id() {
                continue;
            }
            node.bus().emit(envelope);
        }
        tracing::debug!(local = %node.id(), "rendezvous feed closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryHub, MemoryRendezvousHub};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_core::config::WeftConfig;
    use weft_core::{PeerId, Recipient};

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    }

    fn counting_node(id: &str, kind: EnvelopeKind) -> (Arc<Node>, Arc<AtomicUsize>) {
        let node = Node::new(PeerId::new(id), &WeftConfig::default(), MemoryHub::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        node.bus().on(kind, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (node, hits)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn own_entries_are_discarded() {
        let hub = MemoryRendezvousHub::new();
        let (node, hits) = counting_node("n1", EnvelopeKind::Info);
        node.attach_rendezvous(hub.join());

        let envelope = Envelope {
            kind: EnvelopeKind::Info,
            from: PeerId::new("n1"),
            to: Recipient::Peer(PeerId::new("n1")),
            ttl: 0,
            forward_by: Vec::new(),
            url: None,
            data: None,
            number: None,
        };
        hub.append(&envelope);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entries_for_others_are_discarded() {
        let hub = MemoryRendezvousHub::new();
        let (node, hits) = counting_node("n1", EnvelopeKind::Info);
        node.attach_rendezvous(hub.join());

        let mut envelope = Envelope {
            kind: EnvelopeKind::Info,
            from: PeerId::new("other"),
            to: Recipient::Peer(PeerId::new("elsewhere")),
            ttl: 0,
            forward_by: Vec::new(),
            url: None,
            data: None,
            number: None,
        };
        hub.append(&envelope);
        envelope.to = Recipient::Peer(PeerId::new("n1"));
        hub.append(&envelope);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_discovery_requests_lose_the_tie_break() {
        let hub = MemoryRendezvousHub::new();
        // Lower ids are discarded; "m..." sorts below "n1", "z..." above.
        let (node, hits) = counting_node("n1", EnvelopeKind::RequestPeer);
        node.attach_rendezvous(hub.join());

        hub.append(&Envelope::request_peer(PeerId::new("m0"), 0));
        hub.append(&Envelope::request_peer(PeerId::new("z9"), 0));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn late_joiners_replay_history() {
        let hub = MemoryRendezvousHub::new();
        hub.append(&Envelope::request_peer(PeerId::new("z9"), 0));

        let (node, hits) = counting_node("n1", EnvelopeKind::RequestPeer);
        node.attach_rendezvous(hub.join());
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
