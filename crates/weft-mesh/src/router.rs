//! Mesh routing — envelope delivery, TTL-bounded relaying, and the
//! broadcast fan-out used when no direct route exists.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;

use weft_core::config::WeftConfig;
use weft_core::{Envelope, EnvelopeKind, PeerId, Recipient, WireError};

use crate::bus::MessageBus;
use crate::channel;
use crate::connection::{Connection, ConnectionStatus};
use crate::negotiate;
use crate::rendezvous::{self, Rendezvous, RendezvousLink};
use crate::session::{SessionEvent, SessionFactory};

/// Caller-supplied fields for a reply envelope; the routing fields are
/// filled in by [`Node::respond_to`].
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub kind: Option<EnvelopeKind>,
    pub url: Option<String>,
    pub data: Option<Value>,
    pub number: Option<u32>,
}

impl Reply {
    pub fn new(kind: EnvelopeKind) -> Self {
        Reply {
            kind: Some(kind),
            ..Reply::default()
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn number(mut self, number: u32) -> Self {
        self.number = Some(number);
        self
    }
}

/// A mesh participant: local identity, the connection table, the
/// candidate buffer, and the event bus everything dispatches through.
///
/// Lives for the process lifetime. All connections are owned here and
/// nowhere else; removal happens only once a connection has closed.
pub struct Node {
    id: PeerId,
    default_ttl: u32,
    connections: DashMap<PeerId, Arc<Connection>>,
    /// The reserved rendezvous slot — deliberately not part of the
    /// connection table so broadcast fan-out never includes it.
    rendezvous: Mutex<Option<Arc<RendezvousLink>>>,
    /// Candidates that arrived before their connection existed, per remote.
    pending_candidates: DashMap<PeerId, Vec<Value>>,
    bus: MessageBus,
    sessions: Arc<dyn SessionFactory>,
}

impl Node {
    /// Create a node and register its negotiation handlers.
    pub fn new(id: PeerId, config: &WeftConfig, sessions: Arc<dyn SessionFactory>) -> Arc<Self> {
        let node = Arc::new(Self {
            id,
            default_ttl: config.node.ttl,
            connections: DashMap::new(),
            rendezvous: Mutex::new(None),
            pending_candidates: DashMap::new(),
            bus: MessageBus::new(),
            sessions,
        });
        negotiate::register(&node);
        node
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn default_ttl(&self) -> u32 {
        self.default_ttl
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub(crate) fn sessions(&self) -> &Arc<dyn SessionFactory> {
        &self.sessions
    }

    /// Attach the rendezvous channel and start pumping its entries.
    pub fn attach_rendezvous(self: &Arc<Self>, backend: Arc<dyn Rendezvous>) {
        let link = RendezvousLink::new(backend);
        *self.rendezvous.lock().unwrap() = Some(link.clone());
        rendezvous::spawn_pump(self.clone(), link);
    }

    pub fn connection(&self, remote: &PeerId) -> Option<Arc<Connection>> {
        self.connections.get(remote).map(|entry| entry.clone())
    }

    /// Remote ids with an open connection.
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|entry| entry.value().status() == ConnectionStatus::Open)
            .map(|entry| entry.key().clone())
            .collect()
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Route an envelope: direct when the recipient is an open neighbor,
    /// otherwise flood to every eligible neighbor, falling back to the
    /// rendezvous channel when nobody is eligible.
    pub async fn send(&self, envelope: Envelope) -> Result<(), WireError> {
        envelope.validate()?;

        if let Some(peer) = envelope.to.peer() {
            let direct = self
                .connections
                .get(peer)
                .filter(|conn| conn.status() == ConnectionStatus::Open)
                .map(|conn| conn.clone());
            if let Some(conn) = direct {
                conn.send(&envelope).await;
                return Ok(());
            }
        }

        // Broadcast: skip neighbors that already relayed this envelope and
        // anything not open. The snapshot keeps DashMap guards out of awaits.
        let eligible: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| {
                !envelope.forward_by.contains(entry.key())
                    && entry.value().status() == ConnectionStatus::Open
            })
            .map(|entry| entry.value().clone())
            .collect();

        let targets = eligible.len();
        for conn in eligible {
            conn.send(&envelope).await;
        }

        if targets == 0 {
            // Last-resort reachability through the rendezvous channel.
            let link = self.rendezvous.lock().unwrap().clone();
            if let Some(link) = link {
                tracing::debug!(kind = ?envelope.kind, "no eligible neighbors; using rendezvous");
                link.send(envelope).await;
            }
        }
        Ok(())
    }

    /// Relay an envelope addressed elsewhere: spend one hop, record
    /// ourselves, and re-route. A spent hop budget makes this a no-op.
    pub async fn forward(&self, mut envelope: Envelope) {
        if envelope.ttl == 0 {
            return;
        }
        envelope.ttl -= 1;
        envelope.forward_by.push(self.id.clone());
        if let Err(error) = self.send(envelope).await {
            tracing::warn!(error = %error, "failed to forward envelope");
        }
    }

    /// Reply to `original`: fresh ttl, empty relay trail, addressed to its
    /// sender, merged with the caller's fields.
    pub async fn respond_to(&self, original: &Envelope, reply: Reply) -> Result<(), WireError> {
        let Some(kind) = reply.kind else {
            return Err(WireError::MalformedEnvelope("type"));
        };
        self.send(Envelope {
            kind,
            from: self.id.clone(),
            to: Recipient::Peer(original.from.clone()),
            ttl: self.default_ttl,
            forward_by: Vec::new(),
            url: reply.url,
            data: reply.data,
            number: reply.number,
        })
        .await
    }

    /// Broadcast a discovery request for new neighbors.
    pub async fn request_peers(&self) -> Result<(), WireError> {
        self.send(Envelope::request_peer(self.id.clone(), self.default_ttl))
            .await
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Handle one frame off a channel: deliver locally when addressed
    /// here (or broadcast), otherwise relay while hop budget remains.
    /// The two checks are independent — a ttl of zero never suppresses
    /// local delivery.
    pub(crate) fn route_incoming(self: &Arc<Self>, frame: &str) {
        match Envelope::decode(frame) {
            Ok(envelope) => {
                if envelope.addressed_to(&self.id) {
                    self.bus.emit(envelope);
                } else if envelope.ttl > 0 {
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.forward(envelope).await;
                    });
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "dropping undecodable frame");
            }
        }
    }

    // ── Connection bookkeeping ───────────────────────────────────────────────

    /// Adopt a freshly negotiated connection: store it, flush any
    /// buffered candidates, and start relaying its session events.
    pub(crate) fn insert_connection(self: &Arc<Self>, connection: Arc<Connection>) {
        let remote = connection.remote().clone();
        self.connections.insert(remote.clone(), connection.clone());
        self.flush_candidates(&remote);

        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = connection.session().next_event().await {
                match event {
                    SessionEvent::IceCandidate(candidate) => {
                        let envelope = Envelope {
                            kind: EnvelopeKind::IceCandidate,
                            from: node.id.clone(),
                            to: Recipient::Peer(remote.clone()),
                            ttl: node.default_ttl,
                            forward_by: Vec::new(),
                            url: None,
                            data: Some(candidate),
                            number: None,
                        };
                        if let Err(error) = node.send(envelope).await {
                            tracing::warn!(error = %error, "failed to send candidate");
                        }
                    }
                    SessionEvent::RemoteChannel(ch) => {
                        channel::wire(node.clone(), connection.clone(), ch.clone());
                        connection.attach_channel(ch);
                    }
                }
            }
        });
    }

    pub(crate) fn remove_connection(&self, remote: &PeerId) {
        self.connections
            .remove_if(remote, |_, conn| conn.status() == ConnectionStatus::Closed);
    }

    /// Stash a candidate that arrived before its connection existed.
    pub(crate) fn buffer_candidate(&self, remote: &PeerId, candidate: Value) {
        self.pending_candidates
            .entry(remote.clone())
            .or_default()
            .push(candidate);
    }

    /// Apply every buffered candidate for `remote` to its session, in
    /// arrival order, and clear the buffer entry.
    pub(crate) fn flush_candidates(&self, remote: &PeerId) {
        let Some(connection) = self.connection(remote) else {
            return;
        };
        let Some((_, candidates)) = self.pending_candidates.remove(remote) else {
            return;
        };
        let session = connection.session().clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            for candidate in candidates {
                if let Err(error) = session.add_ice_candidate(candidate).await {
                    tracing::warn!(remote = %remote, error = %error, "buffered candidate rejected");
                }
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryHub, MemoryRendezvousHub, RecordingChannel, StubSession};

    fn test_node(id: &str) -> Arc<Node> {
        Node::new(PeerId::new(id), &WeftConfig::default(), MemoryHub::new())
    }

    /// Insert an open connection backed by a recording channel.
    fn open_neighbor(node: &Arc<Node>, remote: &str) -> Arc<RecordingChannel> {
        let conn = Connection::new(PeerId::new(remote), StubSession::shared());
        let channel = RecordingChannel::new();
        conn.attach_channel(channel.clone());
        conn.set_status(ConnectionStatus::Open);
        node.insert_connection(conn);
        channel
    }

    fn unicast(from: &str, to: &str, ttl: u32) -> Envelope {
        Envelope {
            kind: EnvelopeKind::RequestInfo,
            from: PeerId::new(from),
            to: Recipient::Peer(PeerId::new(to)),
            ttl,
            forward_by: Vec::new(),
            url: Some("http://e/f".into()),
            data: None,
            number: None,
        }
    }

    #[tokio::test]
    async fn missing_from_is_rejected_before_the_wire() {
        let node = test_node("a");
        let channel = open_neighbor(&node, "b");
        let result = node.send(unicast("", "b", 3)).await;
        assert!(matches!(result, Err(WireError::MalformedEnvelope("from"))));
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn direct_route_sends_exactly_once() {
        let node = test_node("a");
        let direct = open_neighbor(&node, "b");
        let bystander = open_neighbor(&node, "c");

        node.send(unicast("a", "b", 3)).await.unwrap();
        assert_eq!(direct.sent().len(), 1);
        assert!(bystander.sent().is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_forwarders_and_unopened() {
        let node = test_node("a");
        let fresh = open_neighbor(&node, "b");
        let relayer = open_neighbor(&node, "c");
        // Still connecting — never a broadcast target.
        let conn = Connection::new(PeerId::new("d"), StubSession::shared());
        let connecting = RecordingChannel::new();
        conn.attach_channel(connecting.clone());
        node.insert_connection(conn);

        let mut envelope = unicast("x", "zz", 3);
        envelope.forward_by.push(PeerId::new("c"));
        node.send(envelope).await.unwrap();

        assert_eq!(fresh.sent().len(), 1);
        assert!(relayer.sent().is_empty());
        assert!(connecting.sent().is_empty());
    }

    #[tokio::test]
    async fn empty_fanout_falls_back_to_rendezvous() {
        let node = test_node("a");
        let hub = MemoryRendezvousHub::new();
        node.attach_rendezvous(hub.join());

        node.send(unicast("a", "nobody", 3)).await.unwrap();

        let entries = hub.entries();
        assert_eq!(entries.len(), 1);
        let published = Envelope::decode(&entries[0]).unwrap();
        // The shared channel reaches everyone at once; relaying after it
        // would be redundant, so the hop budget is zeroed.
        assert_eq!(published.ttl, 0);
    }

    #[tokio::test]
    async fn forward_spends_a_hop_and_records_the_relay() {
        let node = test_node("b");
        let next = open_neighbor(&node, "c");

        node.forward(unicast("a", "c", 3)).await;

        let frames = next.sent();
        assert_eq!(frames.len(), 1);
        let relayed = Envelope::decode(&frames[0]).unwrap();
        assert_eq!(relayed.ttl, 2);
        assert_eq!(relayed.forward_by, vec![PeerId::new("b")]);
    }

    #[tokio::test]
    async fn spent_ttl_is_never_relayed() {
        let node = test_node("b");
        let next = open_neighbor(&node, "c");

        node.forward(unicast("a", "c", 0)).await;
        assert!(next.sent().is_empty());
    }

    #[tokio::test]
    async fn respond_to_builds_a_fresh_reply() {
        let node = test_node("b");
        let back = open_neighbor(&node, "a");

        let mut original = unicast("a", "b", 1);
        original.forward_by.push(PeerId::new("x"));
        node.respond_to(&original, Reply::new(EnvelopeKind::Info).url("http://e/f"))
            .await
            .unwrap();

        let frames = back.sent();
        assert_eq!(frames.len(), 1);
        let reply = Envelope::decode(&frames[0]).unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Info);
        assert_eq!(reply.from, PeerId::new("b"));
        assert_eq!(reply.to.peer().unwrap(), &PeerId::new("a"));
        assert_eq!(reply.ttl, node.default_ttl());
        assert!(reply.forward_by.is_empty());
    }

    #[tokio::test]
    async fn reply_without_a_kind_is_rejected() {
        let node = test_node("b");
        let back = open_neighbor(&node, "a");

        let original = unicast("a", "b", 3);
        let result = node.respond_to(&original, Reply::default()).await;
        assert!(matches!(result, Err(WireError::MalformedEnvelope("type"))));
        assert!(back.sent().is_empty());
    }

    #[tokio::test]
    async fn ttl_zero_broadcast_still_delivered_locally() {
        let node = test_node("b");
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        node.bus().on(EnvelopeKind::RequestPeer, move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let envelope = Envelope::request_peer(PeerId::new("a"), 0);
        node.route_incoming(&envelope.encode().unwrap());
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn candidates_buffer_until_the_connection_exists() {
        let node = test_node("a");
        let candidate = serde_json::json!({"candidate": "c1"});
        node.buffer_candidate(&PeerId::new("b"), candidate.clone());
        assert_eq!(node.pending_candidates.get(&PeerId::new("b")).unwrap().len(), 1);

        open_neighbor(&node, "b");
        // insert_connection flushed and cleared the entry
        assert!(node.pending_candidates.get(&PeerId::new("b")).is_none());
    }
}
