//! Deterministic in-memory backends for every collaborator seam.
//!
//! These double for the real rendezvous service, WebRTC stack, chunk
//! store, and origin server in unit and scenario tests, and document by
//! construction what the mesh expects from each seam.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex};

use weft_core::{Envelope, PeerId};

use crate::channel::{ChannelEvent, DataChannel};
use crate::connection::Connection;
use crate::rendezvous::Rendezvous;
use crate::router::Node;
use crate::session::{PeerSession, SessionEvent, SessionFactory};
use crate::store::MediaStore;
use crate::swarm::{MediaSink, OriginFetcher};

// ── Channels ──────────────────────────────────────────────────────────────────

/// One half of an in-memory channel pair. Frames sent on one half arrive
/// as `Message` events on the other.
pub struct MemoryChannel {
    to_peer: mpsc::UnboundedSender<ChannelEvent>,
    events: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    own: mpsc::UnboundedSender<ChannelEvent>,
}

impl MemoryChannel {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            to_peer: b_tx.clone(),
            events: Mutex::new(a_rx),
            own: a_tx.clone(),
        });
        let b = Arc::new(Self {
            to_peer: a_tx,
            events: Mutex::new(b_rx),
            own: b_tx,
        });
        (a, b)
    }

    /// Inject an event into this half's own stream.
    pub fn push(&self, event: ChannelEvent) {
        let _ = self.own.send(event);
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, frame: String) -> anyhow::Result<()> {
        self.to_peer
            .send(ChannelEvent::Message(frame))
            .map_err(|_| anyhow::anyhow!("peer channel gone"))
    }

    async fn next_event(&self) -> Option<ChannelEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.to_peer.send(ChannelEvent::Closed);
        let _ = self.own.send(ChannelEvent::Closed);
    }
}

/// A channel that records outbound frames instead of delivering them.
pub struct RecordingChannel {
    sent: std::sync::Mutex<Vec<String>>,
    events: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    own: mpsc::UnboundedSender<ChannelEvent>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: std::sync::Mutex::new(Vec::new()),
            events: Mutex::new(rx),
            own: tx,
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn push(&self, event: ChannelEvent) {
        let _ = self.own.send(event);
    }
}

#[async_trait]
impl DataChannel for RecordingChannel {
    async fn send(&self, frame: String) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn next_event(&self) -> Option<ChannelEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.own.send(ChannelEvent::Closed);
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// A session whose negotiation steps all trivially succeed and which
/// never produces events. Useful when a test wires channels by hand.
pub struct StubSession;

impl StubSession {
    pub fn shared() -> Arc<dyn PeerSession> {
        Arc::new(StubSession)
    }
}

#[async_trait]
impl PeerSession for StubSession {
    async fn create_offer(&self) -> anyhow::Result<Value> {
        Ok(json!({"sdp": "stub-offer"}))
    }

    async fn create_answer(&self, _remote: Value) -> anyhow::Result<Value> {
        Ok(json!({"sdp": "stub-answer"}))
    }

    async fn set_remote_description(&self, _description: Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_channel(&self) -> Arc<dyn DataChannel> {
        RecordingChannel::new()
    }

    async fn next_event(&self) -> Option<SessionEvent> {
        None
    }
}

/// Pairs sessions between nodes and completes negotiation in memory.
///
/// The deterministic sequence mirrors the real one: the offerer creates
/// the channel pair and its offer, the answerer's half is delivered via
/// `RemoteChannel` once it answers, and both halves report `Open` when
/// the offerer applies the answer. Each side also gathers one synthetic
/// candidate so the candidate paths stay exercised.
pub struct MemoryHub {
    pairs: DashMap<(String, String), Arc<Pair>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pairs: DashMap::new(),
        })
    }
}

fn pair_key(a: &PeerId, b: &PeerId) -> (String, String) {
    let (a, b) = (a.as_str().to_string(), b.as_str().to_string());
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Default)]
struct Pair {
    inner: std::sync::Mutex<PairInner>,
}

#[derive(Default)]
struct PairInner {
    offer_half: Option<Arc<MemoryChannel>>,
    answer_half: Option<Arc<MemoryChannel>>,
    answerer_events: Option<mpsc::UnboundedSender<SessionEvent>>,
    answered: bool,
    remote_set: bool,
    channel_delivered: bool,
    opened: bool,
}

impl Pair {
    fn maybe_deliver_channel(inner: &mut PairInner) {
        if inner.channel_delivered || !inner.answered {
            return;
        }
        let (Some(half), Some(events)) = (&inner.answer_half, &inner.answerer_events) else {
            return;
        };
        let _ = events.send(SessionEvent::RemoteChannel(half.clone()));
        inner.channel_delivered = true;
    }

    fn maybe_open(inner: &mut PairInner) {
        if inner.opened || !inner.answered || !inner.remote_set || !inner.channel_delivered {
            return;
        }
        if let (Some(a), Some(b)) = (&inner.offer_half, &inner.answer_half) {
            a.push(ChannelEvent::Open);
            b.push(ChannelEvent::Open);
            inner.opened = true;
        }
    }
}

enum Role {
    Unset,
    Offerer,
    Answerer,
}

pub struct MemorySession {
    pair: Arc<Pair>,
    role: std::sync::Mutex<Role>,
    local: PeerId,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events: Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl SessionFactory for MemoryHub {
    fn open_session(&self, local: &PeerId, remote: &PeerId) -> Arc<dyn PeerSession> {
        let pair = self
            .pairs
            .entry(pair_key(local, remote))
            .or_default()
            .clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(MemorySession {
            pair,
            role: std::sync::Mutex::new(Role::Unset),
            local: local.clone(),
            events_tx,
            events: Mutex::new(events_rx),
        })
    }
}

#[async_trait]
impl PeerSession for MemorySession {
    async fn create_offer(&self) -> anyhow::Result<Value> {
        *self.role.lock().unwrap() = Role::Offerer;
        let _ = self.events_tx.send(SessionEvent::IceCandidate(
            json!({"candidate": format!("cand:{}", self.local)}),
        ));
        Ok(json!({"sdp": format!("offer:{}", self.local)}))
    }

    async fn create_answer(&self, _remote: Value) -> anyhow::Result<Value> {
        *self.role.lock().unwrap() = Role::Answerer;
        {
            let mut inner = self.pair.inner.lock().unwrap();
            inner.answered = true;
            inner.answerer_events = Some(self.events_tx.clone());
            Pair::maybe_deliver_channel(&mut inner);
            Pair::maybe_open(&mut inner);
        }
        let _ = self.events_tx.send(SessionEvent::IceCandidate(
            json!({"candidate": format!("cand:{}", self.local)}),
        ));
        Ok(json!({"sdp": format!("answer:{}", self.local)}))
    }

    async fn set_remote_description(&self, _description: Value) -> anyhow::Result<()> {
        if matches!(*self.role.lock().unwrap(), Role::Offerer) {
            let mut inner = self.pair.inner.lock().unwrap();
            inner.remote_set = true;
            Pair::maybe_open(&mut inner);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_channel(&self) -> Arc<dyn DataChannel> {
        let (offer_half, answer_half) = MemoryChannel::pair();
        let mut inner = self.pair.inner.lock().unwrap();
        inner.offer_half = Some(offer_half.clone());
        inner.answer_half = Some(answer_half);
        Pair::maybe_deliver_channel(&mut inner);
        Pair::maybe_open(&mut inner);
        offer_half
    }

    async fn next_event(&self) -> Option<SessionEvent> {
        self.events.lock().await.recv().await
    }
}

// ── Rendezvous ────────────────────────────────────────────────────────────────

/// The shared append-only feed. Every subscriber observes every entry,
/// its own included, and late joiners replay the whole history.
pub struct MemoryRendezvousHub {
    tx: broadcast::Sender<String>,
    log: std::sync::Mutex<Vec<String>>,
}

impl MemoryRendezvousHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            tx,
            log: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Subscribe a new participant.
    pub fn join(self: &Arc<Self>) -> Arc<MemoryRendezvous> {
        // Snapshot and subscription happen under the log lock so no entry
        // is missed or replayed twice.
        let log = self.log.lock().unwrap();
        let backlog: VecDeque<String> = log.iter().cloned().collect();
        let rx = self.tx.subscribe();
        drop(log);
        Arc::new(MemoryRendezvous {
            hub: self.clone(),
            backlog: Mutex::new(backlog),
            rx: Mutex::new(rx),
        })
    }

    /// Append an envelope directly (test convenience).
    pub fn append(&self, envelope: &Envelope) {
        if let Ok(entry) = envelope.encode() {
            self.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        // Held across the send so `join` cannot interleave between the
        // log append and the broadcast.
        let mut log = self.log.lock().unwrap();
        log.push(entry.clone());
        let _ = self.tx.send(entry);
    }
}

pub struct MemoryRendezvous {
    hub: Arc<MemoryRendezvousHub>,
    backlog: Mutex<VecDeque<String>>,
    rx: Mutex<broadcast::Receiver<String>>,
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn publish(&self, entry: String) -> anyhow::Result<()> {
        self.hub.push(entry);
        Ok(())
    }

    async fn next_entry(&self) -> Option<String> {
        if let Some(entry) = self.backlog.lock().await.pop_front() {
            return Some(entry);
        }
        loop {
            match self.rx.lock().await.recv().await {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ── Storage, origin, playback ─────────────────────────────────────────────────

/// Key-value store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// Origin server with preloaded responses; unknown urls fail.
#[derive(Default)]
pub struct StaticOrigin {
    files: DashMap<String, Bytes>,
    fetches: AtomicUsize,
}

impl StaticOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, bytes: Bytes) {
        self.files.insert(url.to_string(), bytes);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginFetcher for StaticOrigin {
    async fn fetch(&self, url: &str) -> anyhow::Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.files
            .get(url)
            .map(|entry| entry.clone())
            .ok_or_else(|| anyhow::anyhow!("no origin entry for {url}"))
    }
}

/// Records playback attachments.
#[derive(Default)]
pub struct RecordingSink {
    attached: std::sync::Mutex<Vec<(String, u32)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attached(&self) -> Vec<(String, u32)> {
        self.attached.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSink for RecordingSink {
    async fn attach(&self, url: &str, parts: u32) -> anyhow::Result<()> {
        self.attached.lock().unwrap().push((url.to_string(), parts));
        Ok(())
    }
}

// ── Wiring helpers ────────────────────────────────────────────────────────────

/// Directly connect two nodes with an in-memory channel pair, skipping
/// negotiation. Both sides observe `Open` and announce `connected`.
/// Returns the two halves (a's, then b's) so tests can close them.
pub fn link_nodes(a: &Arc<Node>, b: &Arc<Node>) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let (half_a, half_b) = MemoryChannel::pair();

    let conn_a = Connection::new(b.id().clone(), StubSession::shared());
    conn_a.attach_channel(half_a.clone());
    crate::channel::wire(a.clone(), conn_a.clone(), half_a.clone());
    a.insert_connection(conn_a);

    let conn_b = Connection::new(a.id().clone(), StubSession::shared());
    conn_b.attach_channel(half_b.clone());
    crate::channel::wire(b.clone(), conn_b.clone(), half_b.clone());
    b.insert_connection(conn_b);

    half_a.push(ChannelEvent::Open);
    half_b.push(ChannelEvent::Open);
    (half_a, half_b)
}
