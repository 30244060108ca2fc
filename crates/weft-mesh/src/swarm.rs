//! Swarm coordination — tracking which neighbor holds which parts of a
//! file, scheduling chunk requests, and falling back to the origin
//! server when the mesh stays silent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use weft_core::config::MediaConfig;
use weft_core::media::{info_key, part_count, part_key};
use weft_core::{Envelope, EnvelopeKind, MediaInfo, PeerId, Recipient};

use crate::router::{Node, Reply};
use crate::store::MediaStore;

// ── Collaborator seams ────────────────────────────────────────────────────────

/// Fetches a whole resource from its authoritative origin. Used only
/// when the fallback timer expires.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Bytes>;
}

/// Playback integration — hands a completed file to a renderer.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn attach(&self, url: &str, parts: u32) -> anyhow::Result<()>;
}

// ── Tracked items ─────────────────────────────────────────────────────────────

/// One file being fetched or seeded.
struct TrackedItem {
    url: String,
    /// Known metadata, including our own part set (`available`) and the
    /// per-peer availability map (`remote`). `None` until the first info
    /// reply or local import.
    info: Option<MediaInfo>,
    /// Parts requested but not yet received. Disjoint from the
    /// available set at all times.
    pending: BTreeSet<u32>,
    complete: bool,
    autoload: bool,
    /// Origin-download timer; canceled on the first useful mesh reply.
    fallback: Option<JoinHandle<()>>,
}

impl TrackedItem {
    fn new(url: &str, autoload: bool) -> Self {
        Self {
            url: url.to_string(),
            info: None,
            pending: BTreeSet::new(),
            complete: false,
            autoload,
            fallback: None,
        }
    }

    /// A seed-only item built from a complete stored record.
    fn seeded(info: MediaInfo) -> Self {
        Self {
            url: info.url.clone(),
            info: Some(info),
            pending: BTreeSet::new(),
            complete: true,
            autoload: false,
            fallback: None,
        }
    }

    /// Pick up to `how_many` missing parts and a holder for each.
    ///
    /// Parts are considered in ascending index order; for each one the
    /// known remotes are shuffled uniformly and the first that reports
    /// the part wins. Parts nobody is known to hold are skipped this
    /// round. Every returned part is marked pending.
    fn next_parts(&mut self, how_many: usize) -> Vec<(PeerId, u32)> {
        use rand::seq::SliceRandom;

        let Some(info) = &self.info else {
            return Vec::new();
        };
        let mut rng = rand::thread_rng();
        let mut picks = Vec::new();
        for part in 0..info.parts {
            if picks.len() == how_many {
                break;
            }
            if info.available.contains(&part) || self.pending.contains(&part) {
                continue;
            }
            let mut holders: Vec<&PeerId> = info.remote.keys().collect();
            holders.shuffle(&mut rng);
            if let Some(peer) = holders.into_iter().find(|p| info.remote[*p].contains(&part)) {
                picks.push((peer.clone(), part));
            }
        }
        for (_, part) in &picks {
            self.pending.insert(*part);
        }
        picks
    }
}

enum Followup {
    Complete {
        parts: u32,
        autoload: bool,
        record: Option<MediaInfo>,
    },
    Request(Vec<(PeerId, u32)>),
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// Moves chunked files across the mesh.
///
/// Owns every [`TrackedItem`]; chunk bytes and info records live in the
/// storage collaborator, of which the in-memory state is a projection.
pub struct SwarmCoordinator {
    node: Arc<Node>,
    store: Arc<dyn MediaStore>,
    origin: Arc<dyn OriginFetcher>,
    sink: Option<Arc<dyn MediaSink>>,
    items: Mutex<HashMap<String, TrackedItem>>,
    config: MediaConfig,
}

impl SwarmCoordinator {
    /// Create the coordinator and register its handlers on the node's bus.
    pub fn new(
        node: Arc<Node>,
        store: Arc<dyn MediaStore>,
        origin: Arc<dyn OriginFetcher>,
        sink: Option<Arc<dyn MediaSink>>,
        config: MediaConfig,
    ) -> Arc<Self> {
        let swarm = Arc::new(Self {
            node,
            store,
            origin,
            sink,
            items: Mutex::new(HashMap::new()),
            config,
        });
        swarm.register_handlers();
        swarm
    }

    fn register_handlers(self: &Arc<Self>) {
        let bus = self.node.bus();
        for kind in [
            EnvelopeKind::Connected,
            EnvelopeKind::RequestInfo,
            EnvelopeKind::Info,
            EnvelopeKind::RequestPart,
            EnvelopeKind::Part,
        ] {
            let weak: Weak<Self> = Arc::downgrade(self);
            bus.on(kind, move |envelope| {
                let Some(swarm) = weak.upgrade() else { return };
                tokio::spawn(async move {
                    swarm.dispatch(envelope).await;
                });
            });
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Connected => self.on_connected(envelope).await,
            EnvelopeKind::RequestInfo => self.on_request_info(envelope).await,
            EnvelopeKind::Info => self.on_info(envelope).await,
            EnvelopeKind::RequestPart => self.on_request_part(envelope).await,
            EnvelopeKind::Part => self.on_part(envelope).await,
            _ => {}
        }
    }

    // ── Public surface ───────────────────────────────────────────────────────

    /// Start fetching (or keep tracking) `url`.
    ///
    /// Issues a peer-discovery broadcast and arms the origin-fallback
    /// timer. The item is registered before the timer can possibly fire.
    pub async fn add_item(self: &Arc<Self>, url: &str, autoload: bool) {
        {
            let mut items = self.items.lock().await;
            if items.contains_key(url) {
                return;
            }
            let mut item = TrackedItem::new(url, autoload);
            let weak = Arc::downgrade(self);
            let target = url.to_string();
            let wait = Duration::from_millis(self.config.download_timeout_ms);
            item.fallback = Some(tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(swarm) = weak.upgrade() {
                    swarm.fallback_download(&target).await;
                }
            }));
            items.insert(url.to_string(), item);
        }
        tracing::info!(url, "tracking new file");
        if let Err(error) = self.node.request_peers().await {
            tracing::warn!(error = %error, "peer discovery failed");
        }
    }

    /// Register every complete file found in storage as a seed-only item.
    /// Returns how many were added.
    pub async fn seed_local(&self) -> anyhow::Result<usize> {
        let keys = self.store.keys().await?;
        let mut seeded = 0;
        for key in keys.into_iter().filter(|k| k.ends_with("-info")) {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            let info: MediaInfo = match serde_json::from_slice(&bytes) {
                Ok(info) => info,
                Err(error) => {
                    tracing::debug!(key, error = %error, "skipping unreadable info record");
                    continue;
                }
            };
            if !info.is_complete() {
                continue;
            }
            let mut items = self.items.lock().await;
            if !items.contains_key(&info.url) {
                tracing::info!(url = %info.url, parts = info.parts, "seeding stored file");
                items.insert(info.url.clone(), TrackedItem::seeded(info));
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    pub async fn is_complete(&self, url: &str) -> bool {
        self.items
            .lock()
            .await
            .get(url)
            .map(|item| item.complete)
            .unwrap_or(false)
    }

    /// Snapshot of the tracked record, if any info is known yet.
    pub async fn item_info(&self, url: &str) -> Option<MediaInfo> {
        self.items
            .lock()
            .await
            .get(url)
            .and_then(|item| item.info.clone())
    }

    /// Parts requested but not yet received.
    pub async fn pending_parts(&self, url: &str) -> BTreeSet<u32> {
        self.items
            .lock()
            .await
            .get(url)
            .map(|item| item.pending.clone())
            .unwrap_or_default()
    }

    /// Pick and mark pending the next `how_many` parts to request.
    pub async fn next_parts_to_download(&self, url: &str, how_many: usize) -> Vec<(PeerId, u32)> {
        let mut items = self.items.lock().await;
        match items.get_mut(url) {
            Some(item) => item.next_parts(how_many),
            None => Vec::new(),
        }
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    /// A channel just opened: ask the new neighbor about every file we
    /// are still missing parts of.
    async fn on_connected(&self, envelope: Envelope) {
        let remote = envelope.from.clone();
        let urls: Vec<String> = {
            let items = self.items.lock().await;
            items
                .values()
                .filter(|item| !item.complete)
                .map(|item| item.url.clone())
                .collect()
        };
        for url in urls {
            tracing::debug!(remote = %remote, url, "asking new neighbor for info");
            let request = Envelope {
                kind: EnvelopeKind::RequestInfo,
                from: self.node.id().clone(),
                to: Recipient::Peer(remote.clone()),
                ttl: self.node.default_ttl(),
                forward_by: Vec::new(),
                url: Some(url),
                data: None,
                number: None,
            };
            if let Err(error) = self.node.send(request).await {
                tracing::warn!(error = %error, "info request failed");
            }
        }
    }

    /// Reply with our record for the file iff we know anything about it.
    async fn on_request_info(&self, envelope: Envelope) {
        let Some(url) = envelope.url.clone() else {
            tracing::warn!("info request without a url");
            return;
        };
        let info = {
            let items = self.items.lock().await;
            items.get(&url).and_then(|item| item.info.clone())
        };
        let Some(info) = info else { return };
        match serde_json::to_value(&info) {
            Ok(data) => {
                if let Err(error) = self
                    .node
                    .respond_to(&envelope, Reply::new(EnvelopeKind::Info).url(&url).data(data))
                    .await
                {
                    tracing::warn!(url, error = %error, "info reply failed");
                }
            }
            Err(error) => {
                tracing::warn!(url, error = %error, "failed to serialize info record");
            }
        }
    }

    /// A neighbor told us what it (and others) hold.
    async fn on_info(&self, envelope: Envelope) {
        let Some(url) = envelope.url.clone() else {
            tracing::warn!("info without a url");
            return;
        };
        let Some(data) = envelope.data.clone() else {
            tracing::warn!(url, "info without a record");
            return;
        };
        let report: MediaInfo = match serde_json::from_value(data) {
            Ok(report) => report,
            Err(error) => {
                tracing::warn!(url, error = %error, "unreadable info record");
                return;
            }
        };
        let from = envelope.from.clone();

        let (snapshot, picks) = {
            let mut items = self.items.lock().await;
            let Some(item) = items.get_mut(&url) else {
                tracing::debug!(url, "info for an untracked file");
                return;
            };
            if item.info.is_none() {
                item.info = Some(MediaInfo {
                    url: report.url.clone(),
                    parts: report.parts,
                    size: report.size,
                    available: BTreeSet::new(),
                    remote: BTreeMap::new(),
                });
            }
            if let Some(info) = item.info.as_mut() {
                info.merge_from(&from, &report);
            }
            if !report.available.is_empty() {
                if let Some(timer) = item.fallback.take() {
                    timer.abort();
                    tracing::debug!(url, "mesh source found; origin fallback canceled");
                }
            }
            (item.info.clone(), item.next_parts(self.config.request_batch))
        };

        if let Some(info) = snapshot {
            self.persist_info(&url, &info).await;
        }
        self.request_parts(&url, picks).await;
    }

    /// A neighbor wants a chunk. A chunk we don't hold yields no reply.
    async fn on_request_part(&self, envelope: Envelope) {
        let Some(url) = envelope.url.clone() else {
            tracing::warn!("part request without a url");
            return;
        };
        let Some(number) = envelope.number else {
            tracing::warn!(url, "part request without a number");
            return;
        };
        match self.store.get(&part_key(&url, number)).await {
            Ok(Some(bytes)) => {
                let data = Value::Array(bytes.iter().map(|b| Value::from(*b)).collect());
                let reply = Reply::new(EnvelopeKind::Part)
                    .url(&url)
                    .number(number)
                    .data(data);
                if let Err(error) = self.node.respond_to(&envelope, reply).await {
                    tracing::warn!(url, number, error = %error, "part reply failed");
                }
            }
            Ok(None) => {
                tracing::debug!(url, number, "requested part not in store");
            }
            Err(error) => {
                tracing::warn!(url, number, error = %error, "storage read failed");
            }
        }
    }

    /// A chunk arrived.
    async fn on_part(&self, envelope: Envelope) {
        let Some(url) = envelope.url.clone() else {
            tracing::warn!("part without a url");
            return;
        };
        let Some(number) = envelope.number else {
            tracing::warn!(url, "part without a number");
            return;
        };
        let Some(data) = envelope.data.clone() else {
            tracing::warn!(url, number, "part without a payload");
            return;
        };
        let bytes: Vec<u8> = match serde_json::from_value(data) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(url, number, error = %error, "unreadable part payload");
                return;
            }
        };
        self.store_part(&url, number, Bytes::from(bytes)).await;
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Persist one received chunk and keep the request pipeline moving:
    /// duplicates are accepted and dropped, completion attaches playback,
    /// anything else requests exactly one more part.
    async fn store_part(&self, url: &str, number: u32, bytes: Bytes) {
        let followup = {
            let mut items = self.items.lock().await;
            let Some(item) = items.get_mut(url) else {
                tracing::debug!(url, "part for an untracked file");
                return;
            };
            item.pending.remove(&number);

            let Some(parts) = item.info.as_ref().map(|info| info.parts) else {
                tracing::warn!(url, number, "part received before any info");
                return;
            };
            let duplicate = item
                .info
                .as_ref()
                .is_some_and(|info| info.available.contains(&number));
            if duplicate {
                tracing::debug!(url, number, "duplicate part ignored");
                return;
            }

            if let Err(error) = self.store.put(&part_key(url, number), bytes).await {
                tracing::warn!(url, number, error = %error, "failed to persist part");
                return;
            }
            if let Some(info) = item.info.as_mut() {
                info.available.insert(number);
            }

            let have = item
                .info
                .as_ref()
                .map(|info| info.available.len() as u32)
                .unwrap_or(0);
            if have == parts {
                item.complete = true;
                Followup::Complete {
                    parts,
                    autoload: item.autoload,
                    record: item.info.clone(),
                }
            } else {
                Followup::Request(item.next_parts(1))
            }
        };

        match followup {
            Followup::Complete {
                parts,
                autoload,
                record,
            } => {
                tracing::info!(url, parts, "file complete");
                if let Some(record) = record {
                    // The stored record now shows full availability, so a
                    // restarted node can seed this file.
                    self.persist_info(url, &record).await;
                }
                if autoload {
                    self.attach_sink(url, parts).await;
                }
            }
            Followup::Request(picks) => {
                self.request_parts(url, picks).await;
            }
        }
    }

    async fn request_parts(&self, url: &str, picks: Vec<(PeerId, u32)>) {
        for (peer, number) in picks {
            tracing::debug!(url, number, peer = %peer, "requesting part");
            let request = Envelope {
                kind: EnvelopeKind::RequestPart,
                from: self.node.id().clone(),
                to: Recipient::Peer(peer),
                ttl: self.node.default_ttl(),
                forward_by: Vec::new(),
                url: Some(url.to_string()),
                data: None,
                number: Some(number),
            };
            if let Err(error) = self.node.send(request).await {
                tracing::warn!(url, number, error = %error, "part request failed");
            }
        }
    }

    /// The mesh produced nothing in time: fetch the whole file from the
    /// origin, split it, and store it.
    async fn fallback_download(&self, url: &str) {
        {
            let mut items = self.items.lock().await;
            let Some(item) = items.get_mut(url) else { return };
            if item.complete {
                return;
            }
            item.fallback = None;
            item.pending.clear();
        }
        tracing::info!(url, "no mesh source in time; fetching from origin");
        let bytes = match self.origin.fetch(url).await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(url, error = %error, "origin fetch failed");
                return;
            }
        };
        if let Err(error) = self.import_bytes(url, bytes).await {
            tracing::warn!(url, error = %error, "failed to store origin download");
        }
    }

    /// Split a whole-file buffer into fixed-size parts and persist the
    /// record plus every part.
    async fn import_bytes(&self, url: &str, bytes: Bytes) -> anyhow::Result<()> {
        let chunk_size = self.config.chunk_size;
        let parts = part_count(bytes.len(), chunk_size);
        let info = MediaInfo::local(url, parts, bytes.len() as u64);
        self.store
            .put(&info_key(url), Bytes::from(serde_json::to_vec(&info)?))
            .await?;
        for number in 0..parts {
            let start = number as usize * chunk_size;
            let end = (start + chunk_size).min(bytes.len());
            self.store
                .put(&part_key(url, number), bytes.slice(start..end))
                .await?;
        }
        let autoload = {
            let mut items = self.items.lock().await;
            match items.get_mut(url) {
                Some(item) => {
                    item.info = Some(info);
                    item.pending.clear();
                    item.complete = true;
                    item.autoload
                }
                None => false,
            }
        };
        tracing::info!(url, parts, "file stored from origin");
        if autoload {
            self.attach_sink(url, parts).await;
        }
        Ok(())
    }

    async fn persist_info(&self, url: &str, info: &MediaInfo) {
        match serde_json::to_vec(info) {
            Ok(bytes) => {
                if let Err(error) = self.store.put(&info_key(url), Bytes::from(bytes)).await {
                    tracing::warn!(url, error = %error, "failed to persist info record");
                }
            }
            Err(error) => {
                tracing::warn!(url, error = %error, "failed to serialize info record");
            }
        }
    }

    async fn attach_sink(&self, url: &str, parts: u32) {
        if let Some(sink) = &self.sink {
            if let Err(error) = sink.attach(url, parts).await {
                tracing::warn!(url, error = %error, "playback attach failed");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
