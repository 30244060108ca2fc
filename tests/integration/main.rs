//! Weft integration test harness.
//!
//! Scenario tests run whole nodes against the in-memory backends from
//! `weft_mesh::testing` — no sockets, no external services, no real
//! WebRTC stack. Each test builds its own nodes and hubs, so tests
//! never interfere with each other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use weft_core::config::WeftConfig;
use weft_core::PeerId;
use weft_mesh::testing::MemoryHub;
use weft_mesh::Node;

mod mesh;
mod swarm;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Build a node with default config on a shared session hub.
pub fn make_node(id: &str, sessions: &Arc<MemoryHub>) -> Arc<Node> {
    Node::new(PeerId::new(id), &WeftConfig::default(), sessions.clone())
}

/// Poll a synchronous probe until it holds, or fail the test.
pub async fn wait_for(what: &str, mut probe: impl FnMut() -> bool) {
    for _ in 0..400 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll an asynchronous probe until it holds, or fail the test.
pub async fn eventually<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
