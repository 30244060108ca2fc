//! Data-channel transport — framed duplex messaging over a negotiated
//! session, and the wiring that turns channel events into mesh behavior.

use std::sync::Arc;

use async_trait::async_trait;
use weft_core::{Envelope, EnvelopeKind};

use crate::connection::{Connection, ConnectionStatus};
use crate::router::Node;

/// Events surfaced by a data channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel became usable end to end.
    Open,
    /// A text frame arrived from the remote peer.
    Message(String),
    /// The channel closed (either side).
    Closed,
    /// A transport-level error. Non-fatal; the channel may still close later.
    Error(String),
}

/// One half of a framed duplex channel riding on a negotiated session.
///
/// The offerer instantiates its half at connection-creation time; the
/// answerer receives an already-created half through
/// [`crate::session::SessionEvent::RemoteChannel`].
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Transmit one text frame.
    async fn send(&self, frame: String) -> anyhow::Result<()>;

    /// Next channel event, or `None` once the event stream is exhausted.
    async fn next_event(&self) -> Option<ChannelEvent>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Attach the mesh-side event handling to a channel.
///
/// Spawns the wiring task translating the four channel events:
/// frames are decoded and either emitted locally or relayed, `Open`
/// transitions the connection and announces `connected`, `Closed`
/// transitions, removes, and announces `disconnected`, and errors are
/// logged without tearing anything down.
pub(crate) fn wire(node: Arc<Node>, connection: Arc<Connection>, channel: Arc<dyn DataChannel>) {
    tokio::spawn(async move {
        let remote = connection.remote().clone();
        while let Some(event) = channel.next_event().await {
            match event {
                ChannelEvent::Open => {
                    connection.set_status(ConnectionStatus::Open);
                    tracing::info!(local = %node.id(), remote = %remote, "channel open");
                    node.bus()
                        .emit(Envelope::local_event(EnvelopeKind::Connected, remote.clone()));
                }
                ChannelEvent::Message(frame) => {
                    node.route_incoming(&frame);
                }
                ChannelEvent::Closed => {
                    connection.set_status(ConnectionStatus::Closed);
                    node.remove_connection(&remote);
                    tracing::info!(local = %node.id(), remote = %remote, "channel closed");
                    node.bus().emit(Envelope::local_event(
                        EnvelopeKind::Disconnected,
                        remote.clone(),
                    ));
                    break;
                }
                ChannelEvent::Error(error) => {
                    tracing::warn!(remote = %remote, error, "channel error");
                }
            }
        }
    });
}
