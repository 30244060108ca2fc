//! Neighbor connections — one per remote peer, owned by the node's table.

use std::sync::{Arc, Mutex};

use weft_core::{Envelope, PeerId};

use crate::channel::DataChannel;
use crate::session::PeerSession;

/// Connection lifecycle. Transitions only move forward; `Closed` is
/// terminal and reachable from either prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

/// One neighbor relationship: the negotiated session plus the data
/// channel once one exists. Created on the first offer or discovery
/// request in either direction; removed from the table on close.
pub struct Connection {
    remote: PeerId,
    status: Mutex<ConnectionStatus>,
    session: Arc<dyn PeerSession>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
}

impl Connection {
    pub fn new(remote: PeerId, session: Arc<dyn PeerSession>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            status: Mutex::new(ConnectionStatus::Connecting),
            session,
            channel: Mutex::new(None),
        })
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    /// Advance the lifecycle. Backward transitions are ignored: once
    /// `Closed`, a connection stays closed, and `Open` never reverts to
    /// `Connecting`.
    pub(crate) fn set_status(&self, next: ConnectionStatus) {
        let mut status = self.status.lock().unwrap();
        let allowed = match (*status, next) {
            (ConnectionStatus::Connecting, ConnectionStatus::Open) => true,
            (ConnectionStatus::Connecting, ConnectionStatus::Closed) => true,
            (ConnectionStatus::Open, ConnectionStatus::Closed) => true,
            _ => false,
        };
        if allowed {
            *status = next;
        }
    }

    pub fn session(&self) -> &Arc<dyn PeerSession> {
        &self.session
    }

    pub(crate) fn attach_channel(&self, channel: Arc<dyn DataChannel>) {
        *self.channel.lock().unwrap() = Some(channel);
    }

    /// Transmit an envelope over the channel. A no-op unless the
    /// connection is `Open` and a channel is attached.
    pub async fn send(&self, envelope: &Envelope) {
        if self.status() != ConnectionStatus::Open {
            return;
        }
        let channel = self.channel.lock().unwrap().clone();
        let Some(channel) = channel else { return };
        match envelope.encode() {
            Ok(frame) => {
                if let Err(error) = channel.send(frame).await {
                    tracing::warn!(remote = %self.remote, error = %error, "channel send failed");
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to encode envelope");
            }
        }
    }
}
