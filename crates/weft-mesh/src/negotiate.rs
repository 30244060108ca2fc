//! Connection negotiation — the offer/answer/candidate handlers that
//! take a pair of nodes from discovery to an open channel.
//!
//! Failure policy throughout: log and leave the connection in its
//! current state. There is no retry and no automatic teardown.

use std::sync::{Arc, Weak};

use weft_core::{Envelope, EnvelopeKind};

use crate::channel;
use crate::connection::{Connection, ConnectionStatus};
use crate::router::{Node, Reply};

/// Register the negotiation handlers on the node's bus.
pub(crate) fn register(node: &Arc<Node>) {
    let bus = node.bus();

    let weak = Arc::downgrade(node);
    bus.on(EnvelopeKind::RequestPeer, move |envelope| {
        spawn(&weak, envelope, on_request_peer);
    });

    let weak = Arc::downgrade(node);
    bus.on(EnvelopeKind::Offer, move |envelope| {
        spawn(&weak, envelope, on_offer);
    });

    let weak = Arc::downgrade(node);
    bus.on(EnvelopeKind::Answer, move |envelope| {
        spawn(&weak, envelope, on_answer);
    });

    let weak = Arc::downgrade(node);
    bus.on(EnvelopeKind::IceCandidate, move |envelope| {
        spawn(&weak, envelope, on_icecandidate);
    });
}

fn spawn<F, Fut>(node: &Weak<Node>, envelope: Envelope, handler: F)
where
    F: FnOnce(Arc<Node>, Envelope) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if let Some(node) = node.upgrade() {
        tokio::spawn(handler(node, envelope));
    }
}

/// A peer is looking for neighbors — act as the offerer.
///
/// The offerer creates the data channel; the answerer only ever attaches
/// to the channel the remote opened.
async fn on_request_peer(node: Arc<Node>, envelope: Envelope) {
    let remote = envelope.from.clone();
    if let Some(existing) = node.connection(&remote) {
        if existing.status() != ConnectionStatus::Closed {
            // Already connecting or connected; don't start a second offer.
            return;
        }
    }
    tracing::debug!(local = %node.id(), remote = %remote, "offering connection");

    let session = node.sessions().open_session(node.id(), &remote);
    let connection = Connection::new(remote.clone(), session.clone());
    let data_channel = session.create_channel();
    channel::wire(node.clone(), connection.clone(), data_channel.clone());
    connection.attach_channel(data_channel);
    node.insert_connection(connection);

    match session.create_offer().await {
        Ok(offer) => {
            if let Err(error) = node
                .respond_to(&envelope, Reply::new(EnvelopeKind::Offer).data(offer))
                .await
            {
                tracing::warn!(remote = %remote, error = %error, "failed to send offer");
            }
        }
        Err(error) => {
            tracing::warn!(remote = %remote, error = %error, "failed to create offer");
        }
    }
}

/// An offer arrived — act as the answerer.
async fn on_offer(node: Arc<Node>, envelope: Envelope) {
    let remote = envelope.from.clone();
    let Some(offer) = envelope.data.clone() else {
        tracing::warn!(remote = %remote, "offer without a description");
        return;
    };
    tracing::debug!(local = %node.id(), remote = %remote, "answering offer");

    let session = node.sessions().open_session(node.id(), &remote);
    let connection = Connection::new(remote.clone(), session.clone());
    node.insert_connection(connection);

    match session.create_answer(offer).await {
        Ok(answer) => {
            if let Err(error) = node
                .respond_to(&envelope, Reply::new(EnvelopeKind::Answer).data(answer))
                .await
            {
                tracing::warn!(remote = %remote, error = %error, "failed to send answer");
            }
        }
        Err(error) => {
            tracing::warn!(remote = %remote, error = %error, "failed to create answer");
        }
    }
}

/// The answer to our offer arrived. The transition to `Open` is driven
/// only by the channel becoming ready, never by the answer itself.
async fn on_answer(node: Arc<Node>, envelope: Envelope) {
    let remote = &envelope.from;
    let Some(connection) = node.connection(remote) else {
        tracing::warn!(remote = %remote, "answer from a peer we never offered to");
        return;
    };
    let status = connection.status();
    if status != ConnectionStatus::Connecting {
        tracing::warn!(remote = %remote, ?status, "answer while not connecting");
        return;
    }
    let Some(answer) = envelope.data.clone() else {
        tracing::warn!(remote = %remote, "answer without a description");
        return;
    };
    if let Err(error) = connection.session().set_remote_description(answer).await {
        tracing::warn!(remote = %remote, error = %error, "failed to set remote description");
    }
}

/// A remote candidate arrived — apply it, or buffer it until its
/// connection exists.
async fn on_icecandidate(node: Arc<Node>, envelope: Envelope) {
    let remote = envelope.from.clone();
    let Some(candidate) = envelope.data.clone() else {
        tracing::warn!(remote = %remote, "candidate without a payload");
        return;
    };
    match node.connection(&remote) {
        Some(connection) => {
            if let Err(error) = connection.session().add_ice_candidate(candidate).await {
                tracing::warn!(remote = %remote, error = %error, "candidate rejected");
            }
        }
        None => {
            node.buffer_candidate(&remote, candidate);
            // The connection may have appeared while we buffered; flush so
            // the candidate cannot strand.
            node.flush_candidates(&remote);
        }
    }
}
