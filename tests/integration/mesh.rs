use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::{Envelope, EnvelopeKind, PeerId, Recipient};
use weft_mesh::testing::{link_nodes, MemoryHub, MemoryRendezvousHub};
use weft_mesh::DataChannel;

/// Two nodes find each other through the rendezvous feed, run the full
/// offer/answer/candidate exchange, and end with an open channel and a
/// `connected` event on each side.
#[tokio::test(flavor = "multi_thread")]
async fn discovery_negotiates_an_open_channel_on_both_sides() {
    let sessions = MemoryHub::new();
    let rendezvous = MemoryRendezvousHub::new();

    // The tie-break makes the lower id the one that answers discovery.
    let alpha = make_node("aa-alpha", &sessions);
    let beta = make_node("zz-beta", &sessions);
    alpha.attach_rendezvous(rendezvous.join());
    beta.attach_rendezvous(rendezvous.join());

    let alpha_connected = Arc::new(AtomicUsize::new(0));
    let beta_connected = Arc::new(AtomicUsize::new(0));
    {
        let counter = alpha_connected.clone();
        alpha.bus().on(EnvelopeKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = beta_connected.clone();
        beta.bus().on(EnvelopeKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    beta.request_peers().await.unwrap();

    wait_for("both channels to open", || {
        alpha.neighbors().contains(&PeerId::new("zz-beta"))
            && beta.neighbors().contains(&PeerId::new("aa-alpha"))
    })
    .await;

    assert!(alpha_connected.load(Ordering::SeqCst) >= 1);
    assert!(beta_connected.load(Ordering::SeqCst) >= 1);
}

/// A three-node chain a–b–c: a unicast from a to c is relayed by b with
/// one hop spent and b recorded in the trail.
#[tokio::test(flavor = "multi_thread")]
async fn chain_relays_with_ttl_spent_and_trail_recorded() {
    let sessions = MemoryHub::new();
    let a = make_node("aa", &sessions);
    let b = make_node("bb", &sessions);
    let c = make_node("cc", &sessions);
    link_nodes(&a, &b);
    link_nodes(&b, &c);

    wait_for("chain links to open", || {
        a.neighbors().len() == 1 && b.neighbors().len() == 2 && c.neighbors().len() == 1
    })
    .await;

    let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        c.bus().on(EnvelopeKind::RequestInfo, move |envelope| {
            seen.lock().unwrap().push(envelope);
        });
    }

    a.send(Envelope {
        kind: EnvelopeKind::RequestInfo,
        from: PeerId::new("aa"),
        to: Recipient::Peer(PeerId::new("cc")),
        ttl: 3,
        forward_by: Vec::new(),
        url: Some("http://cdn.example/clip.webm".into()),
        data: None,
        number: None,
    })
    .await
    .unwrap();

    wait_for("the relay to reach c", || !seen.lock().unwrap().is_empty()).await;

    let received = seen.lock().unwrap()[0].clone();
    assert_eq!(received.ttl, 2);
    assert_eq!(received.forward_by, vec![PeerId::new("bb")]);
    assert_eq!(received.from, PeerId::new("aa"));
}

/// Closing the channel transitions both connections to closed, removes
/// them from the tables, and fires `disconnected` on both sides.
#[tokio::test(flavor = "multi_thread")]
async fn channel_close_tears_down_both_sides() {
    let sessions = MemoryHub::new();
    let a = make_node("aa", &sessions);
    let b = make_node("bb", &sessions);

    let disconnects = Arc::new(AtomicUsize::new(0));
    for node in [&a, &b] {
        let counter = disconnects.clone();
        node.bus().on(EnvelopeKind::Disconnected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (half_a, _half_b) = link_nodes(&a, &b);
    wait_for("the link to open", || {
        a.neighbors().len() == 1 && b.neighbors().len() == 1
    })
    .await;

    half_a.close().await;

    wait_for("both tables to empty", || {
        a.neighbors().is_empty() && b.neighbors().is_empty()
    })
    .await;
    wait_for("disconnected on both sides", || {
        disconnects.load(Ordering::SeqCst) >= 2
    })
    .await;

    assert!(a.connection(&PeerId::new("bb")).is_none());
    assert!(b.connection(&PeerId::new("aa")).is_none());
}
