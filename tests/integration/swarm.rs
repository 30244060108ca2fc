use crate::*;

use std::sync::Arc;

use bytes::Bytes;
use weft_core::config::MediaConfig;
use weft_core::media::{info_key, part_key};
use weft_core::MediaInfo;
use weft_mesh::testing::{link_nodes, MemoryHub, MemoryStore, RecordingSink, StaticOrigin};
use weft_mesh::{MediaStore, SwarmCoordinator};

const URL: &str = "http://cdn.example/clip.webm";

/// Split `payload` into 1000-byte parts and write the full record plus
/// every part, the way a completed download leaves storage.
async fn preload(store: &MemoryStore, url: &str, payload: &[u8]) -> u32 {
    let parts = payload.len().div_ceil(1000) as u32;
    let info = MediaInfo::local(url, parts, payload.len() as u64);
    store
        .put(&info_key(url), Bytes::from(serde_json::to_vec(&info).unwrap()))
        .await
        .unwrap();
    for number in 0..parts {
        let start = number as usize * 1000;
        let end = (start + 1000).min(payload.len());
        store
            .put(&part_key(url, number), Bytes::copy_from_slice(&payload[start..end]))
            .await
            .unwrap();
    }
    parts
}

/// A leecher pulls a whole file part by part from a seeding neighbor:
/// connect → info exchange → batched part requests → completion, with
/// playback attached at the end and no origin traffic at all.
#[tokio::test(flavor = "multi_thread")]
async fn leecher_pulls_a_file_from_a_seeding_neighbor() {
    let sessions = MemoryHub::new();
    let seeder_node = make_node("aa-seeder", &sessions);
    let leecher_node = make_node("zz-leecher", &sessions);

    let payload: Vec<u8> = (0..4200u32).map(|i| (i % 251) as u8).collect();
    let seeder_store = Arc::new(MemoryStore::new());
    let parts = preload(&seeder_store, URL, &payload).await;
    assert_eq!(parts, 5);

    // A timeout far beyond the test's runtime: the mesh must win.
    let patient = MediaConfig {
        download_timeout_ms: 60_000,
        ..MediaConfig::default()
    };

    let seeder_origin = Arc::new(StaticOrigin::new());
    let _seeder = {
        let swarm = SwarmCoordinator::new(
            seeder_node.clone(),
            seeder_store.clone(),
            seeder_origin.clone(),
            None,
            patient.clone(),
        );
        assert_eq!(swarm.seed_local().await.unwrap(), 1);
        swarm
    };

    let leecher_store = Arc::new(MemoryStore::new());
    let leecher_origin = Arc::new(StaticOrigin::new());
    let sink = Arc::new(RecordingSink::new());
    let leecher = SwarmCoordinator::new(
        leecher_node.clone(),
        leecher_store.clone(),
        leecher_origin.clone(),
        Some(sink.clone()),
        patient,
    );
    leecher.add_item(URL, true).await;

    link_nodes(&leecher_node, &seeder_node);

    eventually("the transfer to complete", || leecher.is_complete(URL)).await;

    // Every stored part matches the seeder's bytes.
    for number in 0..parts {
        let got = leecher_store
            .get(&part_key(URL, number))
            .await
            .unwrap()
            .expect("part missing");
        let want = seeder_store
            .get(&part_key(URL, number))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, want, "part {number} differs");
    }

    // Playback was attached once, and nobody touched an origin server.
    eventually("playback attach", || {
        let sink = sink.clone();
        async move { !sink.attached().is_empty() }
    })
    .await;
    assert_eq!(sink.attached(), vec![(URL.to_string(), parts)]);
    assert_eq!(seeder_origin.fetches(), 0);
    assert_eq!(leecher_origin.fetches(), 0);

    // The leecher's stored record is complete, so it could now seed.
    let record: MediaInfo = serde_json::from_slice(
        &leecher_store.get(&info_key(URL)).await.unwrap().unwrap(),
    )
    .unwrap();
    assert!(record.is_complete());
}

/// A node with no neighbors at all: the fallback timer expires and the
/// file arrives whole from the origin, split into stored parts.
#[tokio::test(flavor = "multi_thread")]
async fn lonely_node_downloads_from_the_origin() {
    let node = make_node("solo", &MemoryHub::new());
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(StaticOrigin::new());
    origin.insert(URL, Bytes::from(vec![42u8; 2345]));

    let impatient = MediaConfig {
        download_timeout_ms: 100,
        ..MediaConfig::default()
    };
    let swarm = SwarmCoordinator::new(node, store.clone(), origin.clone(), None, impatient);
    swarm.add_item(URL, false).await;

    eventually("the origin download", || swarm.is_complete(URL)).await;

    assert_eq!(origin.fetches(), 1);
    let record: MediaInfo =
        serde_json::from_slice(&store.get(&info_key(URL)).await.unwrap().unwrap()).unwrap();
    assert_eq!(record.parts, 3);
    assert!(record.is_complete());
    let last = store.get(&part_key(URL, 2)).await.unwrap().unwrap();
    assert_eq!(last.len(), 345);
}
