//! Replay suppression and the ok-to-MQTT privacy gate, end to end.
mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{default_codec, ingest_envelope, memory_store, text_envelope, text_envelope_with_bitfield};
use meshstats::codec::Decoded;
use meshstats::mqtt::grouper::PacketGrouper;

#[tokio::test]
async fn replayed_envelope_bytes_produce_exactly_one_row() {
    let store = memory_store().await;
    let codec = default_codec();
    let grouper = PacketGrouper::new(store.clone(), 10, 2, 24);
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    let envelope = text_envelope(7001, 0xA1, "!aabbccdd", "once only");
    let before = meshstats::metrics::snapshot().replay_suppressed;

    let first = ingest_envelope(&store, &codec, &grouper, &envelope, t0).await;
    assert!(first.is_some());
    // The broker replays the identical bytes.
    let second = ingest_envelope(&store, &codec, &grouper, &envelope, t0 + Duration::seconds(1)).await;
    assert!(second.is_none(), "replay must be dropped before grouping");

    grouper.flush_all().await;
    let packets = store.last_packets(10).await.unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].gateway_count, 1);

    // Replay again after persistence: still suppressed, still one row.
    let third = ingest_envelope(&store, &codec, &grouper, &envelope, t0 + Duration::seconds(20)).await;
    assert!(third.is_none());
    assert_eq!(store.last_packets(10).await.unwrap().len(), 1);
    assert!(meshstats::metrics::snapshot().replay_suppressed >= before + 2);
}

#[tokio::test]
async fn private_packets_never_reach_the_store() {
    let store = memory_store().await;
    let codec = default_codec();
    let grouper = PacketGrouper::new(store.clone(), 10, 2, 24);
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    // bitfield present with the ok-to-MQTT bit cleared.
    let envelope = text_envelope_with_bitfield(7300, 0xD4, "!aabbccdd", "private", Some(0));
    assert_eq!(codec.decode_at(&envelope, t0), Decoded::PrivateDrop);

    let outcome = ingest_envelope(&store, &codec, &grouper, &envelope, t0).await;
    assert!(outcome.is_none());
    grouper.flush_all().await;

    assert!(store.last_packets(10).await.unwrap().is_empty());
    assert!(store.gateways_for_packet(7300).await.unwrap().is_empty());
    // The sender must not even appear as a node.
    assert!(store.get_node(0xD4).await.unwrap().is_none());
}

#[tokio::test]
async fn fingerprints_survive_restart_via_the_store() {
    // Replay suppression is durable: a "new" grouper (fresh process) still
    // rejects bytes the store has seen.
    let store = memory_store().await;
    let codec = default_codec();
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    let envelope = text_envelope(7400, 0xE5, "!aabbccdd", "durable");
    {
        let grouper = PacketGrouper::new(store.clone(), 10, 2, 24);
        ingest_envelope(&store, &codec, &grouper, &envelope, t0).await;
        grouper.flush_all().await;
    }
    let fresh_grouper = PacketGrouper::new(store.clone(), 10, 2, 24);
    let outcome =
        ingest_envelope(&store, &codec, &fresh_grouper, &envelope, t0 + Duration::seconds(30)).await;
    assert!(outcome.is_none());
    assert_eq!(store.last_packets(10).await.unwrap().len(), 1);
}
