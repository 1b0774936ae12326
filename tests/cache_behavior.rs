//! Stat-cache semantics: hits are verbatim, expiry is a miss, misses rewrite.
mod common;

use chrono::{Duration, TimeZone, Utc};
use meshstats::stats::StatsEngine;
use meshstats::storage::NewPacket;

async fn seed(store: &meshstats::storage::Store, packet_id: u32, count: usize) {
    let sent_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let relays: Vec<(String, chrono::DateTime<Utc>)> = (0..count)
        .map(|i| (format!("!{:08x}", 0x2000 + i), sent_at))
        .collect();
    store
        .insert_grouped_packet(
            &NewPacket {
                packet_id,
                sender: 0xA1,
                sender_name: "node-161".to_string(),
                sent_at,
                rssi: None,
                snr: None,
                hop_start: None,
                hop_limit: None,
                payload: "cached".to_string(),
            },
            &relays,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn day_stats_are_served_from_cache_within_ttl() {
    let store = common::memory_store().await;
    let stats = StatsEngine::new(store.clone());
    let date = chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

    seed(&store, 1, 2).await;
    let first = stats.day_stats(date).await.unwrap();
    assert_eq!(first.stats.message_count, 1);

    // New data lands, but the cached entry is still fresh: the read must
    // return the cached JSON verbatim.
    seed(&store, 2, 4).await;
    let second = stats.day_stats(date).await.unwrap();
    assert_eq!(second.stats.message_count, 1);
}

#[tokio::test]
async fn expired_entry_is_a_miss_and_gets_rewritten() {
    let store = common::memory_store().await;
    let stats = StatsEngine::new(store.clone());
    let date = chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
    let key = format!("day:{}", date);

    seed(&store, 1, 2).await;
    let first = stats.day_stats(date).await.unwrap();
    assert_eq!(first.stats.message_count, 1);

    seed(&store, 2, 4).await;
    // Force the entry past its TTL.
    let stale = store.cache_get(&key, Utc::now()).await.unwrap().unwrap();
    store.cache_put(&key, &stale, Duration::seconds(-1)).await.unwrap();

    let refreshed = stats.day_stats(date).await.unwrap();
    assert_eq!(refreshed.stats.message_count, 2, "expired entry must recompute");

    // And the rewrite is visible as a fresh cache row.
    let rewritten = store.cache_get(&key, Utc::now()).await.unwrap();
    assert!(rewritten.is_some());
    assert_ne!(rewritten.unwrap(), stale);
}

#[tokio::test]
async fn cache_warm_precomputes_rolling_and_network() {
    let store = common::memory_store().await;
    let stats = StatsEngine::new(store.clone());
    seed(&store, 1, 3).await;

    stats.warm_cache().await.unwrap();
    let now = Utc::now();
    for key in ["rolling:24h", "rolling:7d", "rolling:30d", "network"] {
        assert!(
            store.cache_get(key, now).await.unwrap().is_some(),
            "expected warm cache entry for {}",
            key
        );
    }
}

#[tokio::test]
async fn histogram_buckets_partition_the_sample() {
    let store = common::memory_store().await;
    let stats = StatsEngine::new(store.clone());
    for (i, count) in [1usize, 1, 2, 3, 5, 8, 13].iter().enumerate() {
        seed(&store, 100 + i as u32, *count).await;
    }
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    let histogram = stats
        .gateway_histogram(t0, t0 + Duration::days(1), &[1, 2, 5, 10, 100])
        .await
        .unwrap();
    let counts: Vec<i64> = histogram.iter().map(|b| b.count).collect();
    assert_eq!(counts, vec![2, 1, 2, 1, 1]);
    assert_eq!(counts.iter().sum::<i64>(), 7);
}

#[tokio::test]
async fn top_senders_ranks_by_message_count() {
    let store = common::memory_store().await;
    let stats = StatsEngine::new(store.clone());
    let sent_at = Utc::now();
    for (i, sender) in [0xA1u32, 0xA1, 0xA1, 0xB2, 0xB2, 0xC3].iter().enumerate() {
        let relays = vec![("!00000001".to_string(), sent_at)];
        store
            .insert_grouped_packet(
                &NewPacket {
                    packet_id: 500 + i as u32,
                    sender: *sender,
                    sender_name: format!("node-{}", sender),
                    sent_at,
                    rssi: None,
                    snr: None,
                    hop_start: None,
                    hop_limit: None,
                    payload: "x".to_string(),
                },
                &relays,
            )
            .await
            .unwrap();
    }

    let top = stats.top_senders(2, 7).await.unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].node_id, 0xA1);
    assert_eq!(top[0].message_count, 3);
    assert_eq!(top[1].node_id, 0xB2);
    assert_eq!(top[1].message_count, 2);
}

#[tokio::test]
async fn corrupt_cache_entries_are_recomputed() {
    let store = common::memory_store().await;
    let stats = StatsEngine::new(store.clone());
    let date = chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
    let key = format!("day:{}", date);

    seed(&store, 1, 2).await;
    store.cache_put(&key, "not json at all", Duration::seconds(60)).await.unwrap();

    let result = stats.day_stats(date).await.unwrap();
    assert_eq!(result.stats.message_count, 1);
}
