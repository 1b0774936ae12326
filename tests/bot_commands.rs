//! Command execution against a real store: subscription idempotence and
//! reply formatting.
mod common;

use chrono::{TimeZone, Utc};
use meshstats::bot::chunk_utf8;
use meshstats::bot::commands::{parse_command, Command, CommandExecutor};
use meshstats::mqtt::grouper::PacketGrouper;
use meshstats::mqtt::MqttIngest;
use meshstats::stats::StatsEngine;
use meshstats::storage::{NewPacket, Store};
use meshstats::subscriptions::{SubscriptionSvc, SummaryVariant};
use std::sync::Arc;

async fn executor(store: &Store) -> CommandExecutor {
    let stats = StatsEngine::new(store.clone());
    let subscriptions = SubscriptionSvc::new(store.clone());
    let grouper = Arc::new(PacketGrouper::new(store.clone(), 10, 2, 24));
    let ingest = MqttIngest::new(
        meshstats::config::MqttConfig {
            server: "mqtt.invalid".to_string(),
            username: None,
            password: None,
            root_topic: "msh/US".to_string(),
            tls_enabled: false,
            tls_insecure: false,
        },
        common::default_codec(),
        grouper,
        store.clone(),
    );
    CommandExecutor::new(stats, subscriptions, ingest.status_handle())
}

async fn seed_packet(store: &Store, packet_id: u32, sender: u32, gateways: usize) {
    let sent_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let relays: Vec<(String, chrono::DateTime<Utc>)> = (0..gateways)
        .map(|i| (format!("!{:08x}", 0x3000 + i), sent_at))
        .collect();
    store
        .insert_grouped_packet(
            &NewPacket {
                packet_id,
                sender,
                sender_name: format!("node-{}", sender),
                sent_at,
                rssi: None,
                snr: None,
                hop_start: None,
                hop_limit: None,
                payload: "test".to_string(),
            },
            &relays,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn repeated_subscribe_yields_one_active_subscription() {
    let store = common::memory_store().await;
    let executor = executor(&store).await;

    for _ in 0..3 {
        let reply = executor
            .execute(0xA1, Command::Subscribe(SummaryVariant::Avg))
            .await
            .unwrap();
        assert_eq!(reply, "✅ Subscribed to avg.");
    }

    let subs = store.active_subscriptions(None).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].variant, "avg");

    let reply = executor.execute(0xA1, Command::MySubscriptions).await.unwrap();
    assert_eq!(reply, "Active subscriptions:\n- avg");

    let reply = executor.execute(0xA1, Command::Unsubscribe).await.unwrap();
    assert_eq!(reply, "🔕 All subscriptions cancelled.");
    assert!(store.active_subscriptions(None).await.unwrap().is_empty());

    let reply = executor.execute(0xA1, Command::MySubscriptions).await.unwrap();
    assert_eq!(reply, "No active subscriptions.");
}

#[tokio::test]
async fn last_message_reply_reflects_the_senders_packets() {
    let store = common::memory_store().await;
    let executor = executor(&store).await;
    seed_packet(&store, 7001, 0xA1, 3).await;
    seed_packet(&store, 7002, 0xB2, 1).await;

    let reply = executor.execute(0xA1, Command::StatsLastMessage).await.unwrap();
    assert!(reply.starts_with("Last message:"));
    assert!(reply.contains("ID 7001"));
    assert!(reply.contains("Gateways 3"));

    let reply = executor.execute(0xC3, Command::StatsLastMessage).await.unwrap();
    assert_eq!(reply, "No messages recorded for you yet.");
}

#[tokio::test]
async fn last_n_reply_lists_newest_first() {
    let store = common::memory_store().await;
    let executor = executor(&store).await;
    for i in 0..5 {
        seed_packet(&store, 7100 + i, 0xA1, 2).await;
    }
    let reply = executor.execute(0xA1, Command::StatsLastN(3)).await.unwrap();
    let lines: Vec<&str> = reply.lines().collect();
    assert_eq!(lines[0], "Last messages:");
    assert_eq!(lines.len(), 4);
    assert!(lines[1].contains("2 gw"));
}

#[tokio::test]
async fn today_reply_carries_daily_shape() {
    let store = common::memory_store().await;
    let executor = executor(&store).await;
    // Seed for *today* so the daily aggregate sees it.
    let now = Utc::now();
    let relays = vec![("!00000001".to_string(), now), ("!00000002".to_string(), now)];
    store
        .insert_grouped_packet(
            &NewPacket {
                packet_id: 7200,
                sender: 0xA1,
                sender_name: "node-161".to_string(),
                sent_at: now,
                rssi: None,
                snr: None,
                hop_start: None,
                hop_limit: None,
                payload: "today".to_string(),
            },
            &relays,
        )
        .await
        .unwrap();

    let reply = executor.execute(0xA1, Command::StatsToday).await.unwrap();
    assert!(reply.starts_with("Stats for "));
    assert!(reply.contains("Messages: 1"));
    assert!(reply.contains("Avg: 2.0 gw"));
    assert!(reply.contains("p50: 2.0"));
}

#[tokio::test]
async fn long_detailed_reply_chunks_for_the_radio() {
    // S7 shape: a ~450 byte reply crosses the 200-byte frame cap in 3 chunks.
    let reply = "h00 → 12 msgs, avg 3.2, p50 3, p90 5\n".repeat(12);
    assert!(reply.len() > 400);
    let chunks = chunk_utf8(&reply, 200);
    assert!(chunks.len() >= 3);
    assert!(chunks.iter().all(|c| c.len() <= 200));
}

#[tokio::test]
async fn unknown_command_gets_a_hint_and_help_lists_verbs() {
    let store = common::memory_store().await;
    let executor = executor(&store).await;

    let reply = executor.execute(0xA1, Command::Unknown).await.unwrap();
    assert!(reply.contains("!help"));

    let help = executor.execute(0xA1, Command::Help).await.unwrap();
    for verb in [
        "!stats last message",
        "!stats today detailed",
        "!subscribe low|avg|high",
        "!unsubscribe",
        "!my_subscriptions",
    ] {
        assert!(help.contains(verb), "help text missing {}", verb);
    }
}

#[tokio::test]
async fn parse_and_execute_round_trip() {
    let store = common::memory_store().await;
    let executor = executor(&store).await;

    let command = parse_command("!SUBSCRIBE high").unwrap();
    executor.execute(0xF0, command).await.unwrap();
    let subs = store.active_subscriptions(Some("high")).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].user_node_id, 0xF0);
}
