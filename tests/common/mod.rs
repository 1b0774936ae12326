//! Shared helpers for the integration tests: in-memory stores, canned
//! envelopes, and a fully wired router.
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use prost::Message;
use std::sync::Arc;

use meshstats::api::{build_router, AppState};
use meshstats::bot::commands::CommandExecutor;
use meshstats::bot::CommandBot;
use meshstats::codec::{Codec, KeyRing};
use meshstats::config::{MeshtasticConfig, ScheduleConfig};
use meshstats::mqtt::grouper::PacketGrouper;
use meshstats::mqtt::MqttIngest;
use meshstats::protobuf::{self as proto, mesh_packet, PortNum};
use meshstats::scheduler::Scheduler;
use meshstats::stats::StatsEngine;
use meshstats::storage::Store;
use meshstats::subscriptions::SubscriptionSvc;

pub async fn memory_store() -> Store {
    Store::open("sqlite://:memory:").await.expect("open store")
}

pub fn meshtastic_config() -> MeshtasticConfig {
    MeshtasticConfig {
        connection_url: None,
        commands_enabled: false,
        stats_channel_id: 0,
        decryption_keys: Vec::new(),
        include_default_key: true,
        default_key: None,
        rate_limit_seconds: 60,
        rate_limit_burst: 5,
        max_message_bytes: 200,
        inter_chunk_delay_seconds: 5,
    }
}

pub fn default_codec() -> Codec {
    Codec::new(KeyRing::from_config(&meshtastic_config()))
}

/// A plaintext TEXT_MESSAGE_APP ServiceEnvelope, as a gateway would publish it.
pub fn text_envelope(packet_id: u32, sender: u32, gateway: &str, text: &str) -> Vec<u8> {
    text_envelope_with_bitfield(packet_id, sender, gateway, text, Some(1))
}

pub fn text_envelope_with_bitfield(
    packet_id: u32,
    sender: u32,
    gateway: &str,
    text: &str,
    bitfield: Option<u32>,
) -> Vec<u8> {
    proto::ServiceEnvelope {
        packet: Some(proto::MeshPacket {
            from: sender,
            to: 0xFFFF_FFFF,
            id: packet_id,
            rx_time: Utc::now().timestamp() as u32,
            rx_rssi: -95,
            rx_snr: 5.5,
            hop_limit: 3,
            hop_start: 5,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                bitfield,
                ..Default::default()
            })),
            ..Default::default()
        }),
        channel_id: "LongFast".to_string(),
        gateway_id: gateway.to_string(),
    }
    .encode_to_vec()
}

/// The full service wiring minus the network tasks, for router-level tests.
pub struct TestApp {
    pub store: Store,
    pub stats: StatsEngine,
    pub grouper: Arc<PacketGrouper>,
    pub router: axum::Router,
}

pub async fn test_app() -> TestApp {
    let store = memory_store().await;
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
        default_codec(),
        grouper.clone(),
        store.clone(),
    );
    let executor = CommandExecutor::new(
        stats.clone(),
        subscriptions.clone(),
        ingest.status_handle(),
    );
    let (bot, bot_handle) = CommandBot::new(meshtastic_config(), store.clone(), executor);
    drop(bot); // router tests never run the radio session
    let scheduler = Scheduler::new(
        stats.clone(),
        subscriptions.clone(),
        bot_handle.clone(),
        ScheduleConfig {
            subscription_send_hour: 9,
            subscription_send_minute: 0,
            broadcast_enabled: false,
            broadcast_hour: 21,
            broadcast_minute: 0,
            broadcast_channel: 0,
        },
    );

    let state = AppState {
        store: store.clone(),
        stats: stats.clone(),
        subscriptions,
        mqtt_status: ingest.status_handle(),
        bot: bot_handle,
        scheduler_status: scheduler.handle(),
        scheduler: scheduler.clone(),
        started_at: Utc::now(),
    };
    let router = build_router(state, "./dashboard");
    TestApp {
        store,
        stats,
        grouper,
        router,
    }
}

/// Drive an envelope through the ingest pipeline the way the MQTT task does:
/// fingerprint check, decode, grouper observe.
pub async fn ingest_envelope(
    store: &Store,
    codec: &Codec,
    grouper: &PacketGrouper,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Option<meshstats::mqtt::grouper::ObserveOutcome> {
    let hash = meshstats::codec::envelope_hash(payload);
    if !store.observe_fingerprint(&hash, now).await.expect("fingerprint") {
        return None;
    }
    match codec.decode_at(payload, now) {
        meshstats::codec::Decoded::Text(obs) => {
            Some(grouper.observe(obs, now).await.expect("observe"))
        }
        _ => None,
    }
}
