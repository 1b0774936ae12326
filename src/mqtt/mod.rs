//! # MQTT Ingest
//!
//! Holds the broker connection, subscribes to the configured topic tree, and
//! feeds every envelope through the codec into the packet grouper. NODEINFO
//! broadcasts skip the grouper and refresh the node table directly.
//!
//! The session loop reconnects with a short delay on any connection error;
//! subscriptions are re-issued on every CONNACK so broker restarts do not
//! silently drop the feed.

pub mod grouper;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::codec::{self, Codec, Decoded};
use crate::config::MqttConfig;
use crate::logutil::escape_log;
use crate::metrics;
use crate::mqtt::grouper::PacketGrouper;
use crate::storage::Store;

/// Reconnect delay after a broker error.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Topic fragments we never try to decode (JSON mirrors, stat subtrees).
const SKIP_TOPIC_PATTERNS: [&str; 3] = ["/json", "/stat/", "/telemetry"];

/// Connection state snapshot for `/health` and `!stats status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub messages_today: u64,
    pub last_message: Option<DateTime<Utc>>,
    pub reconnects: u64,
}

struct StatusInner {
    status: ConnectionStatus,
    counter_day: Option<chrono::NaiveDate>,
}

/// Shared, cloneable view of the ingest connection state.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<Mutex<StatusInner>>,
}

impl StatusHandle {
    fn new() -> Self {
        StatusHandle {
            inner: Arc::new(Mutex::new(StatusInner {
                status: ConnectionStatus::default(),
                counter_day: None,
            })),
        }
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        self.inner.lock().expect("status mutex poisoned").status.clone()
    }

    fn set_connected(&self, connected: bool) {
        let mut inner = self.inner.lock().expect("status mutex poisoned");
        if connected && !inner.status.connected {
            inner.status.connected_at = Some(Utc::now());
        }
        inner.status.connected = connected;
    }

    fn record_reconnect(&self) {
        self.inner.lock().expect("status mutex poisoned").status.reconnects += 1;
    }

    fn record_message(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("status mutex poisoned");
        let today = now.date_naive();
        if inner.counter_day != Some(today) {
            inner.counter_day = Some(today);
            inner.status.messages_today = 0;
        }
        inner.status.messages_today += 1;
        inner.status.last_message = Some(now);
    }
}

/// The MQTT reader task. Owns the broker session for its lifetime.
pub struct MqttIngest {
    config: MqttConfig,
    codec: Codec,
    grouper: Arc<PacketGrouper>,
    store: Store,
    status: StatusHandle,
}

impl MqttIngest {
    pub fn new(config: MqttConfig, codec: Codec, grouper: Arc<PacketGrouper>, store: Store) -> Self {
        MqttIngest {
            config,
            codec,
            grouper,
            store,
            status: StatusHandle::new(),
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Run until shutdown, reconnecting on broker errors.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_session(&mut shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    self.status.set_connected(false);
                    self.status.record_reconnect();
                    warn!("MQTT session ended: {:#}; reconnecting in {:?}", err, RECONNECT_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        self.status.set_connected(false);
        info!("MQTT ingest stopped");
    }

    async fn run_session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let options = self.build_options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let topic = format!("{}/#", self.config.root_topic.trim_end_matches('/'));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = client.disconnect().await;
                        return Ok(());
                    }
                }
                event = eventloop.poll() => {
                    match event.context("MQTT event loop error")? {
                        Event::Incoming(Incoming::ConnAck(_)) => {
                            info!("connected to MQTT broker; subscribing to {}", topic);
                            self.status.set_connected(true);
                            client
                                .subscribe(topic.clone(), QoS::AtLeastOnce)
                                .await
                                .context("MQTT subscribe failed")?;
                        }
                        Event::Incoming(Incoming::Publish(publish)) => {
                            self.handle_publish(&publish.topic, &publish.payload).await;
                        }
                        Event::Incoming(Incoming::Disconnect) => {
                            self.status.set_connected(false);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn build_options(&self) -> Result<MqttOptions> {
        let (host, explicit_port) = split_host_port(&self.config.server);
        let default_port = if self.config.tls_enabled { 8883 } else { 1883 };
        let client_id = format!("meshstats-{:08x}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, host, explicit_port.unwrap_or(default_port));
        options.set_keep_alive(Duration::from_secs(60));
        options.set_max_packet_size(512 * 1024, 512 * 1024);
        if let Some(username) = &self.config.username {
            options.set_credentials(username.clone(), self.config.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            format!("{}/status", self.config.root_topic.trim_end_matches('/')),
            r#"{"status": "offline"}"#,
            QoS::AtLeastOnce,
            false,
        ));
        if self.config.tls_enabled {
            let mut builder = native_tls::TlsConnector::builder();
            if self.config.tls_insecure {
                warn!("MQTT_TLS_INSECURE set: accepting self-signed broker certificates");
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
            let connector = builder.build().context("building TLS connector")?;
            options.set_transport(Transport::Tls(TlsConfiguration::NativeConnector(connector)));
        }
        Ok(options)
    }

    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        if should_skip_topic(topic) {
            return;
        }
        metrics::inc_envelopes_received();
        let now = Utc::now();

        // Replay suppression happens before any decode work; the fingerprint
        // is over the raw envelope bytes.
        let hash = codec::envelope_hash(payload);
        match self.store.observe_fingerprint(&hash, now).await {
            Ok(true) => {}
            Ok(false) => {
                metrics::inc_replay_suppressed();
                debug!("replayed envelope on {} suppressed", escape_log(topic));
                return;
            }
            Err(err) => {
                error!("fingerprint check failed: {:#}", err);
                return;
            }
        }

        match self.codec.decode_at(payload, now) {
            Decoded::Text(obs) => {
                self.status.record_message(now);
                debug!(
                    "text packet {} from {:08x} via {} ({} bytes)",
                    obs.packet_id,
                    obs.sender,
                    obs.gateway_id,
                    obs.payload.len()
                );
                if let Err(err) = self.grouper.observe(obs, now).await {
                    error!("failed to absorb observation: {:#}", err);
                }
            }
            Decoded::NodeInfo(update) => {
                metrics::inc_nodeinfo_applied();
                let result = self
                    .store
                    .apply_node_info(
                        update.node_id,
                        &update.long_name,
                        update.mesh_id.as_deref(),
                        update.role,
                        now,
                    )
                    .await;
                match result {
                    Ok(()) => debug!(
                        "node info applied for {:08x} ({})",
                        update.node_id,
                        escape_log(&update.long_name)
                    ),
                    Err(err) => error!("failed to apply node info: {:#}", err),
                }
            }
            Decoded::NonText { port } => {
                metrics::inc_unsupported_port();
                debug!("ignoring packet on unsupported port {}", port);
            }
            Decoded::PrivateDrop => {
                metrics::inc_private_dropped();
            }
            Decoded::CannotDecrypt => {
                metrics::inc_decrypt_failed();
                debug!("envelope on {} could not be decrypted", escape_log(topic));
            }
            Decoded::Malformed => {
                metrics::inc_malformed();
                debug!("malformed envelope on {}", escape_log(topic));
            }
        }
    }
}

fn should_skip_topic(topic: &str) -> bool {
    let lowered = topic.to_ascii_lowercase();
    SKIP_TOPIC_PATTERNS.iter().any(|p| lowered.contains(p))
}

fn split_host_port(server: &str) -> (String, Option<u16>) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (server.to_string(), None),
        },
        None => (server.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_json_and_stat_topics() {
        assert!(should_skip_topic("msh/US/2/json/LongFast/!aabbccdd"));
        assert!(should_skip_topic("msh/US/2/stat/!aabbccdd"));
        assert!(!should_skip_topic("msh/US/2/e/LongFast/!aabbccdd"));
    }

    #[test]
    fn host_port_split() {
        assert_eq!(split_host_port("mqtt.example.org"), ("mqtt.example.org".to_string(), None));
        assert_eq!(
            split_host_port("mqtt.example.org:8883"),
            ("mqtt.example.org".to_string(), Some(8883))
        );
    }
}
