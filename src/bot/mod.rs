//! # Command Bot
//!
//! Long-lived session against a mesh radio over TCP (Meshtastic stream API).
//! Listens for `!`-prefixed text packets addressed to the bot's node (or
//! broadcast on a channel we watch), answers them as chunked direct messages,
//! and carries the scheduler's daily summaries out onto the mesh.
//!
//! Session states: `Disconnected → Connecting → Connected → Subscribed →
//! Draining → Disconnected`. `Connected` means the radio handshake produced
//! device info; `Subscribed` means the config dump completed and packet
//! events are flowing. Any I/O error drops back to `Disconnected` and the
//! reconnect backoff (1s doubling to 30s, reset by a successful send) takes
//! over.

pub mod commands;
pub mod framer;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use prost::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

use crate::bot::commands::{parse_command, Command, CommandExecutor};
use crate::bot::framer::{frame, StreamFramer};
use crate::config::MeshtasticConfig;
use crate::logutil::truncate_for_log;
use crate::metrics;
use crate::protobuf::{self as proto, from_radio, mesh_packet, to_radio, PortNum};
use crate::storage::Store;

/// Broadcast destination on the mesh.
const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Reconnect backoff bounds, seconds.
const BACKOFF_INITIAL_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;

/// Reconnect if the radio goes silent for this long.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Heartbeat cadence on an otherwise idle link.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound queue capacity; oldest entries are dropped at the cap.
const OUTBOUND_QUEUE_CAP: usize = 128;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Draining,
}

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Node(u32),
    Channel(u8),
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: Destination,
    pub text: String,
}

/// Bounded drop-oldest queue between the scheduler and the radio session.
struct OutboundQueue {
    messages: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
}

impl OutboundQueue {
    fn new() -> Self {
        OutboundQueue {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, message: OutboundMessage) {
        let mut queue = self.messages.lock().expect("outbound queue poisoned");
        if queue.len() >= OUTBOUND_QUEUE_CAP {
            queue.pop_front();
            warn!("outbound mesh queue full; dropping oldest message");
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<OutboundMessage> {
        self.messages.lock().expect("outbound queue poisoned").pop_front()
    }

    fn len(&self) -> usize {
        self.messages.lock().expect("outbound queue poisoned").len()
    }

    async fn pop(&self) -> OutboundMessage {
        loop {
            if let Some(message) = self.try_pop() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BotStatus {
    pub enabled: bool,
    pub state: BotState,
    pub connected: bool,
    pub node_id: Option<u32>,
    pub restart_count: u64,
    pub last_error: Option<String>,
    pub queue_depth: usize,
}

struct StatusInner {
    state: BotState,
    node_id: Option<u32>,
    restart_count: u64,
    last_error: Option<String>,
}

/// Cloneable control/observation handle for the bot session.
#[derive(Clone)]
pub struct BotHandle {
    enabled: bool,
    queue: Arc<OutboundQueue>,
    status: Arc<Mutex<StatusInner>>,
    restart: Arc<Notify>,
}

impl BotHandle {
    /// Queue a direct message. Dropped (with a log line) when the bot is disabled.
    pub fn send_dm(&self, node_id: u32, text: String) {
        if !self.enabled {
            warn!("bot disabled; dropping DM for {:08x}", node_id);
            return;
        }
        self.queue.push(OutboundMessage {
            to: Destination::Node(node_id),
            text,
        });
    }

    /// Queue a channel broadcast.
    pub fn send_channel(&self, channel: u8, text: String) {
        if !self.enabled {
            warn!("bot disabled; dropping broadcast for channel {}", channel);
            return;
        }
        self.queue.push(OutboundMessage {
            to: Destination::Channel(channel),
            text,
        });
    }

    /// Tear down the current radio session and reconnect.
    pub fn request_restart(&self) {
        self.restart.notify_one();
    }

    pub fn status(&self) -> BotStatus {
        let inner = self.status.lock().expect("bot status poisoned");
        BotStatus {
            enabled: self.enabled,
            state: inner.state,
            connected: matches!(inner.state, BotState::Connected | BotState::Subscribed),
            node_id: inner.node_id,
            restart_count: inner.restart_count,
            last_error: inner.last_error.clone(),
            queue_depth: self.queue.len(),
        }
    }

    fn set_state(&self, state: BotState) {
        self.status.lock().expect("bot status poisoned").state = state;
    }

    fn set_node_id(&self, node_id: u32) {
        self.status.lock().expect("bot status poisoned").node_id = Some(node_id);
    }

    fn record_error(&self, err: &anyhow::Error) {
        let mut inner = self.status.lock().expect("bot status poisoned");
        inner.last_error = Some(format!("{:#}", err));
        inner.restart_count += 1;
    }
}

/// Per-sender sliding-window rate limiter with a once-per-window warning.
struct RateLimiter {
    window: Duration,
    burst: usize,
    entries: HashMap<u32, Vec<Instant>>,
    warned: HashMap<u32, Instant>,
}

impl RateLimiter {
    fn new(window: Duration, burst: usize) -> Self {
        RateLimiter {
            window,
            burst,
            entries: HashMap::new(),
            warned: HashMap::new(),
        }
    }

    /// Returns `(allowed, should_warn)`.
    fn check(&mut self, node_id: u32, now: Instant) -> (bool, bool) {
        let timestamps = self.entries.entry(node_id).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);
        if timestamps.len() >= self.burst {
            let warn_due = match self.warned.get(&node_id) {
                Some(last) => now.duration_since(*last) >= self.window,
                None => true,
            };
            if warn_due {
                self.warned.insert(node_id, now);
            }
            return (false, warn_due);
        }
        timestamps.push(now);
        if self.entries.len() > 256 {
            self.cleanup(now);
        }
        (true, false)
    }

    fn cleanup(&mut self, now: Instant) {
        let horizon = self.window * 10;
        self.entries
            .retain(|_, ts| ts.iter().any(|t| now.duration_since(*t) < horizon));
        self.warned
            .retain(|_, t| now.duration_since(*t) < horizon);
    }
}

/// Chunk a UTF-8 string into `<= max_bytes` segments without splitting
/// codepoints, preferring line breaks, then spaces, then a hard cut.
pub fn chunk_utf8(text: &str, max_bytes: usize) -> Vec<String> {
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            chunks.push(remaining.to_string());
            break;
        }
        let mut end = max_bytes.min(remaining.len());
        while end > 0 && !remaining.is_char_boundary(end) {
            end -= 1;
        }
        let slice = &remaining[..end];
        // Prefer the last newline, then the last space, as long as the break
        // point keeps the chunk reasonably full.
        let break_at = slice
            .rfind('\n')
            .filter(|pos| *pos + 1 >= end / 2)
            .or_else(|| slice.rfind(' ').filter(|pos| *pos + 1 >= end / 2));
        match break_at {
            Some(pos) => {
                chunks.push(slice[..pos].to_string());
                remaining = &remaining[pos + 1..];
            }
            None => {
                chunks.push(slice.to_string());
                remaining = &remaining[end..];
            }
        }
    }
    chunks.into_iter().filter(|c| !c.trim().is_empty()).collect()
}

/// The radio session task.
pub struct CommandBot {
    config: MeshtasticConfig,
    store: Store,
    executor: CommandExecutor,
    handle: BotHandle,
    /// Set by any successful send; read by the reconnect loop to reset backoff.
    sent_ok: AtomicBool,
}

impl CommandBot {
    pub fn new(config: MeshtasticConfig, store: Store, executor: CommandExecutor) -> (Self, BotHandle) {
        let handle = BotHandle {
            enabled: config.commands_enabled && config.connection_url.is_some(),
            queue: Arc::new(OutboundQueue::new()),
            status: Arc::new(Mutex::new(StatusInner {
                state: BotState::Disconnected,
                node_id: None,
                restart_count: 0,
                last_error: None,
            })),
            restart: Arc::new(Notify::new()),
        };
        let bot = CommandBot {
            config,
            store,
            executor,
            handle: handle.clone(),
            sent_ok: AtomicBool::new(false),
        };
        (bot, handle)
    }

    pub fn handle(&self) -> BotHandle {
        self.handle.clone()
    }

    /// Run until shutdown, reconnecting with capped exponential backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.commands_enabled {
            info!("command bot disabled by configuration");
            return;
        }
        let url = match &self.config.connection_url {
            Some(url) => url.clone(),
            None => {
                error!("MESHTASTIC_COMMANDS_ENABLED is set but MESHTASTIC_CONNECTION_URL is not");
                return;
            }
        };

        let mut backoff = BACKOFF_INITIAL_SECS;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.handle.set_state(BotState::Connecting);
            self.sent_ok.store(false, Ordering::Relaxed);
            match self.run_session(&url, &mut shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    self.handle.set_state(BotState::Disconnected);
                    self.handle.record_error(&err);
                    metrics::inc_bot_reconnects();
                    if self.sent_ok.swap(false, Ordering::Relaxed) {
                        backoff = BACKOFF_INITIAL_SECS;
                    }
                    warn!("radio session ended: {:#}; reconnecting in {}s", err, backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP_SECS);
                }
            }
        }
        self.handle.set_state(BotState::Disconnected);
        info!("command bot stopped");
    }

    async fn run_session(&self, url: &str, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let addr = parse_tcp_url(url)?;
        info!("connecting to mesh radio at {}", addr);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("timed out connecting to {}", addr))?
            .with_context(|| format!("connecting to {}", addr))?;
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();

        // Handshake: ask for the config dump; the radio sends MyNodeInfo and
        // finishes by echoing our nonce.
        let config_nonce: u32 = rand::random::<u32>() | 1;
        send_frame(
            &mut writer,
            &proto::ToRadio {
                payload_variant: Some(to_radio::PayloadVariant::WantConfigId(config_nonce)),
            },
        )
        .await?;

        let mut framer = StreamFramer::new();
        let mut read_buf = [0u8; 4096];
        let mut my_node_id: Option<u32> = self.handle.status().node_id;
        let mut rate_limiter = RateLimiter::new(
            Duration::from_secs(self.config.rate_limit_seconds),
            self.config.rate_limit_burst as usize,
        );
        let mut last_read = Instant::now();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut subscribed = false;

        loop {
            // Checked at the loop top as well: a chunked send may have
            // consumed the watch notification while pausing between chunks.
            if *shutdown.borrow() {
                self.handle.set_state(BotState::Draining);
                let _ = send_frame(
                    &mut writer,
                    &proto::ToRadio {
                        payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
                    },
                )
                .await;
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = self.handle.restart.notified() => {
                    bail!("restart requested");
                }
                read = reader.read(&mut read_buf) => {
                    let n = read.context("radio read failed")?;
                    if n == 0 {
                        bail!("radio closed the connection");
                    }
                    last_read = Instant::now();
                    framer.push(&read_buf[..n]);
                    while let Some(payload) = framer.next_frame() {
                        match proto::FromRadio::decode(payload.as_slice()) {
                            Ok(frame) => {
                                self.handle_from_radio(
                                    frame,
                                    config_nonce,
                                    &mut my_node_id,
                                    &mut subscribed,
                                    &mut rate_limiter,
                                    &mut writer,
                                    shutdown,
                                ).await?;
                            }
                            Err(err) => debug!("undecodable FromRadio frame: {}", err),
                        }
                    }
                }
                message = self.handle.queue.pop(), if subscribed => {
                    self.deliver(&mut writer, message, shutdown).await?;
                }
                _ = heartbeat.tick() => {
                    if last_read.elapsed() > INACTIVITY_TIMEOUT {
                        bail!("radio link inactive for {:?}", INACTIVITY_TIMEOUT);
                    }
                    send_frame(&mut writer, &proto::ToRadio {
                        payload_variant: Some(to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {})),
                    }).await.context("heartbeat send failed")?;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_from_radio(
        &self,
        frame: proto::FromRadio,
        config_nonce: u32,
        my_node_id: &mut Option<u32>,
        subscribed: &mut bool,
        rate_limiter: &mut RateLimiter,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        match frame.payload_variant {
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                info!("radio handshake: our node id is {:08x}", info.my_node_num);
                *my_node_id = Some(info.my_node_num);
                self.handle.set_node_id(info.my_node_num);
                self.handle.set_state(BotState::Connected);
            }
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
                if id == config_nonce {
                    info!("radio config dump complete; packet events subscribed");
                    *subscribed = true;
                    self.handle.set_state(BotState::Subscribed);
                } else {
                    debug!("ignoring config_complete for stale nonce {:08x}", id);
                }
            }
            Some(from_radio::PayloadVariant::Packet(packet)) => {
                if let Some(me) = *my_node_id {
                    self.handle_inbound_packet(packet, me, rate_limiter, writer, shutdown)
                        .await?;
                }
            }
            Some(from_radio::PayloadVariant::NodeInfo(node)) => {
                debug!("radio node db entry for {:08x}", node.num);
            }
            None => {}
        }
        Ok(())
    }

    async fn handle_inbound_packet(
        &self,
        packet: proto::MeshPacket,
        my_node_id: u32,
        rate_limiter: &mut RateLimiter,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let data = match &packet.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data))
                if data.portnum == PortNum::TextMessageApp as i32 =>
            {
                data
            }
            _ => return Ok(()),
        };
        // Our own transmissions echo back from the radio.
        if packet.from == my_node_id {
            return Ok(());
        }
        // DMs to us always count; broadcasts only on channels we watch.
        let is_dm = packet.to == my_node_id;
        let watched_broadcast = packet.to == BROADCAST_ADDR
            && (packet.channel == 0 || packet.channel == self.config.stats_channel_id as u32);
        if !is_dm && !watched_broadcast {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&data.payload);
        let command = match parse_command(&text) {
            Some(command) => command,
            None => return Ok(()),
        };
        let sender = packet.from;
        let logged_text = text.trim().to_lowercase();
        info!(
            "command from {:08x}: {}",
            sender,
            truncate_for_log(&text, 120)
        );

        let node = self.store.get_node(sender).await.unwrap_or(None);
        let username = node
            .as_ref()
            .map(|n| n.name.clone())
            .unwrap_or_else(|| format!("node-{}", sender));
        let mesh_id = node.as_ref().and_then(|n| n.mesh_id.clone());

        let (allowed, should_warn) = rate_limiter.check(sender, Instant::now());
        if !allowed {
            metrics::inc_commands_rate_limited();
            if let Err(err) = self
                .store
                .append_command_log(
                    sender,
                    &username,
                    mesh_id.as_deref(),
                    &logged_text,
                    should_warn,
                    true,
                )
                .await
            {
                warn!("failed to log rate-limited command: {:#}", err);
            }
            if should_warn {
                self.send_chunked(
                    writer,
                    Destination::Node(sender),
                    "⚠️ Rate limit: please slow down before sending another command.",
                    shutdown,
                )
                .await?;
            }
            return Ok(());
        }

        // Audit before the reply is attempted.
        if let Err(err) = self
            .store
            .append_command_log(
                sender,
                &username,
                mesh_id.as_deref(),
                &logged_text,
                true,
                false,
            )
            .await
        {
            warn!("failed to log command: {:#}", err);
        }
        metrics::inc_commands_processed();
        self.store.touch_node(sender, Utc::now()).await.ok();

        let reply = match self.executor.execute(sender, command).await {
            Ok(reply) => reply,
            Err(err) => {
                error!("command execution failed: {:#}", err);
                "Something went wrong computing that; try again shortly.".to_string()
            }
        };

        self.send_chunked(writer, Destination::Node(sender), &reply, shutdown)
            .await?;

        // Optional echo of successful replies onto the stats channel.
        if self.config.stats_channel_id > 0 && !matches!(command, Command::Unknown) {
            self.send_chunked(
                writer,
                Destination::Channel(self.config.stats_channel_id),
                &reply,
                shutdown,
            )
            .await?;
        }
        Ok(())
    }

    async fn deliver(
        &self,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        message: OutboundMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.send_chunked(writer, message.to, &message.text, shutdown).await
    }

    /// Split `text` for the radio frame cap and send each chunk with the
    /// configured inter-chunk pause. A failed send abandons the remainder.
    async fn send_chunked(
        &self,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        to: Destination,
        text: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let chunks = chunk_utf8(text, self.config.max_message_bytes);
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(self.config.inter_chunk_delay_seconds)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            warn!("shutdown during chunked send; {} chunk(s) abandoned", total - index);
                            return Ok(());
                        }
                    }
                }
            }
            debug!(
                "sending chunk {}/{} to {:?} ({} bytes)",
                index + 1,
                total,
                to,
                chunk.len()
            );
            self.send_text(writer, to, chunk)
                .await
                .with_context(|| format!("sending chunk {}/{}", index + 1, total))?;
        }
        Ok(())
    }

    async fn send_text(
        &self,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        to: Destination,
        text: &str,
    ) -> Result<()> {
        let (to_addr, channel, want_ack) = match to {
            Destination::Node(node_id) => (node_id, 0, true),
            Destination::Channel(channel) => (BROADCAST_ADDR, channel as u32, false),
        };
        let packet = proto::MeshPacket {
            to: to_addr,
            channel,
            id: rand::random::<u32>() | 1,
            want_ack,
            hop_limit: 3,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };
        send_frame(
            writer,
            &proto::ToRadio {
                payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
            },
        )
        .await?;
        self.sent_ok.store(true, Ordering::Relaxed);
        Ok(())
    }
}

async fn send_frame(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &proto::ToRadio,
) -> Result<()> {
    let framed = frame(&message.encode_to_vec());
    writer.write_all(&framed).await.context("radio write failed")?;
    writer.flush().await.context("radio flush failed")?;
    Ok(())
}

/// Accepts `tcp://host[:port]` (default port 4403) or bare `host:port`.
fn parse_tcp_url(url: &str) -> Result<String> {
    if let Some(rest) = url.strip_prefix("serial://") {
        bail!(
            "serial transport ({}) is not supported; use tcp://host:4403",
            rest
        );
    }
    let rest = url.strip_prefix("tcp://").unwrap_or(url);
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        bail!("empty MESHTASTIC_CONNECTION_URL");
    }
    Ok(if rest.contains(':') {
        rest.to_string()
    } else {
        format!("{}:4403", rest)
    })
}
