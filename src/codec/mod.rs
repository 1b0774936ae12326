//! # Envelope Codec
//!
//! Turns a raw MQTT message body into either a parsed packet observation or a
//! typed reason for dropping it. This is the only place envelope decryption
//! and the ok-to-MQTT privacy gate live; nothing past the codec ever sees a
//! packet whose sender opted out of uplink.
//!
//! Decryption walks an ordered key ring (configured keys plus, optionally,
//! the well-known public channel key) until the plaintext parses as a
//! protobuf `Data`. Meshtastic encrypts with AES-CTR over a nonce built from
//! the packet id and sender; both 128- and 256-bit keys occur in the wild.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{debug, warn};
use prost::Message;
use sha2::{Digest, Sha256};

use crate::config::{MeshtasticConfig, DEFAULT_CHANNEL_KEY};
use crate::protobuf::{self as proto, mesh_packet::PayloadVariant, PortNum};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Device clocks drift; anything further in the future than this is replaced
/// with the arrival time.
const MAX_FUTURE_SKEW_MINUTES: i64 = 5;

/// One gateway's relay of one mesh packet, decoded and ready for grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketObservation {
    pub packet_id: u32,
    pub sender: u32,
    pub gateway_id: String,
    pub channel_id: String,
    pub sent_at: DateTime<Utc>,
    pub payload: String,
    pub rssi: Option<i64>,
    pub snr: Option<f64>,
    pub hop_start: Option<i64>,
    pub hop_limit: Option<i64>,
}

/// Identity refresh decoded from a NODEINFO broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoUpdate {
    pub node_id: u32,
    pub long_name: String,
    pub short_name: String,
    pub mesh_id: Option<String>,
    pub role: Option<i64>,
}

/// Outcome of decoding one envelope. The ingest path pattern-matches on this
/// instead of poking at optional fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Text(PacketObservation),
    NodeInfo(NodeInfoUpdate),
    /// Decoded fine but on a port we do not persist.
    NonText { port: i32 },
    /// Sender cleared the ok-to-MQTT bit; must not reach the store.
    PrivateDrop,
    /// No key on the ring produced a parseable plaintext.
    CannotDecrypt,
    /// Not a usable ServiceEnvelope.
    Malformed,
}

/// Ordered decryption key ring. Keys are tried in insertion order.
pub struct KeyRing {
    keys: Vec<Vec<u8>>,
}

impl KeyRing {
    /// Build the ring from config: the default public key first (when
    /// enabled), then the operator's keys. Invalid or duplicate entries are
    /// dropped with a warning rather than failing startup.
    pub fn from_config(config: &MeshtasticConfig) -> Self {
        let mut ring = KeyRing { keys: Vec::new() };
        if config.include_default_key {
            let default = config
                .default_key
                .as_deref()
                .unwrap_or(DEFAULT_CHANNEL_KEY);
            ring.push_base64(default);
        }
        for key in &config.decryption_keys {
            ring.push_base64(key);
        }
        if !ring.keys.is_empty() {
            log::info!("envelope key ring loaded with {} key(s)", ring.keys.len());
        }
        ring
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn push_base64(&mut self, b64: &str) {
        let trimmed = b64.trim();
        if trimmed.is_empty() {
            return;
        }
        let decoded = match base64::engine::general_purpose::STANDARD.decode(trimmed) {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!("ignoring invalid base64 decryption key");
                return;
            }
        };
        if decoded.len() != 16 && decoded.len() != 32 {
            warn!(
                "ignoring decryption key with invalid length ({} bytes)",
                decoded.len()
            );
            return;
        }
        if !self.keys.contains(&decoded) {
            self.keys.push(decoded);
        }
    }

    /// Try every key against the ciphertext; the first plaintext that parses
    /// as a protobuf `Data` wins.
    fn decrypt(&self, packet_id: u32, sender: u32, ciphertext: &[u8]) -> Option<proto::Data> {
        let nonce = build_nonce(packet_id, sender);
        for key in &self.keys {
            let mut buf = ciphertext.to_vec();
            match key.len() {
                16 => {
                    let mut cipher = Aes128Ctr::new(
                        GenericArray::from_slice(key),
                        GenericArray::from_slice(&nonce),
                    );
                    cipher.apply_keystream(&mut buf);
                }
                32 => {
                    let mut cipher = Aes256Ctr::new(
                        GenericArray::from_slice(key),
                        GenericArray::from_slice(&nonce),
                    );
                    cipher.apply_keystream(&mut buf);
                }
                _ => continue,
            }
            if let Ok(data) = proto::Data::decode(buf.as_slice()) {
                // A wrong key can still yield bytes that happen to decode;
                // require a known-plausible portnum to reduce false accepts.
                if data.portnum >= 0 && data.portnum < 512 {
                    return Some(data);
                }
            }
        }
        None
    }
}

/// AES-CTR nonce: packet id as 8 LE bytes, sender as 4 LE bytes, 4 zero bytes.
fn build_nonce(packet_id: u32, sender: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    nonce[8..12].copy_from_slice(&sender.to_le_bytes());
    nonce
}

/// SHA-256 of the raw envelope bytes, taken before any decode attempt. This
/// is the replay-suppression fingerprint.
pub fn envelope_hash(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Canonicalise a gateway id to `!` + exactly 8 lowercase hex digits.
pub fn canonical_gateway_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let hex = trimmed.strip_prefix('!').unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 8 {
        return None;
    }
    let value = u32::from_str_radix(hex, 16).ok()?;
    Some(format!("!{:08x}", value))
}

/// Envelope decoder. Holds the key ring; stateless otherwise.
pub struct Codec {
    keyring: KeyRing,
}

impl Codec {
    pub fn new(keyring: KeyRing) -> Self {
        Codec { keyring }
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    /// Decode one raw MQTT message body.
    pub fn decode(&self, payload: &[u8]) -> Decoded {
        self.decode_at(payload, Utc::now())
    }

    /// [`Codec::decode`] with an explicit arrival instant, for tests.
    pub fn decode_at(&self, payload: &[u8], now: DateTime<Utc>) -> Decoded {
        if payload.is_empty() {
            return Decoded::Malformed;
        }
        let envelope = match proto::ServiceEnvelope::decode(payload) {
            Ok(env) => env,
            Err(_) => return Decoded::Malformed,
        };
        let packet = match envelope.packet {
            Some(p) if p.id != 0 => p,
            _ => return Decoded::Malformed,
        };

        let gateway_id = match canonical_gateway_id(&envelope.gateway_id) {
            Some(id) => id,
            None => {
                debug!(
                    "envelope for packet {} has unusable gateway id {:?}",
                    packet.id,
                    crate::logutil::escape_log(&envelope.gateway_id)
                );
                return Decoded::Malformed;
            }
        };

        let data = match &packet.payload_variant {
            Some(PayloadVariant::Decoded(data)) => data.clone(),
            Some(PayloadVariant::Encrypted(ciphertext)) => {
                match self.keyring.decrypt(packet.id, packet.from, ciphertext) {
                    Some(data) => data,
                    None => return Decoded::CannotDecrypt,
                }
            }
            None => return Decoded::Malformed,
        };

        match PortNum::try_from(data.portnum) {
            Ok(PortNum::TextMessageApp) => {
                if let Some(bits) = data.bitfield {
                    if bits & proto::BITFIELD_OK_TO_MQTT == 0 {
                        debug!(
                            "dropping packet {} from {:08x}: ok_to_mqtt disabled",
                            packet.id, packet.from
                        );
                        return Decoded::PrivateDrop;
                    }
                }
                let text = String::from_utf8_lossy(&data.payload).into_owned();
                Decoded::Text(PacketObservation {
                    packet_id: packet.id,
                    sender: packet.from,
                    gateway_id,
                    channel_id: envelope.channel_id,
                    sent_at: sent_at(&packet, now),
                    payload: text,
                    rssi: (packet.rx_rssi != 0).then_some(packet.rx_rssi as i64),
                    snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr as f64),
                    hop_start: (packet.hop_start != 0).then_some(packet.hop_start as i64),
                    hop_limit: (packet.hop_limit != 0).then_some(packet.hop_limit as i64),
                })
            }
            Ok(PortNum::NodeinfoApp) => match proto::User::decode(data.payload.as_slice()) {
                Ok(user) => Decoded::NodeInfo(NodeInfoUpdate {
                    node_id: packet.from,
                    long_name: user.long_name,
                    short_name: user.short_name,
                    mesh_id: (!user.id.is_empty()).then_some(user.id),
                    role: (user.role != 0).then_some(user.role as i64),
                }),
                Err(_) => Decoded::Malformed,
            },
            _ => Decoded::NonText { port: data.portnum },
        }
    }
}

/// Sent-at instant for a packet: the device `rx_time` when present, clamped
/// against clock skew, else the arrival time.
fn sent_at(packet: &proto::MeshPacket, now: DateTime<Utc>) -> DateTime<Utc> {
    if packet.rx_time == 0 {
        return now;
    }
    let ts = match Utc.timestamp_opt(packet.rx_time as i64, 0) {
        chrono::LocalResult::Single(ts) => ts,
        _ => return now,
    };
    if ts > now + Duration::minutes(MAX_FUTURE_SKEW_MINUTES) {
        warn!("clamping future-dated packet timestamp {} to now", ts);
        return now;
    }
    ts
}
