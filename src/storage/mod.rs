//! # Storage Module - Durable State
//!
//! All durable rows live here: nodes, packets, gateway relays, envelope
//! fingerprints, subscriptions, the stat cache, and the command audit log.
//! The rest of the crate reads and writes exclusively through [`Store`].
//!
//! ## Schema
//!
//! A single relational schema, created idempotently at startup:
//!
//! ```text
//! nodes                 one row per mesh node ever observed
//! packets               one row per mesh packet (unique packet_id)
//! packet_gateways       (packet_id, gateway_id) unique relay links
//! envelope_fingerprints SHA-256 of ingested envelopes, for replay suppression
//! subscriptions         at most one active daily-summary subscription per node
//! stat_cache            TTL'd JSON blobs keyed by canonical query strings
//! command_logs          append-only bot command audit
//! ```
//!
//! ## Concurrency
//!
//! SQLite serialises writes globally, so the pool holds a single connection
//! (readers queue behind writers; at this scale that is cheaper than juggling
//! reader pools) with WAL and a busy timeout. On top of that, the two hot
//! write paths retry with exponential backoff before surfacing failure.
//!
//! Invariants owned here:
//! - `packets.gateway_count` always equals the number of `packet_gateways`
//!   rows for that packet.
//! - a grouped insert is one transaction: packet and relay rows become
//!   visible together.
//! - late-relay reconciliation is idempotent per `(packet_id, gateway_id)`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Write-retry policy for "database is locked" contention.
const WRITE_RETRY_ATTEMPTS: u32 = 10;
const WRITE_RETRY_BASE_MS: u64 = 25;
const WRITE_RETRY_CAP_MS: u64 = 1_000;

/// A mesh node as stored.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeRow {
    pub node_id: i64,
    pub name: String,
    pub mesh_id: Option<String>,
    pub role: Option<i64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A stored packet with its reconstructed gateway count.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PacketRow {
    pub id: i64,
    pub packet_id: i64,
    pub sender_user_id: i64,
    pub sender_name: String,
    pub sent_at: DateTime<Utc>,
    pub gateway_count: i64,
    pub rssi: Option<i64>,
    pub snr: Option<f64>,
    pub hop_start: Option<i64>,
    pub hop_limit: Option<i64>,
    pub hops_travelled: Option<i64>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Packet fields as handed over by the grouper at close.
#[derive(Debug, Clone)]
pub struct NewPacket {
    pub packet_id: u32,
    pub sender: u32,
    pub sender_name: String,
    pub sent_at: DateTime<Utc>,
    pub rssi: Option<i64>,
    pub snr: Option<f64>,
    pub hop_start: Option<i64>,
    pub hop_limit: Option<i64>,
    pub payload: String,
}

/// Outcome of a late-relay reconcile attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// New relay attached; packet count incremented to the carried value.
    Reconciled { gateway_count: i64 },
    /// The `(packet_id, gateway_id)` pair was already recorded.
    AlreadyKnown,
    /// No such packet, or it fell out of the late-arrival retention bound.
    NotFoundOrExpired,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionRow {
    pub user_node_id: i64,
    pub variant: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandLogRow {
    pub id: i64,
    pub node_id: i64,
    pub username: String,
    pub mesh_id: Option<String>,
    pub command: String,
    pub response_sent: bool,
    pub rate_limited: bool,
    pub timestamp: DateTime<Utc>,
}

/// min/avg/max/count/first/last over a time range, before percentiles.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AggregateRow {
    pub message_count: i64,
    pub avg_gateways: Option<f64>,
    pub min_gateways: Option<i64>,
    pub max_gateways: Option<i64>,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HourlyRow {
    pub hour: i64,
    pub message_count: i64,
    pub avg_gateways: Option<f64>,
    pub min_gateways: Option<i64>,
    pub max_gateways: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TopSenderRow {
    pub node_id: i64,
    pub name: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewaySeenRow {
    pub gateway_id: String,
    pub relay_count: i64,
    pub last_observed: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NetworkCounts {
    pub total_nodes: i64,
    pub total_gateways: i64,
    pub active_nodes_24h: i64,
    pub active_nodes_7d: i64,
    pub active_nodes_30d: i64,
    pub active_gateways_24h: i64,
    pub active_gateways_7d: i64,
    pub active_gateways_30d: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseInfo {
    pub nodes: i64,
    pub packets: i64,
    pub packet_gateways: i64,
    pub envelope_fingerprints: i64,
    pub subscriptions: i64,
    pub stat_cache: i64,
    pub command_logs: i64,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExpireSummary {
    pub packets: u64,
    pub fingerprints: u64,
    pub stat_cache: u64,
    pub command_logs: u64,
}

/// Shared handle to the database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database named by `database_url`
    /// (`sqlite://path` or a bare path) and run migrations.
    pub async fn open(database_url: &str) -> Result<Self> {
        let path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        let opts = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating database directory {:?}", parent))?;
                }
            }
            SqliteConnectOptions::new().filename(path).create_if_missing(true)
        };
        let opts = opts
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        // One connection: SQLite serialises writers anyway, and a single
        // queue avoids persistent lock errors under HTTP concurrency.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening database {}", database_url))?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL UNIQUE,
                name TEXT NOT NULL,
                mesh_id TEXT,
                role INTEGER,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS packets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                packet_id INTEGER NOT NULL UNIQUE,
                sender INTEGER NOT NULL,
                sender_name TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                gateway_count INTEGER NOT NULL DEFAULT 0,
                rssi INTEGER,
                snr REAL,
                hop_start INTEGER,
                hop_limit INTEGER,
                hops_travelled INTEGER,
                payload TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS ix_packets_sent_at ON packets(sent_at)",
            "CREATE INDEX IF NOT EXISTS ix_packets_sender ON packets(sender)",
            "CREATE TABLE IF NOT EXISTS packet_gateways (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                packet_id INTEGER NOT NULL REFERENCES packets(packet_id) ON DELETE CASCADE,
                gateway_id TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                UNIQUE(packet_id, gateway_id)
            )",
            "CREATE INDEX IF NOT EXISTS ix_packet_gateways_gateway ON packet_gateways(gateway_id)",
            "CREATE TABLE IF NOT EXISTS envelope_fingerprints (
                hash BLOB NOT NULL UNIQUE,
                seen_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS ix_envelope_fingerprints_seen_at
                ON envelope_fingerprints(seen_at)",
            "CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_node_id INTEGER NOT NULL UNIQUE,
                variant TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS stat_cache (
                key TEXT NOT NULL UNIQUE,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS command_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                mesh_id TEXT,
                command TEXT NOT NULL,
                response_sent INTEGER NOT NULL DEFAULT 1,
                rate_limited INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS ix_command_logs_timestamp ON command_logs(timestamp)",
            "CREATE INDEX IF NOT EXISTS ix_command_logs_node ON command_logs(node_id)",
        ];
        for stmt in ddl {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Quick connectivity probe; returns the round-trip latency.
    pub async fn health_latency(&self) -> Result<std::time::Duration> {
        let started = std::time::Instant::now();
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(started.elapsed())
    }

    // ------------------------------------------------------------------
    // Ingest write paths
    // ------------------------------------------------------------------

    /// Record an envelope fingerprint. Returns `true` when the fingerprint is
    /// new, `false` when this envelope was already ingested (replay).
    pub async fn observe_fingerprint(&self, hash: &[u8], seen_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO envelope_fingerprints (hash, seen_at) VALUES (?, ?)")
            .bind(hash)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist a closed packet group: node upsert, the packet row, and every
    /// gateway relay, in one transaction. Returns the new packet surrogate id,
    /// or `None` when a concurrent writer already inserted this `packet_id`
    /// (the caller falls back to the reconcile path).
    pub async fn insert_grouped_packet(
        &self,
        packet: &NewPacket,
        relays: &[(String, DateTime<Utc>)],
    ) -> Result<Option<i64>> {
        let mut delay = std::time::Duration::from_millis(WRITE_RETRY_BASE_MS);
        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            match self.try_insert_grouped_packet(packet, relays).await {
                Ok(id) => return Ok(id),
                Err(err) if is_busy_error(&err) && attempt < WRITE_RETRY_ATTEMPTS => {
                    debug!(
                        "grouped insert for packet {} busy (attempt {}), backing off {:?}",
                        packet.packet_id, attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(std::time::Duration::from_millis(WRITE_RETRY_CAP_MS));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(anyhow!(
            "grouped insert for packet {} failed after {} attempts",
            packet.packet_id,
            WRITE_RETRY_ATTEMPTS
        ))
    }

    async fn try_insert_grouped_packet(
        &self,
        packet: &NewPacket,
        relays: &[(String, DateTime<Utc>)],
    ) -> std::result::Result<Option<i64>, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        upsert_node_tx(&mut tx, packet.sender, &packet.sender_name, packet.sent_at).await?;

        let hops_travelled = match (packet.hop_start, packet.hop_limit) {
            (Some(start), Some(limit)) => Some(start - limit),
            _ => None,
        };
        let inserted = sqlx::query(
            "INSERT INTO packets (packet_id, sender, sender_name, sent_at, gateway_count,
                                  rssi, snr, hop_start, hop_limit, hops_travelled, payload,
                                  created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(packet_id) DO NOTHING",
        )
        .bind(packet.packet_id as i64)
        .bind(packet.sender as i64)
        .bind(&packet.sender_name)
        .bind(packet.sent_at)
        .bind(packet.rssi)
        .bind(packet.snr)
        .bind(packet.hop_start)
        .bind(packet.hop_limit)
        .bind(hops_travelled)
        .bind(&packet.payload)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Unique-constraint defence in depth: someone beat us to it.
            tx.rollback().await?;
            return Ok(None);
        }

        for (gateway_id, observed_at) in relays {
            sqlx::query(
                "INSERT INTO packet_gateways (packet_id, gateway_id, observed_at)
                 VALUES (?, ?, ?) ON CONFLICT(packet_id, gateway_id) DO NOTHING",
            )
            .bind(packet.packet_id as i64)
            .bind(gateway_id)
            .bind(observed_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE packets SET gateway_count =
                 (SELECT COUNT(*) FROM packet_gateways WHERE packet_id = ?),
                 updated_at = ?
             WHERE packet_id = ?",
        )
        .bind(packet.packet_id as i64)
        .bind(now)
        .bind(packet.packet_id as i64)
        .execute(&mut *tx)
        .await?;

        let row_id: i64 = sqlx::query_scalar("SELECT id FROM packets WHERE packet_id = ?")
            .bind(packet.packet_id as i64)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row_id))
    }

    /// Attach a late gateway relay to an already-persisted packet. Idempotent
    /// per `(packet_id, gateway_id)`; packets older than `retention` are left
    /// untouched.
    pub async fn reconcile_late_relay(
        &self,
        packet_id: u32,
        sender: u32,
        gateway_id: &str,
        observed_at: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ReconcileOutcome> {
        let mut delay = std::time::Duration::from_millis(WRITE_RETRY_BASE_MS);
        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            match self
                .try_reconcile_late_relay(packet_id, sender, gateway_id, observed_at, retention)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_busy_error(&err) && attempt < WRITE_RETRY_ATTEMPTS => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(std::time::Duration::from_millis(WRITE_RETRY_CAP_MS));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(anyhow!(
            "late-relay reconcile for packet {} failed after {} attempts",
            packet_id,
            WRITE_RETRY_ATTEMPTS
        ))
    }

    async fn try_reconcile_late_relay(
        &self,
        packet_id: u32,
        sender: u32,
        gateway_id: &str,
        observed_at: DateTime<Utc>,
        retention: Duration,
    ) -> std::result::Result<ReconcileOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT created_at FROM packets WHERE packet_id = ? AND sender = ?")
            .bind(packet_id as i64)
            .bind(sender as i64)
            .fetch_optional(&mut *tx)
            .await?;
        let created_at: DateTime<Utc> = match row {
            Some(r) => r.get("created_at"),
            None => {
                tx.rollback().await?;
                return Ok(ReconcileOutcome::NotFoundOrExpired);
            }
        };
        if observed_at - created_at > retention {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::NotFoundOrExpired);
        }

        let inserted = sqlx::query(
            "INSERT INTO packet_gateways (packet_id, gateway_id, observed_at)
             VALUES (?, ?, ?) ON CONFLICT(packet_id, gateway_id) DO NOTHING",
        )
        .bind(packet_id as i64)
        .bind(gateway_id)
        .bind(observed_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::AlreadyKnown);
        }

        sqlx::query(
            "UPDATE packets SET gateway_count = gateway_count + 1, updated_at = ?
             WHERE packet_id = ?",
        )
        .bind(Utc::now())
        .bind(packet_id as i64)
        .execute(&mut *tx)
        .await?;

        let gateway_count: i64 =
            sqlx::query_scalar("SELECT gateway_count FROM packets WHERE packet_id = ?")
                .bind(packet_id as i64)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(ReconcileOutcome::Reconciled { gateway_count })
    }

    /// True when a packet with this logical key is already persisted.
    pub async fn packet_exists(&self, packet_id: u32, sender: u32) -> Result<bool> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM packets WHERE packet_id = ? AND sender = ?")
                .bind(packet_id as i64)
                .bind(sender as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Apply a NODEINFO identity refresh: create the node if needed, update
    /// the display name (real names only; `node-…` fallbacks never clobber a
    /// real name), mesh id and role.
    pub async fn apply_node_info(
        &self,
        node_id: u32,
        long_name: &str,
        mesh_id: Option<&str>,
        role: Option<i64>,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let fallback = format!("node-{}", node_id);
        let name = if long_name.trim().is_empty() {
            fallback.clone()
        } else {
            long_name.trim().to_string()
        };
        sqlx::query(
            "INSERT INTO nodes (node_id, name, mesh_id, role, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(node_id) DO UPDATE SET
                 name = CASE WHEN excluded.name NOT LIKE 'node-%' THEN excluded.name
                             ELSE nodes.name END,
                 mesh_id = COALESCE(excluded.mesh_id, nodes.mesh_id),
                 role = COALESCE(excluded.role, nodes.role),
                 last_seen = MAX(nodes.last_seen, excluded.last_seen)",
        )
        .bind(node_id as i64)
        .bind(&name)
        .bind(mesh_id)
        .bind(role)
        .bind(seen_at)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ensure a node row exists (fallback name), refreshing `last_seen`.
    pub async fn touch_node(&self, node_id: u32, seen_at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_node_tx(&mut tx, node_id, &format!("node-{}", node_id), seen_at).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_node(&self, node_id: u32) -> Result<Option<NodeRow>> {
        let row = sqlx::query(
            "SELECT node_id, name, mesh_id, role, first_seen, last_seen
             FROM nodes WHERE node_id = ?",
        )
        .bind(node_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| node_row(&r)))
    }

    // ------------------------------------------------------------------
    // Packet queries
    // ------------------------------------------------------------------

    pub async fn last_packets(&self, n: i64) -> Result<Vec<PacketRow>> {
        let rows = sqlx::query(&format!("{} ORDER BY p.sent_at DESC LIMIT ?", PACKET_SELECT))
            .bind(n)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(packet_row).collect())
    }

    pub async fn last_packets_for_user(&self, node_id: u32, n: i64) -> Result<Vec<PacketRow>> {
        let rows = sqlx::query(&format!(
            "{} WHERE p.sender = ? ORDER BY p.sent_at DESC LIMIT ?",
            PACKET_SELECT
        ))
        .bind(node_id as i64)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(packet_row).collect())
    }

    /// Gateway id lists for a set of packet surrogate ids, in first-seen order.
    pub async fn gateways_for_packet(&self, packet_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT gateway_id FROM packet_gateways WHERE packet_id = ? ORDER BY observed_at, id",
        )
        .bind(packet_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("gateway_id")).collect())
    }

    /// min/avg/max/count over `[start, end)`.
    pub async fn aggregate_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AggregateRow> {
        let row = sqlx::query(
            "SELECT COUNT(id) AS message_count,
                    AVG(gateway_count) AS avg_gateways,
                    MIN(gateway_count) AS min_gateways,
                    MAX(gateway_count) AS max_gateways,
                    MIN(sent_at) AS first_ts,
                    MAX(sent_at) AS last_ts
             FROM packets WHERE sent_at >= ? AND sent_at < ?",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(AggregateRow {
            message_count: row.get("message_count"),
            avg_gateways: row.get("avg_gateways"),
            min_gateways: row.get("min_gateways"),
            max_gateways: row.get("max_gateways"),
            first_ts: row.get("first_ts"),
            last_ts: row.get("last_ts"),
        })
    }

    /// Sorted gateway-count sample over `[start, end)`, for percentiles.
    pub async fn gateway_samples(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT gateway_count FROM packets
             WHERE sent_at >= ? AND sent_at < ? ORDER BY gateway_count",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("gateway_count")).collect())
    }

    /// Per-hour aggregates over `[start, end)`. Hours are UTC; hours with no
    /// traffic are absent.
    pub async fn hourly_rows(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyRow>> {
        let rows = sqlx::query(
            "SELECT CAST(strftime('%H', sent_at) AS INTEGER) AS hour,
                    COUNT(id) AS message_count,
                    AVG(gateway_count) AS avg_gateways,
                    MIN(gateway_count) AS min_gateways,
                    MAX(gateway_count) AS max_gateways
             FROM packets WHERE sent_at >= ? AND sent_at < ?
             GROUP BY hour ORDER BY hour",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| HourlyRow {
                hour: r.get("hour"),
                message_count: r.get("message_count"),
                avg_gateways: r.get("avg_gateways"),
                min_gateways: r.get("min_gateways"),
                max_gateways: r.get("max_gateways"),
            })
            .collect())
    }

    pub async fn top_senders(
        &self,
        limit: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TopSenderRow>> {
        let rows = sqlx::query(
            "SELECT p.sender AS node_id,
                    COALESCE(n.name, p.sender_name) AS name,
                    COUNT(p.id) AS message_count
             FROM packets p LEFT JOIN nodes n ON n.node_id = p.sender
             WHERE p.sent_at >= ? AND p.sent_at < ?
             GROUP BY p.sender ORDER BY message_count DESC LIMIT ?",
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| TopSenderRow {
                node_id: r.get("node_id"),
                name: r.get("name"),
                message_count: r.get("message_count"),
            })
            .collect())
    }

    /// Gateways that relayed a given node's packets, busiest first.
    pub async fn gateways_for_user(
        &self,
        node_id: u32,
        limit: i64,
    ) -> Result<Vec<GatewaySeenRow>> {
        let rows = sqlx::query(
            "SELECT g.gateway_id, COUNT(g.id) AS relay_count, MAX(g.observed_at) AS last_observed
             FROM packet_gateways g JOIN packets p ON p.packet_id = g.packet_id
             WHERE p.sender = ?
             GROUP BY g.gateway_id ORDER BY relay_count DESC LIMIT ?",
        )
        .bind(node_id as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| GatewaySeenRow {
                gateway_id: r.get("gateway_id"),
                relay_count: r.get("relay_count"),
                last_observed: r.get("last_observed"),
            })
            .collect())
    }

    /// Gateway counts of a node's most recent packets (newest first), for
    /// per-user percentile views.
    pub async fn gateway_samples_for_user(&self, node_id: u32, limit: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT gateway_count FROM packets WHERE sender = ?
             ORDER BY sent_at DESC LIMIT ?",
        )
        .bind(node_id as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("gateway_count")).collect())
    }

    pub async fn network_counts(&self, now: DateTime<Utc>) -> Result<NetworkCounts> {
        let active_nodes = |cutoff: DateTime<Utc>| {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM nodes WHERE last_seen >= ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
        };
        let active_gateways = |cutoff: DateTime<Utc>| {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(DISTINCT gateway_id) FROM packet_gateways WHERE observed_at >= ?",
            )
            .bind(cutoff)
            .fetch_one(&self.pool)
        };

        Ok(NetworkCounts {
            total_nodes: sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
                .fetch_one(&self.pool)
                .await?,
            total_gateways: sqlx::query_scalar(
                "SELECT COUNT(DISTINCT gateway_id) FROM packet_gateways",
            )
            .fetch_one(&self.pool)
            .await?,
            active_nodes_24h: active_nodes(now - Duration::hours(24)).await?,
            active_nodes_7d: active_nodes(now - Duration::days(7)).await?,
            active_nodes_30d: active_nodes(now - Duration::days(30)).await?,
            active_gateways_24h: active_gateways(now - Duration::hours(24)).await?,
            active_gateways_7d: active_gateways(now - Duration::days(7)).await?,
            active_gateways_30d: active_gateways(now - Duration::days(30)).await?,
        })
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Create or replace a node's subscription; reactivates inactive rows.
    pub async fn upsert_subscription(&self, node_id: u32, variant: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO subscriptions (user_node_id, variant, is_active, created_at, updated_at)
             VALUES (?, ?, 1, ?, ?)
             ON CONFLICT(user_node_id) DO UPDATE SET
                 variant = excluded.variant, is_active = 1, updated_at = excluded.updated_at",
        )
        .bind(node_id as i64)
        .bind(variant)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a node's subscription inactive. Returns whether one was active.
    pub async fn deactivate_subscription(&self, node_id: u32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET is_active = 0, updated_at = ?
             WHERE user_node_id = ? AND is_active = 1",
        )
        .bind(Utc::now())
        .bind(node_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn subscription_for(&self, node_id: u32) -> Result<Option<SubscriptionRow>> {
        let row = sqlx::query(
            "SELECT user_node_id, variant, is_active, created_at, updated_at
             FROM subscriptions WHERE user_node_id = ?",
        )
        .bind(node_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| subscription_row(&r)))
    }

    /// Active subscriptions, optionally filtered by variant.
    pub async fn active_subscriptions(&self, variant: Option<&str>) -> Result<Vec<SubscriptionRow>> {
        let rows = match variant {
            Some(v) => {
                sqlx::query(
                    "SELECT user_node_id, variant, is_active, created_at, updated_at
                     FROM subscriptions WHERE is_active = 1 AND variant = ?
                     ORDER BY user_node_id",
                )
                .bind(v)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT user_node_id, variant, is_active, created_at, updated_at
                     FROM subscriptions WHERE is_active = 1 ORDER BY user_node_id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(subscription_row).collect())
    }

    // ------------------------------------------------------------------
    // Command audit log
    // ------------------------------------------------------------------

    pub async fn append_command_log(
        &self,
        node_id: u32,
        username: &str,
        mesh_id: Option<&str>,
        command: &str,
        response_sent: bool,
        rate_limited: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO command_logs (node_id, username, mesh_id, command,
                                       response_sent, rate_limited, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node_id as i64)
        .bind(username)
        .bind(mesh_id)
        .bind(command)
        .bind(response_sent)
        .bind(rate_limited)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_commands(&self, limit: i64) -> Result<Vec<CommandLogRow>> {
        let rows = sqlx::query(
            "SELECT id, node_id, username, mesh_id, command, response_sent, rate_limited, timestamp
             FROM command_logs ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(command_log_row).collect())
    }

    pub async fn commands_for_user(&self, node_id: u32, limit: i64) -> Result<Vec<CommandLogRow>> {
        let rows = sqlx::query(
            "SELECT id, node_id, username, mesh_id, command, response_sent, rate_limited, timestamp
             FROM command_logs WHERE node_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(node_id as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(command_log_row).collect())
    }

    /// Bot usage rollup over the trailing `days`: totals plus per-command counts.
    pub async fn bot_stats(&self, days: i64) -> Result<serde_json::Value> {
        let cutoff = Utc::now() - Duration::days(days);
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total,
                    SUM(CASE WHEN rate_limited THEN 1 ELSE 0 END) AS rate_limited,
                    COUNT(DISTINCT node_id) AS unique_users
             FROM command_logs WHERE timestamp >= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        let per_command = sqlx::query(
            "SELECT command, COUNT(*) AS count FROM command_logs
             WHERE timestamp >= ? GROUP BY command ORDER BY count DESC LIMIT 20",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let commands: Vec<serde_json::Value> = per_command
            .iter()
            .map(|r| {
                serde_json::json!({
                    "command": r.get::<String, _>("command"),
                    "count": r.get::<i64, _>("count"),
                })
            })
            .collect();
        Ok(serde_json::json!({
            "days": days,
            "total_commands": totals.get::<i64, _>("total"),
            "rate_limited": totals.get::<Option<i64>, _>("rate_limited").unwrap_or(0),
            "unique_users": totals.get::<i64, _>("unique_users"),
            "commands": commands,
        }))
    }

    // ------------------------------------------------------------------
    // Stat cache
    // ------------------------------------------------------------------

    /// Read-through cache lookup; expired entries count as absent.
    pub async fn cache_get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, expires_at FROM stat_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let expires_at: DateTime<Utc> = r.get("expires_at");
            (expires_at > now).then(|| r.get("value"))
        }))
    }

    /// Last-write-wins cache upsert.
    pub async fn cache_put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO stat_cache (key, value, created_at, expires_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value, created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retention and admin
    // ------------------------------------------------------------------

    /// Delete rows older than `days` from the time-series tables. Nodes and
    /// subscriptions are never expired.
    pub async fn expire(&self, days: i64) -> Result<ExpireSummary> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut summary = ExpireSummary::default();

        // packet_gateways cascade from packets via the FK.
        summary.packets = sqlx::query("DELETE FROM packets WHERE sent_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        summary.fingerprints =
            sqlx::query("DELETE FROM envelope_fingerprints WHERE seen_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        summary.stat_cache = sqlx::query("DELETE FROM stat_cache WHERE expires_at < ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        summary.command_logs = sqlx::query("DELETE FROM command_logs WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!(
            "retention expiry (>{}d): {} packets, {} fingerprints, {} cache rows, {} command logs",
            days, summary.packets, summary.fingerprints, summary.stat_cache, summary.command_logs
        );
        Ok(summary)
    }

    /// Trim fingerprints older than the grouping window plus a safety margin.
    /// Called periodically by the grouper tick loop.
    pub async fn prune_fingerprints(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let pruned = sqlx::query("DELETE FROM envelope_fingerprints WHERE seen_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if pruned > 0 {
            debug!("pruned {} envelope fingerprints", pruned);
        }
        Ok(pruned)
    }

    pub async fn database_info(&self) -> Result<DatabaseInfo> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok(DatabaseInfo {
            nodes: self.count_table("nodes").await?,
            packets: self.count_table("packets").await?,
            packet_gateways: self.count_table("packet_gateways").await?,
            envelope_fingerprints: self.count_table("envelope_fingerprints").await?,
            subscriptions: self.count_table("subscriptions").await?,
            stat_cache: self.count_table("stat_cache").await?,
            command_logs: self.count_table("command_logs").await?,
            size_bytes: page_count * page_size,
        })
    }

    async fn count_table(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }
}

const PACKET_SELECT: &str =
    "SELECT p.id, p.packet_id, p.sender, COALESCE(n.name, p.sender_name) AS sender_name,
            p.sent_at, p.gateway_count, p.rssi, p.snr, p.hop_start, p.hop_limit,
            p.hops_travelled, p.payload, p.created_at, p.updated_at
     FROM packets p LEFT JOIN nodes n ON n.node_id = p.sender";

async fn upsert_node_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    node_id: u32,
    name: &str,
    seen_at: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO nodes (node_id, name, first_seen, last_seen) VALUES (?, ?, ?, ?)
         ON CONFLICT(node_id) DO UPDATE SET
             name = CASE WHEN excluded.name NOT LIKE 'node-%' THEN excluded.name
                         ELSE nodes.name END,
             last_seen = MAX(nodes.last_seen, excluded.last_seen)",
    )
    .bind(node_id as i64)
    .bind(name)
    .bind(seen_at)
    .bind(seen_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn is_busy_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

fn node_row(r: &sqlx::sqlite::SqliteRow) -> NodeRow {
    NodeRow {
        node_id: r.get("node_id"),
        name: r.get("name"),
        mesh_id: r.get("mesh_id"),
        role: r.get("role"),
        first_seen: r.get("first_seen"),
        last_seen: r.get("last_seen"),
    }
}

fn packet_row(r: &sqlx::sqlite::SqliteRow) -> PacketRow {
    PacketRow {
        id: r.get("id"),
        packet_id: r.get("packet_id"),
        sender_user_id: r.get("sender"),
        sender_name: r.get("sender_name"),
        sent_at: r.get("sent_at"),
        gateway_count: r.get("gateway_count"),
        rssi: r.get("rssi"),
        snr: r.get("snr"),
        hop_start: r.get("hop_start"),
        hop_limit: r.get("hop_limit"),
        hops_travelled: r.get("hops_travelled"),
        payload: r.get("payload"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn subscription_row(r: &sqlx::sqlite::SqliteRow) -> SubscriptionRow {
    SubscriptionRow {
        user_node_id: r.get("user_node_id"),
        variant: r.get("variant"),
        is_active: r.get("is_active"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn command_log_row(r: &sqlx::sqlite::SqliteRow) -> CommandLogRow {
    CommandLogRow {
        id: r.get("id"),
        node_id: r.get("node_id"),
        username: r.get("username"),
        mesh_id: r.get("mesh_id"),
        command: r.get("command"),
        response_sent: r.get("response_sent"),
        rate_limited: r.get("rate_limited"),
        timestamp: r.get("timestamp"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::open("sqlite://:memory:").await.unwrap()
    }

    fn relay(gateway: &str, at: DateTime<Utc>) -> (String, DateTime<Utc>) {
        (gateway.to_string(), at)
    }

    fn sample_packet(packet_id: u32, sender: u32) -> NewPacket {
        NewPacket {
            packet_id,
            sender,
            sender_name: format!("node-{}", sender),
            sent_at: Utc::now(),
            rssi: Some(-90),
            snr: Some(6.5),
            hop_start: Some(5),
            hop_limit: Some(3),
            payload: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn grouped_insert_sets_count_to_distinct_relays() {
        let store = memory_store().await;
        let now = Utc::now();
        let id = store
            .insert_grouped_packet(
                &sample_packet(7002, 0xB2),
                &[
                    relay("!00000011", now),
                    relay("!00000022", now),
                    relay("!00000022", now), // duplicate collapses
                    relay("!00000033", now),
                ],
            )
            .await
            .unwrap()
            .unwrap();

        let packets = store.last_packets(1).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].gateway_count, 3);
        assert_eq!(packets[0].hops_travelled, Some(2));
        assert_eq!(store.gateways_for_packet(7002).await.unwrap().len(), 3);
        assert!(id > 0);
    }

    #[tokio::test]
    async fn duplicate_packet_id_insert_returns_none() {
        let store = memory_store().await;
        let now = Utc::now();
        store
            .insert_grouped_packet(&sample_packet(7010, 1), &[relay("!00000001", now)])
            .await
            .unwrap()
            .unwrap();
        let second = store
            .insert_grouped_packet(&sample_packet(7010, 1), &[relay("!00000002", now)])
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.last_packets(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_attaches_new_gateway_once() {
        let store = memory_store().await;
        let now = Utc::now();
        store
            .insert_grouped_packet(&sample_packet(7003, 0xB2), &[relay("!00000011", now)])
            .await
            .unwrap();

        let outcome = store
            .reconcile_late_relay(7003, 0xB2, "!00000044", now, Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Reconciled { gateway_count: 2 });

        let again = store
            .reconcile_late_relay(7003, 0xB2, "!00000044", now, Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(again, ReconcileOutcome::AlreadyKnown);

        let missing = store
            .reconcile_late_relay(9999, 0xB2, "!00000044", now, Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(missing, ReconcileOutcome::NotFoundOrExpired);
    }

    #[tokio::test]
    async fn fingerprints_suppress_replays() {
        let store = memory_store().await;
        let hash = [7u8; 32];
        assert!(store.observe_fingerprint(&hash, Utc::now()).await.unwrap());
        assert!(!store.observe_fingerprint(&hash, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn nodeinfo_fallback_never_clobbers_real_name() {
        let store = memory_store().await;
        let now = Utc::now();
        store
            .apply_node_info(0xA1, "Alice Base", Some("!000000a1"), Some(2), now)
            .await
            .unwrap();
        store.touch_node(0xA1, now + Duration::seconds(5)).await.unwrap();
        let node = store.get_node(0xA1).await.unwrap().unwrap();
        assert_eq!(node.name, "Alice Base");
        assert_eq!(node.role, Some(2));
        assert!(node.last_seen > now);
    }

    #[tokio::test]
    async fn cache_expiry_is_a_miss() {
        let store = memory_store().await;
        store.cache_put("k", "{\"v\":1}", Duration::seconds(60)).await.unwrap();
        let now = Utc::now();
        assert!(store.cache_get("k", now).await.unwrap().is_some());
        assert!(store
            .cache_get("k", now + Duration::seconds(120))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn subscriptions_upsert_is_idempotent() {
        let store = memory_store().await;
        store.upsert_subscription(0xC3, "avg").await.unwrap();
        store.upsert_subscription(0xC3, "avg").await.unwrap();
        store.upsert_subscription(0xC3, "high").await.unwrap();
        let subs = store.active_subscriptions(None).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].variant, "high");
        assert!(store.deactivate_subscription(0xC3).await.unwrap());
        assert!(!store.deactivate_subscription(0xC3).await.unwrap());
        assert!(store.active_subscriptions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expire_keeps_nodes_and_subscriptions() {
        let store = memory_store().await;
        let old = Utc::now() - Duration::days(40);
        let mut packet = sample_packet(7020, 5);
        packet.sent_at = old;
        store
            .insert_grouped_packet(&packet, &[relay("!00000001", old)])
            .await
            .unwrap();
        store.upsert_subscription(5, "low").await.unwrap();

        let summary = store.expire(30).await.unwrap();
        assert_eq!(summary.packets, 1);
        assert!(store.last_packets(10).await.unwrap().is_empty());
        assert!(store.get_node(5).await.unwrap().is_some());
        assert_eq!(store.active_subscriptions(None).await.unwrap().len(), 1);
    }
}
