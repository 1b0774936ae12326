//! Bounded-window packet grouping.
//!
//! Multiple gateways uplink the same mesh packet at slightly different times.
//! The grouper coalesces those relays, keyed by `(packet_id, sender)`, and
//! hands each group to the store exactly once. Contract: one stored packet
//! per mesh packet, `gateway_count` equal to the number of distinct gateways
//! observed, late relays reconciled into the stored row.
//!
//! A group closes once it is at least a full window old *and* has been quiet
//! for the quiescence interval, so broker fan-in jitter near the window edge
//! does not split a packet in two. Shutdown closes everything immediately.
//!
//! Replay suppression (envelope fingerprints) happens in the ingest path
//! before observations reach this module.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::codec::PacketObservation;
use crate::metrics;
use crate::storage::{NewPacket, ReconcileOutcome, Store};

/// Logical identity of a mesh packet: id alone is not unique across senders.
pub type GroupKey = (u32, u32);

/// How a single observation was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// Started a new in-memory group.
    Opened,
    /// Joined an existing in-memory group.
    Grouped,
    /// Attached to an already-persisted packet.
    LateReconciled,
    /// Already-persisted packet, relay already known.
    LateDuplicate,
    /// Arrived past the retention bound (or the packet is unknown); dropped.
    LateBeyondRetention,
}

struct PacketGroup {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    /// Canonical parsed packet: the first observation wins.
    observation: PacketObservation,
    /// Insertion-ordered distinct gateways with their arrival instants.
    gateways: Vec<(String, DateTime<Utc>)>,
}

impl PacketGroup {
    fn add_gateway(&mut self, gateway_id: &str, at: DateTime<Utc>) {
        if !self.gateways.iter().any(|(g, _)| g == gateway_id) {
            self.gateways.push((gateway_id.to_string(), at));
        }
    }
}

/// The grouping engine. Shared between the ingest task (observations) and the
/// tick task (closes); all awaits happen outside the map lock.
pub struct PacketGrouper {
    store: Store,
    window: ChronoDuration,
    quiescence: ChronoDuration,
    retention: ChronoDuration,
    groups: Mutex<HashMap<GroupKey, PacketGroup>>,
}

impl PacketGrouper {
    pub fn new(store: Store, window_seconds: u64, quiescence_seconds: u64, retention_hours: u64) -> Self {
        PacketGrouper {
            store,
            window: ChronoDuration::seconds(window_seconds as i64),
            quiescence: ChronoDuration::seconds(quiescence_seconds as i64),
            retention: ChronoDuration::hours(retention_hours as i64),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn open_groups(&self) -> usize {
        self.groups.lock().expect("grouper mutex poisoned").len()
    }

    pub fn retention(&self) -> ChronoDuration {
        self.retention
    }

    /// Absorb one decoded observation at `now`.
    pub async fn observe(&self, obs: PacketObservation, now: DateTime<Utc>) -> anyhow::Result<ObserveOutcome> {
        let key: GroupKey = (obs.packet_id, obs.sender);

        // Fast path: the group is already open.
        if let Some(outcome) = self.try_join(key, &obs, now) {
            return Ok(outcome);
        }

        // Not in memory. A durable row for this key means a late arrival.
        let persisted = self.store.packet_exists(obs.packet_id, obs.sender).await?;
        if persisted {
            return self.reconcile_late(&obs, now).await;
        }

        // Re-check under the lock: the tick task may have raced us. If the
        // group closed in between, the store insert path below notices the
        // duplicate and falls back to reconciliation at close time.
        let mut groups = self.groups.lock().expect("grouper mutex poisoned");
        if let Some(group) = groups.get_mut(&key) {
            group.add_gateway(&obs.gateway_id, now);
            group.last_seen = now;
            return Ok(ObserveOutcome::Grouped);
        }
        let mut group = PacketGroup {
            first_seen: now,
            last_seen: now,
            observation: obs.clone(),
            gateways: Vec::new(),
        };
        group.add_gateway(&obs.gateway_id, now);
        groups.insert(key, group);
        metrics::inc_group_open();
        debug!(
            "opened group for packet {} from {:08x} (gateway {})",
            obs.packet_id, obs.sender, obs.gateway_id
        );
        Ok(ObserveOutcome::Opened)
    }

    fn try_join(&self, key: GroupKey, obs: &PacketObservation, now: DateTime<Utc>) -> Option<ObserveOutcome> {
        let mut groups = self.groups.lock().expect("grouper mutex poisoned");
        let group = groups.get_mut(&key)?;
        group.add_gateway(&obs.gateway_id, now);
        group.last_seen = now;
        Some(ObserveOutcome::Grouped)
    }

    async fn reconcile_late(&self, obs: &PacketObservation, now: DateTime<Utc>) -> anyhow::Result<ObserveOutcome> {
        let outcome = self
            .store
            .reconcile_late_relay(obs.packet_id, obs.sender, &obs.gateway_id, now, self.retention)
            .await?;
        Ok(match outcome {
            ReconcileOutcome::Reconciled { gateway_count } => {
                metrics::inc_late_reconciled();
                info!(
                    "late gateway {} attached to packet {} (now {} gateways)",
                    obs.gateway_id, obs.packet_id, gateway_count
                );
                ObserveOutcome::LateReconciled
            }
            ReconcileOutcome::AlreadyKnown => ObserveOutcome::LateDuplicate,
            ReconcileOutcome::NotFoundOrExpired => {
                metrics::inc_late_beyond_retention();
                warn!(
                    "late relay for packet {} from gateway {} beyond retention; dropped",
                    obs.packet_id, obs.gateway_id
                );
                ObserveOutcome::LateBeyondRetention
            }
        })
    }

    /// Close every group whose close predicate holds at `now`. Returns the
    /// number of groups persisted.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let ready = self.pop_ready(now, false);
        let count = ready.len();
        for group in ready {
            self.close_group(group).await;
        }
        count
    }

    /// Close everything immediately, regardless of window. Shutdown path.
    pub async fn flush_all(&self) -> usize {
        let ready = self.pop_ready(Utc::now(), true);
        let count = ready.len();
        if count > 0 {
            info!("flushing {} open packet group(s)", count);
        }
        for group in ready {
            self.close_group(group).await;
        }
        count
    }

    /// Remove and return groups ready to close, ordered by close eligibility
    /// (oldest first). `force` ignores the window, for shutdown.
    fn pop_ready(&self, now: DateTime<Utc>, force: bool) -> Vec<PacketGroup> {
        let mut groups = self.groups.lock().expect("grouper mutex poisoned");
        let ready_keys: Vec<GroupKey> = groups
            .iter()
            .filter(|(_, g)| {
                force
                    || (now - g.first_seen >= self.window && now - g.last_seen >= self.quiescence)
            })
            .map(|(k, _)| *k)
            .collect();
        let mut ready: Vec<PacketGroup> = ready_keys
            .into_iter()
            .filter_map(|k| groups.remove(&k))
            .collect();
        ready.sort_by_key(|g| g.first_seen);
        ready
    }

    async fn close_group(&self, group: PacketGroup) {
        let obs = &group.observation;
        let packet = NewPacket {
            packet_id: obs.packet_id,
            sender: obs.sender,
            sender_name: format!("node-{}", obs.sender),
            sent_at: obs.sent_at,
            rssi: obs.rssi,
            snr: obs.snr,
            hop_start: obs.hop_start,
            hop_limit: obs.hop_limit,
            payload: obs.payload.clone(),
        };
        match self.store.insert_grouped_packet(&packet, &group.gateways).await {
            Ok(Some(_)) => {
                metrics::inc_group_closed();
                metrics::observe_gateways_per_packet(group.gateways.len() as u64);
                info!(
                    "persisted packet {} from {:08x} with {} gateway(s)",
                    obs.packet_id,
                    obs.sender,
                    group.gateways.len()
                );
            }
            Ok(None) => {
                // A concurrent writer inserted this packet id first; fold our
                // relays in through the reconcile path instead.
                warn!(
                    "packet {} already persisted by a concurrent writer; reconciling {} relay(s)",
                    obs.packet_id,
                    group.gateways.len()
                );
                for (gateway_id, observed_at) in &group.gateways {
                    if let Err(err) = self
                        .store
                        .reconcile_late_relay(
                            obs.packet_id,
                            obs.sender,
                            gateway_id,
                            *observed_at,
                            self.retention,
                        )
                        .await
                    {
                        error!(
                            "failed to reconcile relay {} for packet {}: {:#}",
                            gateway_id, obs.packet_id, err
                        );
                    }
                }
                metrics::inc_group_closed();
            }
            Err(err) => {
                error!("failed to persist packet {}: {:#}", obs.packet_id, err);
            }
        }
    }

    /// Tick loop task: fires at least every Q/2 (1 s floor), prunes stale
    /// fingerprints occasionally, and flushes on shutdown.
    pub async fn run_tick_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let tick_every = Duration::from_millis(
            ((self.quiescence.num_milliseconds() as u64) / 2).clamp(250, 1_000),
        );
        let mut prune_counter = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick_every) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.tick(Utc::now()).await;

            // Fingerprints only need to outlive the late-arrival retention.
            prune_counter += 1;
            if prune_counter >= 300 {
                prune_counter = 0;
                let cutoff = Utc::now() - self.retention - ChronoDuration::hours(1);
                if let Err(err) = self.store.prune_fingerprints(cutoff).await {
                    warn!("fingerprint prune failed: {:#}", err);
                }
            }
        }
        self.flush_all().await;
        info!("packet grouper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(packet_id: u32, sender: u32, gateway: &str) -> PacketObservation {
        PacketObservation {
            packet_id,
            sender,
            gateway_id: gateway.to_string(),
            channel_id: "LongFast".to_string(),
            sent_at: Utc::now(),
            payload: "hello".to_string(),
            rssi: None,
            snr: None,
            hop_start: None,
            hop_limit: None,
        }
    }

    async fn grouper() -> PacketGrouper {
        let store = Store::open("sqlite://:memory:").await.unwrap();
        PacketGrouper::new(store, 10, 2, 24)
    }

    #[tokio::test]
    async fn relays_within_window_coalesce_into_one_packet() {
        let g = grouper().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        assert_eq!(
            g.observe(obs(7002, 0xB2, "!00000011"), t0).await.unwrap(),
            ObserveOutcome::Opened
        );
        assert_eq!(
            g.observe(obs(7002, 0xB2, "!00000022"), t0 + ChronoDuration::seconds(1))
                .await
                .unwrap(),
            ObserveOutcome::Grouped
        );
        assert_eq!(
            g.observe(obs(7002, 0xB2, "!00000033"), t0 + ChronoDuration::seconds(2))
                .await
                .unwrap(),
            ObserveOutcome::Grouped
        );
        assert_eq!(g.open_groups(), 1);

        // Not yet: window not elapsed.
        assert_eq!(g.tick(t0 + ChronoDuration::seconds(5)).await, 0);
        // Window elapsed and quiet since t0+2s.
        assert_eq!(g.tick(t0 + ChronoDuration::seconds(11)).await, 1);
        assert_eq!(g.open_groups(), 0);

        let stored = g.store.last_packets(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].gateway_count, 3);
    }

    #[tokio::test]
    async fn distinct_senders_with_same_packet_id_stay_separate() {
        let g = grouper().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        g.observe(obs(500, 1, "!00000001"), t0).await.unwrap();
        g.observe(obs(500, 2, "!00000002"), t0).await.unwrap();
        assert_eq!(g.open_groups(), 2);
    }

    #[tokio::test]
    async fn quiescence_defers_close_under_jitter() {
        let g = grouper().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        g.observe(obs(7003, 0xB2, "!00000011"), t0).await.unwrap();
        // A straggler lands just inside the window edge.
        g.observe(obs(7003, 0xB2, "!00000022"), t0 + ChronoDuration::seconds(10))
            .await
            .unwrap();
        // Window is past, but the group is not quiet yet.
        assert_eq!(g.tick(t0 + ChronoDuration::seconds(11)).await, 0);
        assert_eq!(g.tick(t0 + ChronoDuration::seconds(12)).await, 1);
    }

    #[tokio::test]
    async fn late_relay_reconciles_into_stored_packet() {
        let g = grouper().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        g.observe(obs(7004, 0xB2, "!00000011"), t0).await.unwrap();
        g.tick(t0 + ChronoDuration::seconds(13)).await;

        let outcome = g
            .observe(obs(7004, 0xB2, "!00000044"), t0 + ChronoDuration::seconds(15))
            .await
            .unwrap();
        assert_eq!(outcome, ObserveOutcome::LateReconciled);
        let stored = g.store.last_packets(1).await.unwrap();
        assert_eq!(stored[0].gateway_count, 2);

        // Same late relay again: idempotent.
        let outcome = g
            .observe(obs(7004, 0xB2, "!00000044"), t0 + ChronoDuration::seconds(16))
            .await
            .unwrap();
        assert_eq!(outcome, ObserveOutcome::LateDuplicate);
    }

    #[tokio::test]
    async fn late_relay_beyond_retention_is_dropped() {
        let g = grouper().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        g.observe(obs(7005, 0xB2, "!00000011"), t0).await.unwrap();
        g.tick(t0 + ChronoDuration::seconds(13)).await;

        let outcome = g
            .observe(obs(7005, 0xB2, "!00000055"), t0 + ChronoDuration::hours(25))
            .await
            .unwrap();
        assert_eq!(outcome, ObserveOutcome::LateBeyondRetention);
        let stored = g.store.last_packets(1).await.unwrap();
        assert_eq!(stored[0].gateway_count, 1);
    }

    #[tokio::test]
    async fn flush_closes_groups_regardless_of_window() {
        let g = grouper().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        g.observe(obs(7006, 0xB2, "!00000011"), t0).await.unwrap();
        g.observe(obs(7007, 0xB3, "!00000011"), t0).await.unwrap();
        assert_eq!(g.flush_all().await, 2);
        assert_eq!(g.open_groups(), 0);
        assert_eq!(g.store.last_packets(10).await.unwrap().len(), 2);
    }
}
