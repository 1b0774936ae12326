//! Process-wide counters and the Prometheus text exposition behind `/metrics`.
//!
//! Counters are plain relaxed atomics; nothing here may fail or block. The
//! ingest path increments these from hot loops, so keep them cheap.

use std::sync::atomic::{AtomicU64, Ordering};

static GROUP_OPEN: AtomicU64 = AtomicU64::new(0);
static GROUP_CLOSED: AtomicU64 = AtomicU64::new(0);
static LATE_RECONCILED: AtomicU64 = AtomicU64::new(0);
static LATE_BEYOND_RETENTION: AtomicU64 = AtomicU64::new(0);
static REPLAY_SUPPRESSED: AtomicU64 = AtomicU64::new(0);
static PRIVATE_DROPPED: AtomicU64 = AtomicU64::new(0);
static DECRYPT_FAILED: AtomicU64 = AtomicU64::new(0);
static MALFORMED: AtomicU64 = AtomicU64::new(0);
static UNSUPPORTED_PORT: AtomicU64 = AtomicU64::new(0);
static ENVELOPES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static NODEINFO_APPLIED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_PROCESSED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_RATE_LIMITED: AtomicU64 = AtomicU64::new(0);
static BOT_RECONNECTS: AtomicU64 = AtomicU64::new(0);
static HTTP_REQUESTS: AtomicU64 = AtomicU64::new(0);

/// Upper bounds of the gateways-per-packet histogram buckets; a final +Inf
/// bucket is implied.
pub const GATEWAY_BUCKETS: [u64; 7] = [1, 2, 3, 5, 8, 13, 21];

static GATEWAY_BUCKET_COUNTS: [AtomicU64; 8] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];
static GATEWAY_SUM: AtomicU64 = AtomicU64::new(0);
static GATEWAY_COUNT: AtomicU64 = AtomicU64::new(0);

macro_rules! inc_fns {
    ($($fn_name:ident => $counter:ident),* $(,)?) => {
        $(pub fn $fn_name() {
            $counter.fetch_add(1, Ordering::Relaxed);
        })*
    };
}

inc_fns! {
    inc_group_open => GROUP_OPEN,
    inc_group_closed => GROUP_CLOSED,
    inc_late_reconciled => LATE_RECONCILED,
    inc_late_beyond_retention => LATE_BEYOND_RETENTION,
    inc_replay_suppressed => REPLAY_SUPPRESSED,
    inc_private_dropped => PRIVATE_DROPPED,
    inc_decrypt_failed => DECRYPT_FAILED,
    inc_malformed => MALFORMED,
    inc_unsupported_port => UNSUPPORTED_PORT,
    inc_envelopes_received => ENVELOPES_RECEIVED,
    inc_nodeinfo_applied => NODEINFO_APPLIED,
    inc_commands_processed => COMMANDS_PROCESSED,
    inc_commands_rate_limited => COMMANDS_RATE_LIMITED,
    inc_bot_reconnects => BOT_RECONNECTS,
    inc_http_requests => HTTP_REQUESTS,
}

/// Record a closed group's distinct-gateway count in the histogram.
pub fn observe_gateways_per_packet(count: u64) {
    GATEWAY_SUM.fetch_add(count, Ordering::Relaxed);
    GATEWAY_COUNT.fetch_add(1, Ordering::Relaxed);
    for (i, bound) in GATEWAY_BUCKETS.iter().enumerate() {
        if count <= *bound {
            GATEWAY_BUCKET_COUNTS[i].fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    GATEWAY_BUCKET_COUNTS[GATEWAY_BUCKETS.len()].fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of every counter. Used by tests and the health endpoint.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub group_open: u64,
    pub group_closed: u64,
    pub late_reconciled: u64,
    pub late_beyond_retention: u64,
    pub replay_suppressed: u64,
    pub private_dropped: u64,
    pub decrypt_failed: u64,
    pub malformed: u64,
    pub unsupported_port: u64,
    pub envelopes_received: u64,
    pub nodeinfo_applied: u64,
    pub commands_processed: u64,
    pub commands_rate_limited: u64,
    pub bot_reconnects: u64,
    pub http_requests: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        group_open: GROUP_OPEN.load(Ordering::Relaxed),
        group_closed: GROUP_CLOSED.load(Ordering::Relaxed),
        late_reconciled: LATE_RECONCILED.load(Ordering::Relaxed),
        late_beyond_retention: LATE_BEYOND_RETENTION.load(Ordering::Relaxed),
        replay_suppressed: REPLAY_SUPPRESSED.load(Ordering::Relaxed),
        private_dropped: PRIVATE_DROPPED.load(Ordering::Relaxed),
        decrypt_failed: DECRYPT_FAILED.load(Ordering::Relaxed),
        malformed: MALFORMED.load(Ordering::Relaxed),
        unsupported_port: UNSUPPORTED_PORT.load(Ordering::Relaxed),
        envelopes_received: ENVELOPES_RECEIVED.load(Ordering::Relaxed),
        nodeinfo_applied: NODEINFO_APPLIED.load(Ordering::Relaxed),
        commands_processed: COMMANDS_PROCESSED.load(Ordering::Relaxed),
        commands_rate_limited: COMMANDS_RATE_LIMITED.load(Ordering::Relaxed),
        bot_reconnects: BOT_RECONNECTS.load(Ordering::Relaxed),
        http_requests: HTTP_REQUESTS.load(Ordering::Relaxed),
    }
}

/// Render every counter in the Prometheus text exposition format.
pub fn render_prometheus() -> String {
    let s = snapshot();
    let mut out = String::with_capacity(2048);

    let mut counter = |name: &str, help: &str, value: u64| {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
        ));
    };

    counter(
        "meshstats_envelopes_received_total",
        "MQTT envelopes received",
        s.envelopes_received,
    );
    counter("meshstats_group_open_total", "Packet groups opened", s.group_open);
    counter("meshstats_group_closed_total", "Packet groups closed", s.group_closed);
    counter(
        "meshstats_late_reconciled_total",
        "Late gateway relays reconciled into stored packets",
        s.late_reconciled,
    );
    counter(
        "meshstats_late_beyond_retention_total",
        "Late relays discarded past the retention bound",
        s.late_beyond_retention,
    );
    counter(
        "meshstats_replay_suppressed_total",
        "Envelopes dropped by fingerprint replay suppression",
        s.replay_suppressed,
    );
    counter(
        "meshstats_private_dropped_total",
        "Packets dropped because ok-to-MQTT was disabled",
        s.private_dropped,
    );
    counter(
        "meshstats_decrypt_failed_total",
        "Envelopes no key ring entry could decrypt",
        s.decrypt_failed,
    );
    counter("meshstats_malformed_total", "Undecodable envelopes", s.malformed);
    counter(
        "meshstats_unsupported_port_total",
        "Decoded packets on ports we do not persist",
        s.unsupported_port,
    );
    counter(
        "meshstats_nodeinfo_applied_total",
        "NODEINFO updates applied to the node table",
        s.nodeinfo_applied,
    );
    counter(
        "meshstats_commands_processed_total",
        "Bot commands processed",
        s.commands_processed,
    );
    counter(
        "meshstats_commands_rate_limited_total",
        "Bot commands rejected by the rate limiter",
        s.commands_rate_limited,
    );
    counter(
        "meshstats_bot_reconnects_total",
        "Radio link reconnect attempts",
        s.bot_reconnects,
    );
    counter("meshstats_http_requests_total", "HTTP requests served", s.http_requests);

    out.push_str("# HELP meshstats_gateways_per_packet Distinct gateways per stored packet\n");
    out.push_str("# TYPE meshstats_gateways_per_packet histogram\n");
    let mut cumulative = 0u64;
    for (i, bound) in GATEWAY_BUCKETS.iter().enumerate() {
        cumulative += GATEWAY_BUCKET_COUNTS[i].load(Ordering::Relaxed);
        out.push_str(&format!(
            "meshstats_gateways_per_packet_bucket{{le=\"{bound}\"}} {cumulative}\n"
        ));
    }
    cumulative += GATEWAY_BUCKET_COUNTS[GATEWAY_BUCKETS.len()].load(Ordering::Relaxed);
    out.push_str(&format!(
        "meshstats_gateways_per_packet_bucket{{le=\"+Inf\"}} {cumulative}\n"
    ));
    out.push_str(&format!(
        "meshstats_gateways_per_packet_sum {}\n",
        GATEWAY_SUM.load(Ordering::Relaxed)
    ));
    out.push_str(&format!(
        "meshstats_gateways_per_packet_count {}\n",
        GATEWAY_COUNT.load(Ordering::Relaxed)
    ));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative_in_exposition() {
        observe_gateways_per_packet(1);
        observe_gateways_per_packet(4);
        observe_gateways_per_packet(100);
        let text = render_prometheus();
        assert!(text.contains("meshstats_gateways_per_packet_bucket{le=\"+Inf\"}"));
        // +Inf bucket must equal the observation count.
        let count_line = text
            .lines()
            .find(|l| l.starts_with("meshstats_gateways_per_packet_count"))
            .unwrap();
        let inf_line = text
            .lines()
            .find(|l| l.contains("le=\"+Inf\""))
            .unwrap();
        let count: u64 = count_line.split_whitespace().last().unwrap().parse().unwrap();
        let inf: u64 = inf_line.split_whitespace().last().unwrap().parse().unwrap();
        assert_eq!(count, inf);
    }

    #[test]
    fn counters_render_with_type_lines() {
        inc_replay_suppressed();
        let text = render_prometheus();
        assert!(text.contains("# TYPE meshstats_replay_suppressed_total counter"));
        assert!(text.contains("meshstats_replay_suppressed_total"));
    }
}
