//! # Statistics Engine
//!
//! Aggregates over the packet store: daily and hourly breakdowns, rolling
//! windows, comparisons, network totals, and per-user views. Every aggregate
//! takes an inclusive-exclusive `[start, end)` range and is computed in UTC.
//!
//! Results are cached in the store's `stat_cache` table under canonical
//! `function:args` keys. An expired entry is a miss; writes are optimistic
//! (last write wins). Hits return the cached JSON as-is.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::storage::{NetworkCounts, PacketRow, Store, TopSenderRow};

/// Cache TTLs per aggregate class, in seconds.
const TTL_DAY_SECS: i64 = 300;
const TTL_ROLLING_SECS: i64 = 60;
const TTL_HOURLY_SECS: i64 = 60;
const TTL_NETWORK_SECS: i64 = 300;

/// `{count, min, avg, max, p50..p99}` over one time range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub message_count: i64,
    pub average_gateways: f64,
    pub min_gateways: i64,
    pub max_gateways: i64,
    pub p50_gateways: Option<f64>,
    pub p90_gateways: Option<f64>,
    pub p95_gateways: Option<f64>,
    pub p99_gateways: Option<f64>,
    /// First/last packet actually observed inside the range.
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayStat {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub stats: WindowStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyStat {
    pub hour: i64,
    #[serde(flatten)]
    pub stats: WindowStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingWindow {
    pub window: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: WindowStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingStats {
    pub last_24h: RollingWindow,
    pub last_7d: RollingWindow,
    pub last_30d: RollingWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonDeltas {
    pub day_over_day: f64,
    pub week_over_week: f64,
    pub month_over_month: f64,
    pub gateway_day_over_day: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparisons {
    pub today: DayStat,
    pub yesterday: DayStat,
    pub last_week: DayStat,
    pub last_month: DayStat,
    pub comparisons: ComparisonDeltas,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    pub total_nodes: i64,
    pub total_gateways: i64,
    pub active_nodes: ActiveCounts,
    pub active_gateways: ActiveCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCounts {
    pub last_24h: i64,
    pub last_7d: i64,
    pub last_30d: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub le: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPercentiles {
    pub node_id: i64,
    pub sample_size: usize,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

/// Linear-interpolated p-quantile over an ascending sample.
///
/// For rank `r = p * (n-1)`: `sample[floor(r)] + frac(r) * (sample[ceil(r)] -
/// sample[floor(r)])`. Empty samples have no percentiles; a single value is
/// every percentile.
pub fn percentile(sorted: &[i64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n == 1 {
        return Some(sorted[0] as f64);
    }
    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    let weight = rank - lower as f64;
    Some(sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight)
}

/// `(current - baseline) / max(baseline, 1) * 100`.
fn percent_delta(current: f64, baseline: f64) -> f64 {
    (current - baseline) / baseline.max(1.0) * 100.0
}

/// The engine. Cheap to clone; owns no state beyond the store handle.
#[derive(Clone)]
pub struct StatsEngine {
    store: Store,
}

impl StatsEngine {
    pub fn new(store: Store) -> Self {
        StatsEngine { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ------------------------------------------------------------------
    // Per-packet views (uncached)
    // ------------------------------------------------------------------

    pub async fn last_message(&self) -> Result<Option<PacketRow>> {
        Ok(self.store.last_packets(1).await?.pop())
    }

    pub async fn last_n(&self, n: i64) -> Result<Vec<PacketRow>> {
        self.store.last_packets(n).await
    }

    pub async fn last_for_user(&self, node_id: u32) -> Result<Option<PacketRow>> {
        Ok(self.store.last_packets_for_user(node_id, 1).await?.pop())
    }

    pub async fn last_n_for_user(&self, node_id: u32, n: i64) -> Result<Vec<PacketRow>> {
        self.store.last_packets_for_user(node_id, n).await
    }

    // ------------------------------------------------------------------
    // Aggregates (cached)
    // ------------------------------------------------------------------

    pub async fn day_stats(&self, date: NaiveDate) -> Result<DayStat> {
        let key = format!("day:{}", date);
        self.cached(&key, Duration::seconds(TTL_DAY_SECS), || async {
            let (start, end) = day_bounds(date);
            Ok(DayStat {
                date,
                stats: self.window_stats(start, end).await?,
            })
        })
        .await
    }

    pub async fn today_stats(&self) -> Result<DayStat> {
        self.day_stats(Utc::now().date_naive()).await
    }

    /// 24 hourly entries for one UTC day; silent hours carry zero counts.
    pub async fn hourly_breakdown(&self, date: NaiveDate) -> Result<Vec<HourlyStat>> {
        let key = format!("hourly:{}", date);
        self.cached(&key, Duration::seconds(TTL_HOURLY_SECS), || async {
            let (start, _) = day_bounds(date);
            let rows = self.store.hourly_rows(start, start + Duration::days(1)).await?;
            let mut out = Vec::with_capacity(24);
            for hour in 0..24i64 {
                let row = rows.iter().find(|r| r.hour == hour);
                let stats = match row {
                    Some(r) if r.message_count > 0 => {
                        let hour_start = start + Duration::hours(hour);
                        let samples = self
                            .store
                            .gateway_samples(hour_start, hour_start + Duration::hours(1))
                            .await?;
                        WindowStats {
                            message_count: r.message_count,
                            average_gateways: r.avg_gateways.unwrap_or(0.0),
                            min_gateways: r.min_gateways.unwrap_or(0),
                            max_gateways: r.max_gateways.unwrap_or(0),
                            p50_gateways: percentile(&samples, 50.0),
                            p90_gateways: percentile(&samples, 90.0),
                            p95_gateways: percentile(&samples, 95.0),
                            p99_gateways: percentile(&samples, 99.0),
                            start_timestamp: None,
                            end_timestamp: None,
                        }
                    }
                    _ => WindowStats::default(),
                };
                out.push(HourlyStat { hour, stats });
            }
            Ok(out)
        })
        .await
    }

    pub async fn rolling_stats(&self) -> Result<RollingStats> {
        let now = Utc::now();
        Ok(RollingStats {
            last_24h: self.rolling_window("24h", now - Duration::hours(24), now).await?,
            last_7d: self.rolling_window("7d", now - Duration::days(7), now).await?,
            last_30d: self.rolling_window("30d", now - Duration::days(30), now).await?,
        })
    }

    async fn rolling_window(
        &self,
        label: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RollingWindow> {
        let key = format!("rolling:{}", label);
        self.cached(&key, Duration::seconds(TTL_ROLLING_SECS), || async {
            Ok(RollingWindow {
                window: label.to_string(),
                start_time: start,
                end_time: end,
                stats: self.window_stats(start, end).await?,
            })
        })
        .await
    }

    pub async fn comparisons(&self) -> Result<Comparisons> {
        let today = Utc::now().date_naive();
        let today_stats = self.day_stats(today).await?;
        let yesterday = self.day_stats(today - Duration::days(1)).await?;
        let last_week = self.day_stats(today - Duration::days(7)).await?;
        let last_month = self.day_stats(today - Duration::days(30)).await?;

        let comparisons = ComparisonDeltas {
            day_over_day: percent_delta(
                today_stats.stats.message_count as f64,
                yesterday.stats.message_count as f64,
            ),
            week_over_week: percent_delta(
                today_stats.stats.message_count as f64,
                last_week.stats.message_count as f64,
            ),
            month_over_month: percent_delta(
                today_stats.stats.message_count as f64,
                last_month.stats.message_count as f64,
            ),
            gateway_day_over_day: percent_delta(
                today_stats.stats.average_gateways,
                yesterday.stats.average_gateways,
            ),
        };
        Ok(Comparisons {
            today: today_stats,
            yesterday,
            last_week,
            last_month,
            comparisons,
        })
    }

    pub async fn network_stats(&self) -> Result<NetworkStats> {
        self.cached("network", Duration::seconds(TTL_NETWORK_SECS), || async {
            let counts: NetworkCounts = self.store.network_counts(Utc::now()).await?;
            Ok(NetworkStats {
                total_nodes: counts.total_nodes,
                total_gateways: counts.total_gateways,
                active_nodes: ActiveCounts {
                    last_24h: counts.active_nodes_24h,
                    last_7d: counts.active_nodes_7d,
                    last_30d: counts.active_nodes_30d,
                },
                active_gateways: ActiveCounts {
                    last_24h: counts.active_gateways_24h,
                    last_7d: counts.active_gateways_7d,
                    last_30d: counts.active_gateways_30d,
                },
            })
        })
        .await
    }

    pub async fn top_senders(&self, limit: i64, window_days: i64) -> Result<Vec<TopSenderRow>> {
        let now = Utc::now();
        self.store
            .top_senders(limit, now - Duration::days(window_days), now)
            .await
    }

    /// Bucketed gateway-count distribution over `[start, end)`.
    pub async fn gateway_histogram(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket_bounds: &[i64],
    ) -> Result<Vec<HistogramBucket>> {
        let samples = self.store.gateway_samples(start, end).await?;
        let mut buckets: Vec<HistogramBucket> = bucket_bounds
            .iter()
            .map(|b| HistogramBucket { le: *b, count: 0 })
            .collect();
        for sample in samples {
            for bucket in buckets.iter_mut() {
                if sample <= bucket.le {
                    bucket.count += 1;
                    break;
                }
            }
        }
        Ok(buckets)
    }

    /// Percentiles over a user's trailing sample of gateway counts.
    pub async fn user_gateway_percentiles(
        &self,
        node_id: u32,
        sample_cap: i64,
    ) -> Result<UserPercentiles> {
        let mut samples = self.store.gateway_samples_for_user(node_id, sample_cap).await?;
        samples.sort_unstable();
        Ok(UserPercentiles {
            node_id: node_id as i64,
            sample_size: samples.len(),
            p50: percentile(&samples, 50.0),
            p90: percentile(&samples, 90.0),
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
            min: samples.first().copied(),
            max: samples.last().copied(),
        })
    }

    /// Precompute the rolling windows and network totals so interactive reads
    /// hit warm cache entries. Fired every minute by the scheduler.
    pub async fn warm_cache(&self) -> Result<()> {
        self.rolling_stats().await?;
        self.network_stats().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn window_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<WindowStats> {
        let agg = self.store.aggregate_range(start, end).await?;
        let samples = if agg.message_count > 0 {
            self.store.gateway_samples(start, end).await?
        } else {
            Vec::new()
        };
        Ok(WindowStats {
            message_count: agg.message_count,
            average_gateways: agg.avg_gateways.unwrap_or(0.0),
            min_gateways: agg.min_gateways.unwrap_or(0),
            max_gateways: agg.max_gateways.unwrap_or(0),
            p50_gateways: percentile(&samples, 50.0),
            p90_gateways: percentile(&samples, 90.0),
            p95_gateways: percentile(&samples, 95.0),
            p99_gateways: percentile(&samples, 99.0),
            start_timestamp: agg.first_ts,
            end_timestamp: agg.last_ts,
        })
    }

    /// Read-through cache wrapper: serve a fresh entry verbatim, otherwise
    /// compute, store, and return.
    async fn cached<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let now = Utc::now();
        if let Some(hit) = self.store.cache_get(key, now).await? {
            if let Ok(value) = serde_json::from_str::<T>(&hit) {
                debug!("stat cache hit: {}", key);
                return Ok(value);
            }
            // Shape drift after an upgrade: fall through and overwrite.
        }
        let value = compute().await?;
        self.store
            .cache_put(key, &serde_json::to_string(&value)?, ttl)
            .await?;
        Ok(value)
    }
}

/// `[midnight, midnight+1d)` for a UTC date.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"));
    (start, start + Duration::days(1))
}
