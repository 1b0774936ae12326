//! # Scheduler
//!
//! Cron-style firing of the daily subscriber DMs, the daily channel
//! broadcast, and the periodic cache warm. Each job records `last_run`,
//! `next_run` and `last_error` for the health endpoint, holds a per-job lock
//! so an instance never overlaps itself, and survives its own failures (log
//! and continue).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::bot::BotHandle;
use crate::config::ScheduleConfig;
use crate::stats::{DayStat, StatsEngine};
use crate::subscriptions::{SubscriptionSvc, SummaryVariant};

const JOB_DAILY_DMS: &str = "daily_dms";
const JOB_DAILY_BROADCAST: &str = "daily_broadcast";
const JOB_CACHE_WARM: &str = "cache_warm";

const CACHE_WARM_INTERVAL: Duration = Duration::from_secs(60);

/// Broadcast delivery waits for the radio link with a few spaced attempts.
const BROADCAST_ATTEMPTS: u32 = 3;
const BROADCAST_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct JobRegistry {
    statuses: Mutex<HashMap<&'static str, JobStatus>>,
    dm_lock: tokio::sync::Mutex<()>,
    broadcast_lock: tokio::sync::Mutex<()>,
    warm_lock: tokio::sync::Mutex<()>,
}

impl JobRegistry {
    fn new() -> Self {
        JobRegistry {
            statuses: Mutex::new(HashMap::new()),
            dm_lock: tokio::sync::Mutex::new(()),
            broadcast_lock: tokio::sync::Mutex::new(()),
            warm_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn set_next_run(&self, job: &'static str, next: DateTime<Utc>) {
        self.statuses
            .lock()
            .expect("job registry poisoned")
            .entry(job)
            .or_default()
            .next_run = Some(next);
    }

    fn record_run(&self, job: &'static str, error: Option<String>) {
        let mut statuses = self.statuses.lock().expect("job registry poisoned");
        let status = statuses.entry(job).or_default();
        status.last_run = Some(Utc::now());
        status.last_error = error;
    }

    fn snapshot(&self) -> HashMap<String, JobStatus> {
        self.statuses
            .lock()
            .expect("job registry poisoned")
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

/// Observation handle for `/health`.
#[derive(Clone)]
pub struct SchedulerHandle {
    jobs: Arc<JobRegistry>,
}

impl SchedulerHandle {
    pub fn job_statuses(&self) -> HashMap<String, JobStatus> {
        self.jobs.snapshot()
    }
}

pub struct Scheduler {
    stats: StatsEngine,
    subscriptions: SubscriptionSvc,
    bot: BotHandle,
    schedule: ScheduleConfig,
    jobs: Arc<JobRegistry>,
}

impl Scheduler {
    pub fn new(
        stats: StatsEngine,
        subscriptions: SubscriptionSvc,
        bot: BotHandle,
        schedule: ScheduleConfig,
    ) -> Arc<Self> {
        Arc::new(Scheduler {
            stats,
            subscriptions,
            bot,
            schedule,
            jobs: Arc::new(JobRegistry::new()),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            jobs: self.jobs.clone(),
        }
    }

    /// Run all job loops until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            "scheduler started: daily DMs at {:02}:{:02} UTC, broadcast {} ({:02}:{:02} UTC, channel {}), cache warm every {}s",
            self.schedule.subscription_send_hour,
            self.schedule.subscription_send_minute,
            if self.schedule.broadcast_enabled { "enabled" } else { "disabled" },
            self.schedule.broadcast_hour,
            self.schedule.broadcast_minute,
            self.schedule.broadcast_channel,
            CACHE_WARM_INTERVAL.as_secs(),
        );

        let dms = tokio::spawn(self.clone().daily_loop(
            JOB_DAILY_DMS,
            self.schedule.subscription_send_hour,
            self.schedule.subscription_send_minute,
            shutdown.clone(),
        ));
        let broadcast = if self.schedule.broadcast_enabled {
            Some(tokio::spawn(self.clone().daily_loop(
                JOB_DAILY_BROADCAST,
                self.schedule.broadcast_hour,
                self.schedule.broadcast_minute,
                shutdown.clone(),
            )))
        } else {
            None
        };
        let warm = tokio::spawn(self.clone().cache_warm_loop(shutdown));

        let _ = dms.await;
        if let Some(broadcast) = broadcast {
            let _ = broadcast.await;
        }
        let _ = warm.await;
        info!("scheduler stopped");
    }

    async fn daily_loop(
        self: Arc<Self>,
        job: &'static str,
        hour: u8,
        minute: u8,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = next_daily_fire(Utc::now(), hour, minute);
            self.jobs.set_next_run(job, next);
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            self.fire(job).await;
        }
    }

    async fn cache_warm_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CACHE_WARM_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            self.jobs
                .set_next_run(JOB_CACHE_WARM, Utc::now() + ChronoDuration::seconds(60));
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            self.fire(JOB_CACHE_WARM).await;
        }
    }

    /// Run one job instance, skipping if the previous instance still holds
    /// the job lock.
    async fn fire(&self, job: &'static str) {
        let lock = match job {
            JOB_DAILY_DMS => &self.jobs.dm_lock,
            JOB_DAILY_BROADCAST => &self.jobs.broadcast_lock,
            _ => &self.jobs.warm_lock,
        };
        let guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("job {} still running; skipping this fire", job);
                return;
            }
        };
        let result = match job {
            JOB_DAILY_DMS => self.run_daily_dms().await,
            JOB_DAILY_BROADCAST => self.run_daily_broadcast().await,
            _ => self.stats.warm_cache().await,
        };
        drop(guard);
        match result {
            Ok(()) => self.jobs.record_run(job, None),
            Err(err) => {
                error!("job {} failed: {:#}", job, err);
                self.jobs.record_run(job, Some(format!("{:#}", err)));
            }
        }
    }

    /// Yesterday's summary to every active subscriber, in their chosen shape.
    async fn run_daily_dms(&self) -> Result<()> {
        let date = Utc::now().date_naive() - ChronoDuration::days(1);
        let stats = self.stats.day_stats(date).await?;
        let subscriptions = self.subscriptions.list(None).await?;
        let mut sent = 0usize;
        for sub in &subscriptions {
            let Some(variant) = SummaryVariant::parse(&sub.variant) else {
                warn!(
                    "subscription for node {:08x} has unknown variant {:?}; skipping",
                    sub.user_node_id, sub.variant
                );
                continue;
            };
            let message = self.subscriptions.format(variant, &stats);
            self.bot.send_dm(sub.user_node_id as u32, message);
            sent += 1;
        }
        info!("daily report job queued {} DM(s) for {}", sent, date);
        Ok(())
    }

    /// Today's numbers so far onto the configured broadcast channel.
    pub async fn run_daily_broadcast(&self) -> Result<()> {
        let stats = self.stats.today_stats().await?;
        let message = format_broadcast_message(&stats);
        for attempt in 1..=BROADCAST_ATTEMPTS {
            if self.bot.status().connected {
                self.bot
                    .send_channel(self.schedule.broadcast_channel, message.clone());
                info!(
                    "daily broadcast queued for channel {} (attempt {})",
                    self.schedule.broadcast_channel, attempt
                );
                return Ok(());
            }
            if attempt < BROADCAST_ATTEMPTS {
                warn!(
                    "radio not connected for daily broadcast (attempt {}/{}); retrying in {:?}",
                    attempt, BROADCAST_ATTEMPTS, BROADCAST_RETRY_DELAY
                );
                tokio::time::sleep(BROADCAST_RETRY_DELAY).await;
            }
        }
        Err(anyhow!(
            "daily broadcast failed after {} attempts: radio not connected",
            BROADCAST_ATTEMPTS
        ))
    }
}

fn format_broadcast_message(stats: &DayStat) -> String {
    let mut out = format!(
        "📊 Daily Stats\nMessages: {}\nAvg GW: {:.1}\nPeak GW: {}\nMin GW: {}",
        stats.stats.message_count,
        stats.stats.average_gateways,
        stats.stats.max_gateways,
        stats.stats.min_gateways
    );
    if let (Some(p50), Some(p90), Some(p95)) = (
        stats.stats.p50_gateways,
        stats.stats.p90_gateways,
        stats.stats.p95_gateways,
    ) {
        out.push_str(&format!(
            "\nPercentiles:\np50: {:.0} | p90: {:.0}\np95: {:.0}",
            p50, p90, p95
        ));
    }
    out
}

/// Next occurrence of `HH:MM:00` UTC strictly after `now`.
fn next_daily_fire(now: DateTime<Utc>, hour: u8, minute: u8) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour as u32, minute as u32, 0).expect("valid schedule time");
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        (now.date_naive() + ChronoDuration::days(1)).and_time(at).and_utc()
    }
}
