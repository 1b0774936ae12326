//! # Orchestrator
//!
//! Owns construction order, task spawning, and shutdown. Components are wired
//! explicitly at construction (no globals): store → codec/grouper → ingest,
//! bot, scheduler, HTTP. A single watch channel fans the shutdown signal out
//! to every task; intake stops first, then open groups are flushed, then the
//! rest unwinds.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::{build_router, AppState};
use crate::bot::commands::CommandExecutor;
use crate::bot::CommandBot;
use crate::codec::{Codec, KeyRing};
use crate::config::Config;
use crate::mqtt::grouper::PacketGrouper;
use crate::mqtt::MqttIngest;
use crate::scheduler::Scheduler;
use crate::stats::StatsEngine;
use crate::storage::Store;
use crate::subscriptions::SubscriptionSvc;

/// Bounded grace period for the shutdown flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Process exit codes: 0 clean, 1 config/startup error, 2 forced exit after a
/// flush timeout.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_FLUSH_TIMEOUT: i32 = 2;

pub struct StatsServer {
    config: Config,
    store: Store,
    stats: StatsEngine,
    grouper: Arc<PacketGrouper>,
    ingest: Arc<MqttIngest>,
    bot: Arc<CommandBot>,
    scheduler: Arc<Scheduler>,
    subscriptions: SubscriptionSvc,
}

impl StatsServer {
    /// Wire every component. Fails fast on an unreachable or unmigratable
    /// database; nothing is spawned yet.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::open(&config.database_url)
            .await
            .context("opening the packet store")?;
        let stats = StatsEngine::new(store.clone());
        let subscriptions = SubscriptionSvc::new(store.clone());

        let keyring = KeyRing::from_config(&config.meshtastic);
        if keyring.is_empty() {
            warn!("no decryption keys configured; encrypted envelopes will be dropped");
        }
        let codec = Codec::new(keyring);
        let grouper = Arc::new(PacketGrouper::new(
            store.clone(),
            config.grouping.window_seconds,
            config.grouping.quiescence_seconds,
            config.grouping.late_retention_hours,
        ));
        let ingest = Arc::new(MqttIngest::new(
            config.mqtt.clone(),
            codec,
            grouper.clone(),
            store.clone(),
        ));

        let executor = CommandExecutor::new(
            stats.clone(),
            subscriptions.clone(),
            ingest.status_handle(),
        );
        let (bot, bot_handle) = CommandBot::new(config.meshtastic.clone(), store.clone(), executor);
        let bot = Arc::new(bot);

        let scheduler = Scheduler::new(
            stats.clone(),
            subscriptions.clone(),
            bot_handle,
            config.schedule.clone(),
        );

        Ok(StatsServer {
            config,
            store,
            stats,
            grouper,
            ingest,
            bot,
            scheduler,
            subscriptions,
        })
    }

    /// Run until a shutdown signal. Returns the process exit code.
    pub async fn run(self) -> Result<i32> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = AppState {
            store: self.store.clone(),
            stats: self.stats.clone(),
            subscriptions: self.subscriptions.clone(),
            mqtt_status: self.ingest.status_handle(),
            bot: self.bot.handle(),
            scheduler_status: self.scheduler.handle(),
            scheduler: self.scheduler.clone(),
            started_at: Utc::now(),
        };
        let router = build_router(state, &self.config.dashboard_dir);

        let bind = format!("{}:{}", self.config.api.host, self.config.api.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("binding HTTP listener on {}", bind))?;
        info!("HTTP API listening on {}", bind);

        let ingest = self.ingest.clone();
        let ingest_rx = shutdown_rx.clone();
        let ingest_task = tokio::spawn(async move { ingest.run(ingest_rx).await });

        let grouper = self.grouper.clone();
        let grouper_rx = shutdown_rx.clone();
        let grouper_task = tokio::spawn(async move { grouper.run_tick_loop(grouper_rx).await });

        let bot = self.bot.clone();
        let bot_rx = shutdown_rx.clone();
        let bot_task = tokio::spawn(async move { bot.run(bot_rx).await });

        let scheduler = self.scheduler.clone();
        let scheduler_rx = shutdown_rx.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

        let mut http_rx = shutdown_rx.clone();
        let http_task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = http_rx.changed().await;
            });
            if let Err(err) = serve.await {
                error!("HTTP server error: {:#}", err);
            }
        });

        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        // Intake first, then the grouper (its exit path flushes open groups).
        let flush = async {
            let _ = ingest_task.await;
            let _ = grouper_task.await;
        };
        let mut exit_code = EXIT_OK;
        if tokio::time::timeout(SHUTDOWN_GRACE, flush).await.is_err() {
            error!(
                "flush did not complete within {:?}; {} group(s) may be lost",
                SHUTDOWN_GRACE,
                self.grouper.open_groups()
            );
            exit_code = EXIT_FLUSH_TIMEOUT;
        }

        // The bot may take one inter-chunk delay to finish its current message.
        let bot_grace = Duration::from_secs(self.config.meshtastic.inter_chunk_delay_seconds + 1);
        if tokio::time::timeout(bot_grace, bot_task).await.is_err() {
            warn!("command bot did not stop within {:?}", bot_grace);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, scheduler_task).await.is_err() {
            warn!("scheduler did not stop within {:?}", SHUTDOWN_GRACE);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, http_task).await.is_err() {
            warn!("HTTP server did not stop within {:?}", SHUTDOWN_GRACE);
        }

        info!("shutdown complete");
        Ok(exit_code)
    }

    /// One-shot status summary for the `status` CLI command.
    pub async fn print_status(&self) -> Result<()> {
        let info = self.store.database_info().await?;
        let latency = self.store.health_latency().await?;
        let last = self.store.last_packets(1).await?;
        println!("meshstats v{}", env!("CARGO_PKG_VERSION"));
        println!("database: {} ({} bytes)", self.config.database_url, info.size_bytes);
        println!("  latency: {:.1} ms", latency.as_secs_f64() * 1000.0);
        println!("  nodes: {}", info.nodes);
        println!("  packets: {} ({} gateway links)", info.packets, info.packet_gateways);
        println!("  subscriptions: {}", info.subscriptions);
        println!("  command logs: {}", info.command_logs);
        match last.first() {
            Some(packet) => println!(
                "  newest packet: {} from {} at {} ({} gateways)",
                packet.packet_id, packet.sender_name, packet.sent_at, packet.gateway_count
            ),
            None => println!("  newest packet: none"),
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!("failed to install SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
