//! # Meshstats - Gateway Statistics Service for Meshtastic Networks
//!
//! Meshstats listens to a Meshtastic MQTT uplink, reconstructs how many
//! gateways relayed each mesh packet, and turns that into queryable network
//! statistics. It also runs a small command bot over a direct TCP link to a
//! mesh radio so people on the mesh can ask for their numbers without leaving
//! the network.
//!
//! ## Features
//!
//! - **MQTT Ingest**: subscribes to a broker topic tree, decrypts
//!   ServiceEnvelopes with a configurable key ring, and groups relays of the
//!   same packet across gateways.
//! - **Gateway Counting**: a bounded-window packet grouper produces exactly one
//!   stored record per mesh packet with the true distinct-gateway count,
//!   including late relays that arrive after the window closes.
//! - **Statistics**: daily, hourly and rolling aggregates with interpolated
//!   percentiles, backed by a TTL cache.
//! - **Command Bot**: `!`-prefixed commands over the radio link, with rate
//!   limiting, chunked replies sized for LoRa frames, and an audit trail.
//! - **Scheduled Summaries**: daily subscriber DMs and an optional channel
//!   broadcast.
//! - **HTTP API**: a read model over the store plus health, metrics, and admin
//!   endpoints.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshstats::config::Config;
//! use meshstats::server::StatsServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let server = StatsServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! MQTT broker ──► mqtt (ingest) ──► codec ──► mqtt::grouper ──► storage
//!                                                                  ▲
//! mesh radio ──► bot ◄── scheduler ──► subscriptions ──► stats ────┤
//!                                                                  │
//! HTTP clients ──► api ────────────────────────────────────────────┘
//! ```
//!
//! Two producers (MQTT ingest and the command bot) fan into the store; the
//! HTTP API fans out of it; the scheduler fires summaries through the bot.
//! The [`server`] module owns construction order and shutdown.

pub mod api;
pub mod bot;
pub mod codec;
pub mod config;
pub mod logutil;
pub mod metrics;
pub mod mqtt;
pub mod protobuf;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod storage;
pub mod subscriptions;
