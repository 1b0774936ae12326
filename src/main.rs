//! Binary entrypoint for the meshstats service.
//!
//! Commands:
//! - `start` - run the full service (MQTT ingest, HTTP API, bot, scheduler)
//! - `status` - print a short store summary and exit
//!
//! Configuration comes entirely from the environment; see the `config`
//! module for the recognised variables. Exit codes: 0 clean, 1 configuration
//! or startup error, 2 forced exit after a shutdown-flush timeout.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use meshstats::config::Config;
use meshstats::server::{StatsServer, EXIT_CONFIG};

#[derive(Parser)]
#[command(name = "meshstats")]
#[command(about = "Gateway statistics service for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v for debug, -vv for trace; overrides LOG_LEVEL)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the statistics service
    Start,
    /// Show store status and a brief summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            // Logging may not be up yet; make sure the reason reaches stderr.
            eprintln!("configuration error: {err:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    init_logging(&config.log_level, cli.verbose);

    match cli.command {
        Commands::Start => {
            info!("starting meshstats v{}", env!("CARGO_PKG_VERSION"));
            let server = match StatsServer::new(config).await {
                Ok(server) => server,
                Err(err) => {
                    error!("startup failed: {err:#}");
                    std::process::exit(EXIT_CONFIG);
                }
            };
            let exit_code = server.run().await?;
            std::process::exit(exit_code);
        }
        Commands::Status => {
            let server = StatsServer::new(config).await?;
            server.print_status().await?;
        }
    }

    Ok(())
}

fn init_logging(configured_level: &str, verbosity: u8) {
    use std::io::Write;
    let level = match verbosity {
        0 => configured_level
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    // Quiet the MQTT client's per-packet chatter unless we are tracing.
    if level < log::LevelFilter::Trace {
        builder.filter_module("rumqttc", log::LevelFilter::Warn);
    }
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
