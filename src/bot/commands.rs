//! `!` command grammar and dispatch.
//!
//! Parsing is case-insensitive and whitespace-tolerant; the parsed command is
//! a plain enum so the session loop can log and rate-limit before any work
//! happens. Dispatch renders the full reply string; chunking for the radio
//! happens in the session layer.

use anyhow::Result;
use chrono::Utc;

use crate::mqtt::StatusHandle;
use crate::stats::{DayStat, StatsEngine};
use crate::subscriptions::{SubscriptionSvc, SummaryVariant};

/// Bounds for `!stats last N messages`.
const LAST_N_MIN: u32 = 1;
const LAST_N_MAX: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    About,
    StatsLastMessage,
    StatsLastN(u32),
    StatsToday,
    StatsTodayDetailed,
    StatsStatus,
    Subscribe(SummaryVariant),
    Unsubscribe,
    MySubscriptions,
    Unknown,
}

impl Command {
    /// Canonical spelling for the audit log.
    pub fn canonical(&self) -> String {
        match self {
            Command::Help => "!help".to_string(),
            Command::About => "!about".to_string(),
            Command::StatsLastMessage => "!stats last message".to_string(),
            Command::StatsLastN(n) => format!("!stats last {} messages", n),
            Command::StatsToday => "!stats today".to_string(),
            Command::StatsTodayDetailed => "!stats today detailed".to_string(),
            Command::StatsStatus => "!stats status".to_string(),
            Command::Subscribe(v) => format!("!subscribe {}", v),
            Command::Unsubscribe => "!unsubscribe".to_string(),
            Command::MySubscriptions => "!my_subscriptions".to_string(),
            Command::Unknown => "!unknown".to_string(),
        }
    }
}

/// Parse message text into a command. `None` when the text is not a command
/// at all (no `!` prefix); `Some(Command::Unknown)` for an unrecognised verb.
pub fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('!')?;
    let words: Vec<String> = rest
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let words_ref: Vec<&str> = words.iter().map(|s| s.as_str()).collect();

    Some(match words_ref.as_slice() {
        ["help"] => Command::Help,
        ["about"] => Command::About,
        ["stats", "last", "message"] => Command::StatsLastMessage,
        ["stats", "last", n, "messages"] | ["stats", "last", n, "message"] => {
            match n.parse::<u32>() {
                Ok(n) => Command::StatsLastN(n.clamp(LAST_N_MIN, LAST_N_MAX)),
                Err(_) => Command::Unknown,
            }
        }
        ["stats", "today"] => Command::StatsToday,
        ["stats", "today", "detailed"] => Command::StatsTodayDetailed,
        ["stats", "status"] => Command::StatsStatus,
        ["subscribe", variant] => match SummaryVariant::parse(variant) {
            Some(v) => Command::Subscribe(v),
            None => Command::Unknown,
        },
        ["unsubscribe"] => Command::Unsubscribe,
        ["my_subscriptions"] => Command::MySubscriptions,
        _ => Command::Unknown,
    })
}

/// Executes parsed commands against the stats and subscription services.
#[derive(Clone)]
pub struct CommandExecutor {
    stats: StatsEngine,
    subscriptions: SubscriptionSvc,
    mqtt_status: StatusHandle,
}

impl CommandExecutor {
    pub fn new(stats: StatsEngine, subscriptions: SubscriptionSvc, mqtt_status: StatusHandle) -> Self {
        CommandExecutor {
            stats,
            subscriptions,
            mqtt_status,
        }
    }

    pub async fn execute(&self, node_id: u32, command: Command) -> Result<String> {
        Ok(match command {
            Command::Help => help_text(),
            Command::About => about_text(),
            Command::StatsLastMessage => {
                match self.stats.last_for_user(node_id).await? {
                    None => "No messages recorded for you yet.".to_string(),
                    Some(p) => format!(
                        "Last message:\nID {} | Gateways {} | {}",
                        p.packet_id,
                        p.gateway_count,
                        p.sent_at.format("%Y-%m-%d %H:%M UTC")
                    ),
                }
            }
            Command::StatsLastN(n) => {
                let rows = self.stats.last_n_for_user(node_id, n as i64).await?;
                if rows.is_empty() {
                    "No messages recorded for you yet.".to_string()
                } else {
                    let lines: Vec<String> = rows
                        .iter()
                        .map(|p| {
                            format!(
                                "{}: {} gw (ID {})",
                                p.sent_at.format("%m-%d %H:%M UTC"),
                                p.gateway_count,
                                p.packet_id
                            )
                        })
                        .collect();
                    format!("Last messages:\n{}", lines.join("\n"))
                }
            }
            Command::StatsToday => {
                let stats = self.stats.today_stats().await?;
                format_daily_stats(&stats)
            }
            Command::StatsTodayDetailed => {
                let breakdown = self.stats.hourly_breakdown(Utc::now().date_naive()).await?;
                let lines: Vec<String> = breakdown
                    .iter()
                    .filter(|h| h.stats.message_count > 0)
                    .map(|h| {
                        let mut line = format!(
                            "{:02}h → {} msgs, avg {:.1}",
                            h.hour, h.stats.message_count, h.stats.average_gateways
                        );
                        if let (Some(p50), Some(p90)) = (h.stats.p50_gateways, h.stats.p90_gateways)
                        {
                            line.push_str(&format!(", p50 {:.0}, p90 {:.0}", p50, p90));
                        }
                        line
                    })
                    .collect();
                if lines.is_empty() {
                    "No data for today yet.".to_string()
                } else {
                    format!("Hourly breakdown:\n{}", lines.join("\n"))
                }
            }
            Command::StatsStatus => {
                let status = self.mqtt_status.snapshot();
                let last = status
                    .last_message
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "n/a".to_string());
                format!(
                    "MQTT connected: {} | Messages today: {} | Last MQTT message: {}",
                    status.connected, status.messages_today, last
                )
            }
            Command::Subscribe(variant) => {
                self.subscriptions.subscribe(node_id, variant).await?;
                format!("✅ Subscribed to {}.", variant)
            }
            Command::Unsubscribe => {
                self.subscriptions.unsubscribe(node_id).await?;
                "🔕 All subscriptions cancelled.".to_string()
            }
            Command::MySubscriptions => match self.subscriptions.subscription_for(node_id).await? {
                None => "No active subscriptions.".to_string(),
                Some(sub) => format!("Active subscriptions:\n- {}", sub.variant),
            },
            Command::Unknown => "Unknown command. Send !help for the command list.".to_string(),
        })
    }
}

fn help_text() -> String {
    concat!(
        "Commands:\n",
        "!help\n",
        "!about\n",
        "!stats last message\n",
        "!stats last 5 messages\n",
        "!stats today\n",
        "!stats today detailed\n",
        "!stats status\n",
        "!subscribe low|avg|high\n",
        "!unsubscribe\n",
        "!my_subscriptions"
    )
    .to_string()
}

fn about_text() -> String {
    concat!(
        "Meshstats\n",
        "Counts how many gateways hear each mesh packet\n",
        "and delivers daily summaries over the mesh."
    )
    .to_string()
}

fn format_daily_stats(stats: &DayStat) -> String {
    let mut out = format!(
        "Stats for {}:\nMessages: {}\nAvg: {:.1} gw | Min: {} | Max: {}",
        stats.date,
        stats.stats.message_count,
        stats.stats.average_gateways,
        stats.stats.min_gateways,
        stats.stats.max_gateways
    );
    if let (Some(p50), Some(p90), Some(p95), Some(p99)) = (
        stats.stats.p50_gateways,
        stats.stats.p90_gateways,
        stats.stats.p95_gateways,
        stats.stats.p99_gateways,
    ) {
        out.push_str(&format!(
            "\nPercentiles:\np50: {:.1} | p90: {:.1}\np95: {:.1} | p99: {:.1}",
            p50, p90, p95, p99
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_verbs() {
        assert_eq!(parse_command("!help"), Some(Command::Help));
        assert_eq!(parse_command("  !ABOUT  "), Some(Command::About));
        assert_eq!(parse_command("!stats today"), Some(Command::StatsToday));
        assert_eq!(
            parse_command("!stats today detailed"),
            Some(Command::StatsTodayDetailed)
        );
        assert_eq!(parse_command("!stats status"), Some(Command::StatsStatus));
        assert_eq!(parse_command("!unsubscribe"), Some(Command::Unsubscribe));
        assert_eq!(
            parse_command("!my_subscriptions"),
            Some(Command::MySubscriptions)
        );
    }

    #[test]
    fn parses_last_n_with_clamping() {
        assert_eq!(
            parse_command("!stats last message"),
            Some(Command::StatsLastMessage)
        );
        assert_eq!(
            parse_command("!stats last 5 messages"),
            Some(Command::StatsLastN(5))
        );
        assert_eq!(
            parse_command("!STATS  LAST  12  MESSAGES"),
            Some(Command::StatsLastN(12))
        );
        assert_eq!(
            parse_command("!stats last 0 messages"),
            Some(Command::StatsLastN(1))
        );
        assert_eq!(
            parse_command("!stats last 500 messages"),
            Some(Command::StatsLastN(20))
        );
        assert_eq!(
            parse_command("!stats last many messages"),
            Some(Command::Unknown)
        );
    }

    #[test]
    fn parses_subscription_verbs() {
        assert_eq!(
            parse_command("!subscribe avg"),
            Some(Command::Subscribe(SummaryVariant::Avg))
        );
        assert_eq!(
            parse_command("!Subscribe HIGH"),
            Some(Command::Subscribe(SummaryVariant::High))
        );
        assert_eq!(parse_command("!subscribe daily"), Some(Command::Unknown));
    }

    #[test]
    fn non_commands_are_none() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("stats today"), None);
    }

    #[test]
    fn unknown_verbs_are_flagged() {
        assert_eq!(parse_command("!weather"), Some(Command::Unknown));
        assert_eq!(parse_command("!stats"), Some(Command::Unknown));
    }
}
