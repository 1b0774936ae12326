//! # Subscription Service
//!
//! Lifecycle of daily-summary subscriptions and the fixed message templates
//! for the three variants. A node holds at most one active subscription;
//! subscribing again replaces the variant instead of stacking.

use anyhow::{anyhow, Result};
use log::info;
use std::fmt;

use crate::stats::DayStat;
use crate::storage::{Store, SubscriptionRow};

/// Shape of the daily summary a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryVariant {
    Low,
    Avg,
    High,
}

impl SummaryVariant {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(SummaryVariant::Low),
            "avg" => Some(SummaryVariant::Avg),
            "high" => Some(SummaryVariant::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryVariant::Low => "low",
            SummaryVariant::Avg => "avg",
            SummaryVariant::High => "high",
        }
    }

    pub const ALL: [SummaryVariant; 3] =
        [SummaryVariant::Low, SummaryVariant::Avg, SummaryVariant::High];
}

impl fmt::Display for SummaryVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct SubscriptionSvc {
    store: Store,
}

impl SubscriptionSvc {
    pub fn new(store: Store) -> Self {
        SubscriptionSvc { store }
    }

    /// Create or replace a node's subscription.
    pub async fn subscribe(&self, node_id: u32, variant: SummaryVariant) -> Result<()> {
        info!("subscribing node {:08x} to {}", node_id, variant);
        self.store.upsert_subscription(node_id, variant.as_str()).await
    }

    /// Deactivate a node's subscription. Returns whether one was active.
    pub async fn unsubscribe(&self, node_id: u32) -> Result<bool> {
        info!("unsubscribing node {:08x}", node_id);
        self.store.deactivate_subscription(node_id).await
    }

    /// The node's active subscription, if any.
    pub async fn subscription_for(&self, node_id: u32) -> Result<Option<SubscriptionRow>> {
        Ok(self
            .store
            .subscription_for(node_id)
            .await?
            .filter(|sub| sub.is_active))
    }

    /// Active subscriptions, optionally restricted to one variant.
    pub async fn list(&self, variant: Option<SummaryVariant>) -> Result<Vec<SubscriptionRow>> {
        self.store
            .active_subscriptions(variant.map(|v| v.as_str()))
            .await
    }

    /// Validate an API-supplied variant string.
    pub fn parse_variant(&self, raw: &str) -> Result<SummaryVariant> {
        SummaryVariant::parse(raw)
            .ok_or_else(|| anyhow!("invalid subscription variant {:?}; expected low|avg|high", raw))
    }

    /// Render the daily summary for one variant.
    pub fn format(&self, variant: SummaryVariant, stats: &DayStat) -> String {
        let count = stats.stats.message_count;
        match variant {
            SummaryVariant::High => format!(
                "🔴 Peak gateways today: {} (from {} messages)",
                stats.stats.max_gateways, count
            ),
            SummaryVariant::Low => format!(
                "🔵 Minimum gateways today: {} (from {} messages)",
                stats.stats.min_gateways, count
            ),
            SummaryVariant::Avg => format!(
                "🟡 Average gateways today: {:.1} (from {} messages)",
                stats.stats.average_gateways, count
            ),
        }
    }
}
