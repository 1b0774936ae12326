//! # HTTP API
//!
//! A thin read model over the store and stats engine, plus control endpoints
//! for the scheduler and the command bot. Every handler validates its input,
//! calls one service method, and serialises the result; errors map onto a
//! `{error, detail, status_code}` envelope. The dashboard bundle is served as
//! static files under `/`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::services::ServeDir;

use crate::bot::BotHandle;
use crate::metrics;
use crate::mqtt::StatusHandle;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::stats::StatsEngine;
use crate::storage::{NewPacket, PacketRow, Store};
use crate::subscriptions::SubscriptionSvc;

/// Everything the handlers need; cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub stats: StatsEngine,
    pub subscriptions: SubscriptionSvc,
    pub mqtt_status: StatusHandle,
    pub bot: BotHandle,
    pub scheduler_status: SchedulerHandle,
    pub scheduler: Arc<Scheduler>,
    pub started_at: DateTime<Utc>,
}

/// Error envelope: `{error, detail, status_code}`.
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            detail: detail.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("internal error serving request: {:#}", err);
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal_error",
            detail: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.error,
            "detail": self.detail,
            "status_code": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct DaysQuery {
    days: Option<i64>,
}

#[derive(Deserialize)]
struct SubscriptionQuery {
    subscription_type: Option<String>,
}

fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, 100)
}

/// Build the full router. The dashboard directory is served for any path the
/// API does not claim.
pub fn build_router(state: AppState, dashboard_dir: &str) -> Router {
    Router::new()
        .route("/stats/last", get(stats_last))
        .route("/stats/last/:n", get(stats_last_n))
        .route("/stats/today", get(stats_today))
        .route("/stats/today/detailed", get(stats_today_detailed))
        .route("/stats/comparisons", get(stats_comparisons))
        .route("/stats/rolling", get(stats_rolling))
        .route("/stats/user/:node_id/last", get(user_last))
        .route("/stats/user/:node_id/last/:n", get(user_last_n))
        .route("/stats/:date", get(stats_by_date))
        .route("/users/:node_id/messages", get(user_messages))
        .route("/users/:node_id/gateways", get(user_gateways))
        .route("/users/:node_id/gateway_percentiles", get(user_gateway_percentiles))
        .route("/messages/recent", get(messages_recent))
        .route("/messages/detailed", get(messages_detailed))
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscribe/:node_id/:variant", post(subscribe))
        .route("/subscribe/:node_id", delete(unsubscribe))
        .route("/network/stats", get(network_stats))
        .route("/bot/stats", get(bot_stats))
        .route("/bot/commands/recent", get(bot_commands_recent))
        .route("/bot/commands/user/:node_id", get(bot_commands_user))
        .route("/health", get(health))
        .route("/admin/database/info", get(database_info))
        .route("/admin/database/expire", delete(database_expire))
        .route("/admin/commands/status", get(bot_status))
        .route("/admin/commands/restart", post(bot_restart))
        .route("/admin/test-broadcast", post(test_broadcast))
        .route("/mock/message", post(mock_message))
        .route("/mock/user", post(mock_user))
        .route("/metrics", get(metrics_text))
        .fallback_service(ServeDir::new(dashboard_dir))
        .layer(axum::middleware::from_fn(count_requests))
        .with_state(state)
}

async fn count_requests(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    metrics::inc_http_requests();
    debug!("{} {}", request.method(), request.uri().path());
    next.run(request).await
}

// ----------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------

async fn stats_last(State(state): State<AppState>) -> ApiResult<Json<PacketRow>> {
    state
        .stats
        .last_message()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no messages recorded yet"))
}

async fn stats_last_n(
    State(state): State<AppState>,
    Path(n): Path<i64>,
) -> ApiResult<Json<Vec<PacketRow>>> {
    if !(1..=100).contains(&n) {
        return Err(ApiError::bad_request("n must be between 1 and 100"));
    }
    Ok(Json(state.stats.last_n(n).await?))
}

async fn stats_today(State(state): State<AppState>) -> ApiResult<Json<crate::stats::DayStat>> {
    Ok(Json(state.stats.today_stats().await?))
}

async fn stats_today_detailed(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let today = Utc::now().date_naive();
    let day = state.stats.day_stats(today).await?;
    let hourly = state.stats.hourly_breakdown(today).await?;
    Ok(Json(serde_json::json!({
        "summary": day,
        "hourly": hourly,
    })))
}

async fn stats_comparisons(
    State(state): State<AppState>,
) -> ApiResult<Json<crate::stats::Comparisons>> {
    Ok(Json(state.stats.comparisons().await?))
}

async fn stats_rolling(State(state): State<AppState>) -> ApiResult<Json<crate::stats::RollingStats>> {
    Ok(Json(state.stats.rolling_stats().await?))
}

async fn stats_by_date(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> ApiResult<Json<crate::stats::DayStat>> {
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request("date must be YYYY-MM-DD"))?;
    Ok(Json(state.stats.day_stats(date).await?))
}

async fn user_last(
    State(state): State<AppState>,
    Path(node_id): Path<u32>,
) -> ApiResult<Json<PacketRow>> {
    state
        .stats
        .last_for_user(node_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no messages recorded for this node"))
}

async fn user_last_n(
    State(state): State<AppState>,
    Path((node_id, n)): Path<(u32, i64)>,
) -> ApiResult<Json<Vec<PacketRow>>> {
    if !(1..=100).contains(&n) {
        return Err(ApiError::bad_request("n must be between 1 and 100"));
    }
    Ok(Json(state.stats.last_n_for_user(node_id, n).await?))
}

async fn user_messages(
    State(state): State<AppState>,
    Path(node_id): Path<u32>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<PacketRow>>> {
    let limit = clamp_limit(query.limit, 20);
    Ok(Json(state.stats.last_n_for_user(node_id, limit).await?))
}

async fn user_gateways(
    State(state): State<AppState>,
    Path(node_id): Path<u32>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<crate::storage::GatewaySeenRow>>> {
    let limit = clamp_limit(query.limit, 20);
    Ok(Json(state.store.gateways_for_user(node_id, limit).await?))
}

async fn user_gateway_percentiles(
    State(state): State<AppState>,
    Path(node_id): Path<u32>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<crate::stats::UserPercentiles>> {
    let limit = clamp_limit(query.limit, 100);
    Ok(Json(state.stats.user_gateway_percentiles(node_id, limit).await?))
}

async fn messages_recent(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<PacketRow>>> {
    let limit = clamp_limit(query.limit, 20);
    Ok(Json(state.stats.last_n(limit).await?))
}

async fn messages_detailed(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = clamp_limit(query.limit, 20);
    let packets = state.stats.last_n(limit).await?;
    let mut out = Vec::with_capacity(packets.len());
    for packet in packets {
        let gateways = state.store.gateways_for_packet(packet.packet_id).await?;
        let mut value = serde_json::to_value(&packet).map_err(anyhow::Error::from)?;
        value["gateways"] = serde_json::json!(gateways);
        out.push(value);
    }
    Ok(Json(serde_json::Value::Array(out)))
}

// ----------------------------------------------------------------------
// Subscriptions
// ----------------------------------------------------------------------

async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
) -> ApiResult<Json<Vec<crate::storage::SubscriptionRow>>> {
    let variant = match query.subscription_type.as_deref() {
        Some(raw) => Some(
            state
                .subscriptions
                .parse_variant(raw)
                .map_err(|err| ApiError::bad_request(err.to_string()))?,
        ),
        None => None,
    };
    Ok(Json(state.subscriptions.list(variant).await?))
}

async fn subscribe(
    State(state): State<AppState>,
    Path((node_id, variant)): Path<(u32, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let variant = state
        .subscriptions
        .parse_variant(&variant)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    state.subscriptions.subscribe(node_id, variant).await?;
    Ok(Json(serde_json::json!({
        "node_id": node_id,
        "variant": variant.as_str(),
        "active": true,
    })))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Path(node_id): Path<u32>,
) -> ApiResult<Json<serde_json::Value>> {
    let was_active = state.subscriptions.unsubscribe(node_id).await?;
    if !was_active {
        return Err(ApiError::not_found("no active subscription for this node"));
    }
    Ok(Json(serde_json::json!({ "node_id": node_id, "active": false })))
}

// ----------------------------------------------------------------------
// Network / bot / admin
// ----------------------------------------------------------------------

async fn network_stats(State(state): State<AppState>) -> ApiResult<Json<crate::stats::NetworkStats>> {
    Ok(Json(state.stats.network_stats().await?))
}

async fn bot_stats(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let days = query.days.unwrap_or(7).clamp(1, 365);
    Ok(Json(state.store.bot_stats(days).await?))
}

async fn bot_commands_recent(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<crate::storage::CommandLogRow>>> {
    let limit = clamp_limit(query.limit, 20);
    Ok(Json(state.store.recent_commands(limit).await?))
}

async fn bot_commands_user(
    State(state): State<AppState>,
    Path(node_id): Path<u32>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<crate::storage::CommandLogRow>>> {
    let limit = clamp_limit(query.limit, 20);
    Ok(Json(state.store.commands_for_user(node_id, limit).await?))
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let db_latency = state.store.health_latency().await;
    let mqtt = state.mqtt_status.snapshot();
    let bot = state.bot.status();
    let jobs = state.scheduler_status.job_statuses();
    let healthy = db_latency.is_ok();
    Ok(Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "database": {
            "reachable": healthy,
            "latency_ms": db_latency.map(|d| d.as_secs_f64() * 1000.0).unwrap_or(-1.0),
        },
        "mqtt": mqtt,
        "scheduler": jobs,
        "bot": { "connected": bot.connected, "state": bot.state },
    })))
}

async fn database_info(State(state): State<AppState>) -> ApiResult<Json<crate::storage::DatabaseInfo>> {
    Ok(Json(state.store.database_info().await?))
}

async fn database_expire(
    State(state): State<AppState>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Json<crate::storage::ExpireSummary>> {
    let days = query
        .days
        .ok_or_else(|| ApiError::bad_request("days query parameter is required"))?;
    if days < 1 {
        return Err(ApiError::bad_request("days must be >= 1"));
    }
    Ok(Json(state.store.expire(days).await?))
}

async fn bot_status(State(state): State<AppState>) -> Json<crate::bot::BotStatus> {
    Json(state.bot.status())
}

async fn bot_restart(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.bot.request_restart();
    Json(serde_json::json!({ "restart": "requested" }))
}

async fn test_broadcast(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.run_daily_broadcast().await?;
    Ok(Json(serde_json::json!({ "broadcast": "queued" })))
}

// ----------------------------------------------------------------------
// Mock inserts (test affordance; same write paths as ingest)
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct MockMessage {
    packet_id: Option<u32>,
    sender_id: u32,
    sender_name: Option<String>,
    payload: Option<String>,
    rssi: Option<i64>,
    snr: Option<f64>,
    gateways: Option<Vec<String>>,
    timestamp: Option<DateTime<Utc>>,
}

async fn mock_message(
    State(state): State<AppState>,
    Json(body): Json<MockMessage>,
) -> ApiResult<Json<serde_json::Value>> {
    let packet_id = body.packet_id.unwrap_or_else(rand::random::<u32>);
    let sent_at = body.timestamp.unwrap_or_else(Utc::now);
    let gateways = body
        .gateways
        .unwrap_or_else(|| vec!["!00000001".to_string()]);
    if gateways.is_empty() {
        return Err(ApiError::bad_request("gateways must not be empty"));
    }
    let relays: Vec<(String, DateTime<Utc>)> = gateways
        .iter()
        .map(|g| {
            crate::codec::canonical_gateway_id(g)
                .ok_or_else(|| ApiError::bad_request(format!("invalid gateway id {:?}", g)))
                .map(|id| (id, sent_at))
        })
        .collect::<Result<_, _>>()?;

    let packet = NewPacket {
        packet_id,
        sender: body.sender_id,
        sender_name: body
            .sender_name
            .unwrap_or_else(|| format!("node-{}", body.sender_id)),
        sent_at,
        rssi: body.rssi,
        snr: body.snr,
        hop_start: None,
        hop_limit: None,
        payload: body.payload.unwrap_or_default(),
    };
    match state.store.insert_grouped_packet(&packet, &relays).await? {
        Some(id) => Ok(Json(serde_json::json!({
            "id": id,
            "packet_id": packet_id,
            "gateway_count": relays.len(),
        }))),
        None => Err(ApiError::bad_request("packet_id already exists")),
    }
}

#[derive(Deserialize)]
struct MockUser {
    user_id: u32,
    username: String,
    mesh_id: Option<String>,
    role: Option<i64>,
}

async fn mock_user(
    State(state): State<AppState>,
    Json(body): Json<MockUser>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .store
        .apply_node_info(
            body.user_id,
            &body.username,
            body.mesh_id.as_deref(),
            body.role,
            Utc::now(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "node_id": body.user_id, "username": body.username })))
}

// ----------------------------------------------------------------------
// Metrics
// ----------------------------------------------------------------------

async fn metrics_text() -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render_prometheus(),
    )
        .into_response()
}
