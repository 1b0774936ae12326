//! Router-level tests for the HTTP read model and control endpoints.
mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use meshstats::storage::NewPacket;
use serde_json::Value;
use tower::ServiceExt;

async fn request(
    router: &axum::Router,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get(router: &axum::Router, path: &str) -> (StatusCode, Value) {
    request(router, "GET", path, None).await
}

/// Insert one packet with `gateway_count` distinct relays at `sent_at`.
async fn seed_packet(
    store: &meshstats::storage::Store,
    packet_id: u32,
    sender: u32,
    gateway_count: usize,
    sent_at: DateTime<Utc>,
) {
    let relays: Vec<(String, DateTime<Utc>)> = (0..gateway_count)
        .map(|i| (format!("!{:08x}", 0x1000 + i), sent_at))
        .collect();
    store
        .insert_grouped_packet(
            &NewPacket {
                packet_id,
                sender,
                sender_name: format!("node-{}", sender),
                sent_at,
                rssi: Some(-90),
                snr: Some(5.0),
                hop_start: None,
                hop_limit: None,
                payload: "seeded".to_string(),
            },
            &relays,
        )
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn stats_last_returns_newest_packet() {
    let app = common::test_app().await;
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    seed_packet(&app.store, 7001, 0xA1, 1, t0).await;

    let (status, body) = get(&app.router, "/stats/last").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["packet_id"], 7001);
    assert_eq!(body["sender_user_id"], 0xA1);
    assert_eq!(body["gateway_count"], 1);
}

#[tokio::test]
async fn stats_last_is_404_on_empty_store() {
    let app = common::test_app().await;
    let (status, body) = get(&app.router, "/stats/last").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["status_code"], 404);
}

#[tokio::test]
async fn stats_last_n_validates_bounds() {
    let app = common::test_app().await;
    let (status, body) = get(&app.router, "/stats/last/500").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    assert_eq!(body["status_code"], 400);
    assert!(body["detail"].as_str().unwrap().contains("between 1 and 100"));

    let (status, _) = get(&app.router, "/stats/last/0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn date_stats_carry_reference_percentiles() {
    let app = common::test_app().await;
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    for (i, count) in [1usize, 1, 2, 3, 5, 8, 13].iter().enumerate() {
        seed_packet(&app.store, 8000 + i as u32, 0xB2, *count, t0).await;
    }

    let (status, body) = get(&app.router, "/stats/2025-06-01").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message_count"], 7);
    assert_eq!(body["p50_gateways"], 3.0);
    assert_eq!(body["p90_gateways"], 10.0);
    assert_eq!(body["max_gateways"], 13);
    assert_eq!(body["min_gateways"], 1);

    let (status, body) = get(&app.router, "/stats/not-a-date").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "date must be YYYY-MM-DD");
}

#[tokio::test]
async fn user_routes_scope_to_sender() {
    let app = common::test_app().await;
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    seed_packet(&app.store, 9001, 0xA1, 2, t0).await;
    seed_packet(&app.store, 9002, 0xB2, 3, t0).await;

    let (status, body) = get(&app.router, &format!("/stats/user/{}/last", 0xA1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["packet_id"], 9001);

    let (status, _) = get(&app.router, "/stats/user/12345/last").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = get(&app.router, &format!("/users/{}/gateways?limit=5", 0xB2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (status, body) =
        get(&app.router, &format!("/users/{}/gateway_percentiles", 0xB2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sample_size"], 1);
    assert_eq!(body["p50"], 3.0);
}

#[tokio::test]
async fn subscription_flow_over_http() {
    let app = common::test_app().await;

    let (status, body) = request(&app.router, "POST", "/subscribe/161/avg", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["variant"], "avg");

    // Re-subscribing with a different variant replaces, not duplicates.
    let (status, _) = request(&app.router, "POST", "/subscribe/161/high", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = get(&app.router, "/subscriptions").await;
    assert_eq!(status, StatusCode::OK);
    let subs = body.as_array().unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0]["variant"], "high");

    let (status, body) = get(&app.router, "/subscriptions?subscription_type=low").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    let (status, _) = request(&app.router, "POST", "/subscribe/161/hourly", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(&app.router, "DELETE", "/subscribe/161", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(&app.router, "DELETE", "/subscribe/161", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mock_message_inserts_through_the_store_path() {
    let app = common::test_app().await;
    let (status, body) = request(
        &app.router,
        "POST",
        "/mock/message",
        Some(serde_json::json!({
            "packet_id": 4242,
            "sender_id": 77,
            "payload": "mocked",
            "gateways": ["!AA", "!BB"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gateway_count"], 2);

    let (status, body) = get(&app.router, "/stats/last").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["packet_id"], 4242);
    assert_eq!(body["gateway_count"], 2);

    // Reusing a packet id through the same path is rejected, not duplicated.
    let (status, _) = request(
        &app.router,
        "POST",
        "/mock/message",
        Some(serde_json::json!({ "packet_id": 4242, "sender_id": 78 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn network_health_and_metrics_endpoints_respond() {
    let app = common::test_app().await;
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    seed_packet(&app.store, 9100, 0xA1, 2, t0).await;

    let (status, body) = get(&app.router, "/network/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_nodes"], 1);
    assert_eq!(body["total_gateways"], 2);

    let (status, body) = get(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["database"]["reachable"].as_bool().unwrap());
    assert!(body["mqtt"]["connected"].is_boolean());
    assert!(body["bot"]["connected"].is_boolean());

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("meshstats_group_closed_total"));
    assert!(text.contains("meshstats_gateways_per_packet_bucket"));
}

#[tokio::test]
async fn admin_database_endpoints() {
    let app = common::test_app().await;
    let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    seed_packet(&app.store, 9200, 0xA1, 1, old).await;

    let (status, body) = get(&app.router, "/admin/database/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["packets"], 1);

    let (status, _) = request(&app.router, "DELETE", "/admin/database/expire", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        request(&app.router, "DELETE", "/admin/database/expire?days=30", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["packets"], 1);

    let (status, body) = get(&app.router, "/admin/database/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["packets"], 0);
}
