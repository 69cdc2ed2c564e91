// HTTP probes of an in-process relay

mod common;

use common::{TestRelay, PASSWORD};

/// Health endpoint reports the service name and crate version
#[tokio::test]
async fn test_health_endpoint() {
    let relay = TestRelay::start().await;

    let resp = reqwest::get(relay.http_url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200, "Health endpoint should return 200 OK");

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "Proctor Relay");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

/// Config endpoint exposes client settings but never the shared secret
#[tokio::test]
async fn test_config_endpoint() {
    let relay = TestRelay::start().await;

    let resp = reqwest::get(relay.http_url("/config")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let raw = resp.text().await.unwrap();
    assert!(!raw.contains(PASSWORD));

    let body: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(body["compliance"]["max_warnings"], 3);
    assert_eq!(body["compliance"]["reset_delay_ms"], 2000);
    assert!(body["ice_servers"].is_array());
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let relay = TestRelay::start().await;

    let resp = reqwest::get(relay.http_url("/admin/health")).await.unwrap();
    assert_eq!(resp.status(), 404);
}
