use warp::Filter;

use super::websocket;
use crate::config::Config;
use crate::relay::RelayHandle;

/// All relay routes: the signaling socket plus the health and config probes.
pub fn relay_routes(
    config: &Config,
    relay: RelayHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    websocket_route(relay)
        .or(health_check())
        .or(config_endpoint(config))
}

pub fn websocket_route(
    relay: RelayHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_relay(relay))
        .map(|ws: warp::ws::Ws, relay: RelayHandle| {
            ws.on_upgrade(move |websocket| websocket::handle_relay_websocket(websocket, relay))
        })
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Proctor Relay",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

/// Client-facing settings. The shared secret is never exposed here.
pub fn config_endpoint(
    config: &Config,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let body = serde_json::json!({
        "compliance": config.compliance,
        "roster_poll_interval_ms": config.supervisor.roster_poll_interval.as_millis() as u64,
        "ice_servers": config.ice.stun_servers,
    });

    warp::path("config")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&body))
}

fn with_relay(
    relay: RelayHandle,
) -> impl Filter<Extract = (RelayHandle,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || relay.clone())
}
