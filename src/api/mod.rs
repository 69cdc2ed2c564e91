pub mod routes;
mod websocket;

pub use routes::{config_endpoint, health_check, relay_routes, websocket_route};
