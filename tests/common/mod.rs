// Shared helpers for the relay integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use proctor_relay::api;
use proctor_relay::client::{authenticate, SignalingClient};
use proctor_relay::config::Config;
use proctor_relay::relay::{Relay, Roster, ServerMessage};

pub const PASSWORD: &str = "test-secret";
pub const WAIT: Duration = Duration::from_secs(5);

/// In-process relay on an ephemeral port.
pub struct TestRelay {
    pub addr: SocketAddr,
}

impl TestRelay {
    pub async fn start() -> Self {
        let config = Config::local(PASSWORD);
        let relay = Relay::spawn(&config.auth);
        let routes = api::relay_routes(&config, relay);
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        Self { addr }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn client(&self) -> SignalingClient {
        SignalingClient::connect(&self.ws_url())
            .await
            .expect("connect to test relay")
    }

    /// Connected and authenticated supervisor, plus the roster it was handed.
    pub async fn supervisor(&self) -> (SignalingClient, Roster) {
        let mut client = self.client().await;
        let roster = authenticate(&mut client, PASSWORD, WAIT)
            .await
            .expect("supervisor authentication");
        (client, roster)
    }
}

/// Waits for a roster push satisfying `predicate`.
pub async fn expect_roster<F>(client: &mut SignalingClient, predicate: F) -> Roster
where
    F: Fn(&Roster) -> bool,
{
    match client
        .expect(WAIT, |m| matches!(m, ServerMessage::UserList(r) if predicate(r)))
        .await
        .expect("roster push")
    {
        ServerMessage::UserList(roster) => roster,
        other => panic!("unexpected message {:?}", other),
    }
}
