use proctor_relay::api;
use proctor_relay::config::Config;
use proctor_relay::relay::Relay;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("proctor_relay=info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env();
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        max_warnings = config.compliance.max_warnings,
        "Starting proctor relay"
    );

    let relay = Relay::spawn(&config.auth);
    let routes = api::relay_routes(&config, relay);

    warp::serve(routes)
        .run(config.bind_address())
        .await;
}
