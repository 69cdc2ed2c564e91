// Proctor Relay CLI Validation Tool
// Checks a running relay through its HTTP probes and the signaling protocol

use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;
use proctor_relay::client::{authenticate, ParticipantSession, SignalingClient};
use proctor_relay::compliance::{DisplaySurface, ExamPhase, RecordingHost, SimulatedCapture};
use proctor_relay::config::{ComplianceConfig, IceConfig, DEFAULT_ADMIN_PASSWORD};
use proctor_relay::relay::{ClientMessage, ConnectionId, Roster, ServerMessage, SignalEnvelope};
use proctor_relay::transport::WebRtcTransport;
use tokio::time::{sleep, Duration};

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Proctor Relay CLI Validation Tool", long_about = None)]
struct Cli {
    /// Relay address (default: 127.0.0.1:3000)
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check relay health endpoint
    Health,

    /// Get relay configuration
    Config,

    /// Test WebSocket connection and identity handshake
    Connect,

    /// Authenticate as supervisor and print the roster
    Supervise {
        /// Supervisor shared secret
        #[arg(short, long)]
        password: String,

        /// Keep connection alive and print roster pushes (press Ctrl+C to exit)
        #[arg(short, long)]
        keep_alive: bool,
    },

    /// Join as a participant with a simulated entire-screen capture
    Join {
        /// Participant display name
        #[arg(short, long)]
        name: String,
    },

    /// Run automated validation scenarios
    Validate {
        /// Run all validation tests
        #[arg(short, long)]
        all: bool,

        /// Test specific scenario
        #[arg(short, long)]
        scenario: Option<String>,

        /// Supervisor shared secret used by the scenarios
        #[arg(short, long, default_value = DEFAULT_ADMIN_PASSWORD)]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => {
            check_health(&cli.server).await;
        }
        Commands::Config => {
            check_config(&cli.server).await;
        }
        Commands::Connect => {
            test_connection(&cli.server).await;
        }
        Commands::Supervise { password, keep_alive } => {
            supervise(&cli.server, password, *keep_alive).await;
        }
        Commands::Join { name } => {
            join_exam(&cli.server, name).await;
        }
        Commands::Validate {
            all,
            scenario,
            password,
        } => {
            if *all {
                run_all_validations(&cli.server, password).await;
            } else if let Some(s) = scenario {
                run_scenario(&cli.server, password, s).await;
            } else {
                println!("{}", "Use --all or --scenario <name>".yellow());
                list_scenarios();
            }
        }
    }
}

fn ws_url(server: &str) -> String {
    format!("ws://{}/ws", server)
}

fn print_roster(roster: &Roster) {
    if roster.is_empty() {
        println!("  {}", "(no participants)".dimmed());
    }
    for (id, name) in roster {
        println!("  {} {} {}", "•".cyan(), name.bold(), id.as_str().dimmed());
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking relay health...".cyan());

    let url = format!("http://{}/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
        }
    }
}

async fn check_config(server: &str) {
    println!("{}", "Fetching relay configuration...".cyan());

    let url = format!("http://{}/config", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                println!("{} Config endpoint accessible", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("\nConfiguration:");
                    match serde_json::to_string_pretty(&body) {
                        Ok(pretty) => println!("{}", pretty),
                        Err(_) => println!("{}", body),
                    }
                }
            } else {
                println!("{} Config fetch failed: {}", "✗".red(), resp.status());
            }
        }
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
        }
    }
}

async fn test_connection(server: &str) {
    println!("{}", "Testing WebSocket connection...".cyan());

    let url = ws_url(server);

    match SignalingClient::connect(&url).await {
        Ok(client) => {
            println!("{} WebSocket connection established", "✓".green());
            println!("  URL: {}", url);
            println!("  Connection ID: {}", client.id().as_str().green());
            client.close();
            println!("{} Connection closed cleanly", "✓".green());
        }
        Err(e) => {
            println!("{} WebSocket connection failed: {}", "✗".red(), e);
        }
    }
}

async fn supervise(server: &str, password: &str, keep_alive: bool) {
    println!("{}", "Authenticating as supervisor...".cyan());

    let mut client = match SignalingClient::connect(&ws_url(server)).await {
        Ok(client) => client,
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
            return;
        }
    };

    match authenticate(&mut client, password, Duration::from_secs(5)).await {
        Ok(roster) => {
            println!("{} Authenticated", "✓".green());
            println!("\n{}", "Participants:".bold());
            print_roster(&roster);
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    }

    if !keep_alive {
        println!("\nUse {} to watch roster changes.", "--keep-alive".cyan());
        return;
    }

    println!("\n{}", "Connection is being kept alive...".yellow());
    println!("Press {} to disconnect.", "Ctrl+C".bold());

    loop {
        tokio::select! {
            message = client.recv() => match message {
                Some(ServerMessage::UserList(roster)) => {
                    println!("\n{} {}", "◀".green(), "Roster update".bold());
                    print_roster(&roster);
                }
                Some(other) => {
                    let text = serde_json::to_string(&other).unwrap_or_default();
                    println!("{} {}", "◀".green(), text.bright_white());
                }
                None => {
                    println!("{} Connection closed", "✗".yellow());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }
}

async fn join_exam(server: &str, name: &str) {
    println!("{}", "Joining exam...".cyan());
    println!("  Name: {}", name);

    let client = match SignalingClient::connect(&ws_url(server)).await {
        Ok(client) => client,
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
            return;
        }
    };

    let transport = match WebRtcTransport::new(&IceConfig::default()) {
        Ok(transport) => transport,
        Err(e) => {
            println!("{} Cannot initialize media transport: {}", "✗".red(), e);
            return;
        }
    };

    let session = ParticipantSession::spawn(
        client,
        ComplianceConfig::default(),
        Arc::new(SimulatedCapture::granting(DisplaySurface::Monitor)),
        Arc::new(transport),
        Arc::new(RecordingHost::new()),
    );
    println!("  Connection ID: {}", session.id().as_str().green());

    let handle = session.handle().clone();
    if handle.start(name).is_err() {
        println!("{} Compliance machine stopped", "✗".red());
        return;
    }

    let mut updates = handle.subscribe();
    println!("Press {} to end the exam.", "Ctrl+C".bold());

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                println!(
                    "{} phase={:?} warnings={}/{} peer={:?}",
                    "◀".green(),
                    snapshot.phase,
                    snapshot.warnings,
                    snapshot.max_warnings,
                    snapshot.peer_state
                );
                if snapshot.phase == ExamPhase::Idle {
                    println!("{} Session is idle", "○".yellow());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nEnding exam...");
                let _ = handle.end_exam();
                sleep(Duration::from_millis(200)).await;
                break;
            }
        }
    }

    drop(updates);
    drop(handle);
    session.shutdown().await;
}

fn list_scenarios() {
    println!("\n{}", "Available Validation Scenarios:".bold());
    println!("  {} - Wrong supervisor secret is rejected", "auth-reject".cyan());
    println!("  {} - Correct secret authenticates and pushes the roster", "auth-accept".cyan());
    println!("  {} - Participant join/leave reaches the supervisor", "roster-broadcast".cyan());
    println!("  {} - Negotiation to an absent identity is dropped silently", "drop-unknown-target".cyan());
    println!("  {} - end-exam removes the participant, connection stays open", "end-exam".cyan());
    println!("\nExample: relay-cli validate --scenario auth-accept --password admin123");
}

const SCENARIOS: [&str; 5] = [
    "auth-reject",
    "auth-accept",
    "roster-broadcast",
    "drop-unknown-target",
    "end-exam",
];

async fn dispatch(server: &str, password: &str, scenario: &str) -> Option<bool> {
    let result = match scenario {
        "auth-reject" => validate_auth_reject(server).await,
        "auth-accept" => validate_auth_accept(server, password).await,
        "roster-broadcast" => validate_roster_broadcast(server, password).await,
        "drop-unknown-target" => validate_drop_unknown_target(server, password).await,
        "end-exam" => validate_end_exam(server, password).await,
        _ => return None,
    };
    Some(result)
}

async fn run_scenario(server: &str, password: &str, scenario: &str) {
    println!("\n{} {}", "Running scenario:".bold(), scenario.cyan());
    println!("{}", "─".repeat(60));

    match dispatch(server, password, scenario).await {
        Some(true) => println!("\n{} Scenario passed", "✓".green().bold()),
        Some(false) => println!("\n{} Scenario failed", "✗".red().bold()),
        None => {
            println!("{} Unknown scenario: {}", "✗".red(), scenario);
            list_scenarios();
        }
    }
}

async fn run_all_validations(server: &str, password: &str) {
    println!("\n{}", "Running All Validation Tests".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let mut passed = 0;
    let mut failed = 0;

    for scenario in SCENARIOS {
        println!("\n{} Testing: {}", "▶".cyan(), scenario.bold());
        println!("{}", "─".repeat(60));

        if dispatch(server, password, scenario).await == Some(true) {
            passed += 1;
        } else {
            failed += 1;
        }

        sleep(Duration::from_millis(200)).await;
    }

    println!("\n{}", "═".repeat(60).green());
    println!("{}", "Validation Summary".bold());
    println!("{}", "═".repeat(60).green());
    println!("  {} Passed: {}", "✓".green(), passed.to_string().green());
    println!("  {} Failed: {}", "✗".red(), failed.to_string().red());
    println!("  Total: {}", passed + failed);

    if failed == 0 {
        println!("\n{}", "All validations passed! 🎉".green().bold());
    } else {
        println!("\n{}", "Some validations failed. Check output above.".yellow());
    }
}

async fn connect(server: &str) -> Option<SignalingClient> {
    match SignalingClient::connect(&ws_url(server)).await {
        Ok(client) => Some(client),
        Err(e) => {
            println!("{} Connection failed: {}", "✗".red(), e);
            None
        }
    }
}

async fn connect_supervisor(server: &str, password: &str) -> Option<SignalingClient> {
    let mut client = connect(server).await?;
    match authenticate(&mut client, password, REPLY_TIMEOUT).await {
        Ok(_) => {
            println!("{} Supervisor authenticated", "✓".green());
            Some(client)
        }
        Err(e) => {
            println!("{} Supervisor authentication failed: {}", "✗".red(), e);
            None
        }
    }
}

async fn await_roster<F>(supervisor: &mut SignalingClient, predicate: F) -> bool
where
    F: Fn(&Roster) -> bool,
{
    supervisor
        .expect(REPLY_TIMEOUT, |m| matches!(m, ServerMessage::UserList(r) if predicate(r)))
        .await
        .is_ok()
}

async fn validate_auth_reject(server: &str) -> bool {
    let Some(mut client) = connect(server).await else {
        return false;
    };

    if client
        .send(ClientMessage::AdminAuth("definitely-not-the-secret".to_string()))
        .is_err()
    {
        println!("{} Failed to send message", "✗".red());
        return false;
    }

    match client
        .expect(REPLY_TIMEOUT, |m| {
            matches!(m, ServerMessage::AuthFailed(_) | ServerMessage::AuthSuccess)
        })
        .await
    {
        Ok(ServerMessage::AuthFailed(reason)) => {
            println!("{} Rejected: {}", "✓".green(), reason);
            true
        }
        Ok(_) => {
            println!("{} Wrong secret was accepted", "✗".red());
            false
        }
        Err(e) => {
            println!("{} No verdict received: {}", "✗".red(), e);
            false
        }
    }
}

async fn validate_auth_accept(server: &str, password: &str) -> bool {
    let Some(mut client) = connect(server).await else {
        return false;
    };

    match authenticate(&mut client, password, REPLY_TIMEOUT).await {
        Ok(roster) => {
            println!("{} Authenticated, roster has {} participant(s)", "✓".green(), roster.len());
            true
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            false
        }
    }
}

async fn validate_roster_broadcast(server: &str, password: &str) -> bool {
    println!("  Step 1: Supervisor connects...");
    let Some(mut supervisor) = connect_supervisor(server, password).await else {
        return false;
    };

    println!("  Step 2: Participant joins...");
    let Some(participant) = connect(server).await else {
        return false;
    };
    let participant_id = participant.id().clone();
    if participant
        .send(ClientMessage::JoinExam("Validator Participant".to_string()))
        .is_err()
    {
        return false;
    }

    if !await_roster(&mut supervisor, |r| {
        r.get(&participant_id).map(String::as_str) == Some("Validator Participant")
    })
    .await
    {
        println!("{} Supervisor never saw the participant", "✗".red());
        return false;
    }
    println!("{} Join broadcast received", "✓".green());

    println!("  Step 3: Participant disconnects...");
    participant.close();

    if !await_roster(&mut supervisor, |r| !r.contains_key(&participant_id)).await {
        println!("{} Supervisor never saw the participant leave", "✗".red());
        return false;
    }
    println!("{} Leave broadcast received", "✓".green());
    true
}

async fn validate_drop_unknown_target(server: &str, password: &str) -> bool {
    let Some(mut supervisor) = connect_supervisor(server, password).await else {
        return false;
    };

    let offer = ClientMessage::Offer(SignalEnvelope {
        target: ConnectionId::from("no-such-connection"),
        payload: serde_json::json!({"type": "offer", "sdp": "v=0"}),
    });
    if supervisor.send(offer).is_err() || supervisor.send(ClientMessage::GetUserList).is_err() {
        println!("{} Failed to send message", "✗".red());
        return false;
    }

    match supervisor
        .expect(REPLY_TIMEOUT, |m| {
            matches!(m, ServerMessage::UserList(_) | ServerMessage::Error(_))
        })
        .await
    {
        Ok(ServerMessage::UserList(_)) => {
            println!("{} Offer dropped silently, connection still usable", "✓".green());
            true
        }
        Ok(other) => {
            println!("{} Unexpected reply: {:?}", "✗".red(), other);
            false
        }
        Err(e) => {
            println!("{} Connection unusable after drop: {}", "✗".red(), e);
            false
        }
    }
}

async fn validate_end_exam(server: &str, password: &str) -> bool {
    let Some(mut supervisor) = connect_supervisor(server, password).await else {
        return false;
    };
    let Some(participant) = connect(server).await else {
        return false;
    };
    let participant_id = participant.id().clone();

    if participant
        .send(ClientMessage::JoinExam("Ending Participant".to_string()))
        .is_err()
        || !await_roster(&mut supervisor, |r| r.contains_key(&participant_id)).await
    {
        println!("{} Participant never joined", "✗".red());
        return false;
    }

    if participant.send(ClientMessage::EndExam).is_err()
        || !await_roster(&mut supervisor, |r| !r.contains_key(&participant_id)).await
    {
        println!("{} end-exam did not remove the participant", "✗".red());
        return false;
    }
    println!("{} Participant removed from roster", "✓".green());

    // Same connection can join again.
    if participant
        .send(ClientMessage::JoinExam("Ending Participant".to_string()))
        .is_err()
        || !await_roster(&mut supervisor, |r| r.contains_key(&participant_id)).await
    {
        println!("{} Connection was not reusable after end-exam", "✗".red());
        return false;
    }
    println!("{} Connection stayed open", "✓".green());

    participant.close();
    true
}
