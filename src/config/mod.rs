use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub compliance: ComplianceConfig,
    pub supervisor: SupervisorConfig,
    pub ice: IceConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub admin_password: String,
}

// Keep the shared secret out of logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComplianceConfig {
    pub max_warnings: u32,
    #[serde(rename = "check_interval_ms", serialize_with = "as_millis")]
    pub check_interval: Duration,
    #[serde(rename = "reset_delay_ms", serialize_with = "as_millis")]
    pub reset_delay: Duration,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            max_warnings: 3,
            check_interval: Duration::from_secs(3),
            reset_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub roster_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            roster_poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Reads `key` and parses it, falling back to `default` when unset or unparseable.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = %key, value = %raw, "Unparseable configuration value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Millisecond duration from `key`. Zero is not a usable period and falls back to `default`.
fn env_millis(key: &str, default: Duration) -> Duration {
    let millis = env_parse(key, default.as_millis() as u64);
    if millis == 0 {
        tracing::warn!(key = %key, "Zero duration is not allowed, using default");
        return default;
    }
    Duration::from_millis(millis)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let defaults = ComplianceConfig::default();

        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("PORT", 3000),
            },
            auth: AuthConfig {
                admin_password: env::var("ADMIN_PASSWORD")
                    .unwrap_or_else(|_| DEFAULT_ADMIN_PASSWORD.to_string()),
            },
            compliance: ComplianceConfig {
                max_warnings: env_parse("MAX_WARNINGS", defaults.max_warnings).max(1),
                check_interval: env_millis("CHECK_INTERVAL_MS", defaults.check_interval),
                reset_delay: Duration::from_millis(env_parse(
                    "RESET_DELAY_MS",
                    defaults.reset_delay.as_millis() as u64,
                )),
            },
            supervisor: SupervisorConfig {
                roster_poll_interval: env_millis(
                    "ROSTER_POLL_MS",
                    SupervisorConfig::default().roster_poll_interval,
                ),
            },
            ice: IceConfig {
                stun_servers: vec![env::var("STUN_SERVER_URL")
                    .unwrap_or_else(|_| DEFAULT_STUN_SERVER.to_string())],
            },
        }
    }

    /// Builds a config for an in-process relay (tests, CLI self-checks).
    pub fn local(admin_password: impl Into<String>) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            auth: AuthConfig {
                admin_password: admin_password.into(),
            },
            compliance: ComplianceConfig::default(),
            supervisor: SupervisorConfig::default(),
            ice: IceConfig::default(),
        }
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::UNSPECIFIED;
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::LOCALHOST,
            "" | "0.0.0.0" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}
