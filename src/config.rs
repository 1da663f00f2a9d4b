use std::time::Duration;
use tracing::info;

use crate::backoff::Backoff;
use crate::supervisor::SupervisorConfig;

// ---------------------------------------------------------------------------
// Configuration, loaded from environment variables
// ---------------------------------------------------------------------------

/// Settings shared by the broker and both client modes.
///
/// Every field can be set via an environment variable prefixed with
/// `PEERWATCH_`.  Defaults match a local single-machine setup: broker on
/// port 3000, public Google STUN servers, 10s offer timeout.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Broker ──────────────────────────────────────────────────────────
    /// Address the broker binds its HTTP/WebSocket listener to.
    pub bind_addr: String,
    /// Comma-separated CORS origins, or `*`.
    pub allowed_origins: String,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,

    // ── Clients ─────────────────────────────────────────────────────────
    /// WebSocket URL of the broker's `/ws` endpoint.
    pub broker_url: String,
    /// STUN server URLs handed to the local ICE agent.
    pub stun_urls: Vec<String>,
    pub response_timeout: Duration,
    pub recovery_guard: Duration,
    pub liveness_interval: Duration,
    /// Broker reconnection attempts before the client gives up (0 = forever).
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Base URL of the telemetry/upload collaborator.
    pub telemetry_url: Option<String>,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// The caller loads `.env` beforehand so the log level is known before
    /// tracing starts.
    pub fn from_env() -> Self {
        Config {
            bind_addr: env_or("PEERWATCH_BIND_ADDR", "0.0.0.0:3000"),
            allowed_origins: env_or("PEERWATCH_ALLOWED_ORIGINS", "*"),
            outbound_queue: env_parse("PEERWATCH_OUTBOUND_QUEUE", 64),
            broker_url: env_or("PEERWATCH_BROKER_URL", "ws://localhost:3000/ws"),
            stun_urls: env_csv(
                "PEERWATCH_STUN_URLS",
                &["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"],
            ),
            response_timeout: Duration::from_millis(env_parse(
                "PEERWATCH_RESPONSE_TIMEOUT_MS",
                10_000,
            )),
            recovery_guard: Duration::from_millis(env_parse("PEERWATCH_RECOVERY_GUARD_MS", 5_000)),
            liveness_interval: Duration::from_secs(env_parse(
                "PEERWATCH_LIVENESS_INTERVAL_SECS",
                60,
            )),
            reconnect_attempts: env_parse("PEERWATCH_RECONNECT_ATTEMPTS", 10),
            reconnect_delay: Duration::from_millis(env_parse(
                "PEERWATCH_RECONNECT_DELAY_MS",
                2_000,
            )),
            telemetry_url: std::env::var("PEERWATCH_TELEMETRY_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            log_level: env_or("PEERWATCH_LOG_LEVEL", "info"),
        }
    }

    /// Timer settings for every supervisor this process spawns.
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            response_timeout: self.response_timeout,
            recovery_guard: self.recovery_guard,
            restart_backoff: Backoff::default(),
        }
    }

    /// Backoff between broker reconnection attempts.
    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff {
            initial: self.reconnect_delay,
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            max_attempts: (self.reconnect_attempts > 0).then_some(self.reconnect_attempts),
        }
    }

    pub fn log_summary(&self) {
        info!("──── peerwatch configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  outbound_queue     : {}", self.outbound_queue);
        info!("  broker_url         : {}", self.broker_url);
        info!("  stun_urls          : {:?}", self.stun_urls);
        info!("  response_timeout   : {:?}", self.response_timeout);
        info!("  recovery_guard     : {:?}", self.recovery_guard);
        info!("  liveness_interval  : {:?}", self.liveness_interval);
        info!(
            "  reconnect          : {} attempts, {:?} initial delay",
            self.reconnect_attempts, self.reconnect_delay
        );
        info!(
            "  telemetry_url      : {}",
            self.telemetry_url.as_deref().unwrap_or("(disabled)")
        );
        info!("  log_level          : {}", self.log_level);
        info!("─────────────────────────────────");
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            allowed_origins: "*".into(),
            outbound_queue: 64,
            broker_url: "ws://localhost:3000/ws".into(),
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            response_timeout: Duration::from_secs(10),
            recovery_guard: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(60),
            reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(2),
            telemetry_url: None,
            log_level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
