/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws/websocket";

/// Backoff policy for re-opening a dropped push connection.
///
/// `max_attempts == 0` disables reconnection entirely, which is the default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before attempt `attempt` (1-based): doubles from `initial_delay`,
    /// capped at `max_delay`, with up to 20% random jitter added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        let extra = rand::random::<u64>() % jitter_ms;
        (base + Duration::from_millis(extra)).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST collaborators (inbox, history, unread count, send)
    pub api_base_url: String,

    /// WebSocket endpoint speaking STOMP
    pub ws_url: String,

    /// Private topic carrying message events
    pub message_topic: String,

    /// Private topic carrying free-text notifications
    pub notification_topic: String,

    /// Destination for outbound send frames
    pub send_destination: String,

    /// Unread poll interval
    pub poll_interval: Duration,

    /// How long a notification stays visible
    pub notification_ttl: Duration,

    /// Push handshake timeout
    pub connect_timeout: Duration,

    /// How long an optimistic message may wait for its echo before it is marked failed
    pub send_timeout: Duration,

    /// Window for matching an echo without a client reference to a pending message
    pub echo_match_window: Duration,

    /// Fall back to the REST send endpoint when the push channel is down
    pub http_fallback: bool,

    /// Reconnect behaviour after the push connection drops
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            message_topic: "/user/queue/messages".to_string(),
            notification_topic: "/user/queue/notifications".to_string(),
            send_destination: "/app/chat".to_string(),
            poll_interval: Duration::from_secs(15),
            notification_ttl: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(15),
            echo_match_window: Duration::from_secs(30),
            http_fallback: true,
            reconnect: ReconnectPolicy::disabled(),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Config::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api" => {
                    config.api_base_url = flag_value(args, i, "--api")?.to_string();
                    i += 2;
                }
                "--ws" => {
                    config.ws_url = flag_value(args, i, "--ws")?.to_string();
                    i += 2;
                }
                "--poll-secs" => {
                    config.poll_interval = parse_secs(flag_value(args, i, "--poll-secs")?, "--poll-secs")?;
                    i += 2;
                }
                "--send-timeout-secs" => {
                    config.send_timeout = parse_secs(
                        flag_value(args, i, "--send-timeout-secs")?,
                        "--send-timeout-secs",
                    )?;
                    i += 2;
                }
                "--reconnect" => {
                    let n = flag_value(args, i, "--reconnect")?;
                    config.reconnect.max_attempts = n.parse::<u32>().map_err(|_| {
                        SyncError::Config("--reconnect must be a non-negative number".to_string())
                    })?;
                    i += 2;
                }
                "--no-http-fallback" => {
                    config.http_fallback = false;
                    i += 1;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATSYNC_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = std::env::var("CHATSYNC_WS_URL") {
            config.ws_url = url;
        }
        if let Some(secs) = std::env::var("CHATSYNC_POLL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            config.poll_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.ws_url.starts_with("ws://") && !self.ws_url.starts_with("wss://") {
            return Err(SyncError::Config(format!(
                "WebSocket URL must start with ws:// or wss://: {}",
                self.ws_url
            )));
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(SyncError::Config(format!(
                "API URL must start with http:// or https://: {}",
                self.api_base_url
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("Poll interval must be positive".to_string()));
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", flag)))
}

fn parse_secs(raw: &str, flag: &str) -> Result<Duration> {
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(SyncError::Config(format!("{} must be a positive number", flag))),
    }
}
