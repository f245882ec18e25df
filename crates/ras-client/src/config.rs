//! Client configuration: defaults plus `RAS_*` environment overrides.

use std::str::FromStr;
use std::time::Duration;

use ras_common::helpers::{env_string, env_u64, env_usize};

pub const DEFAULT_RELAY_URL: &str = "https://ntfy.sh";
pub const DEFAULT_OVERLAY_PORT: u16 = 7890;

/// How strategies are attempted once capabilities are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// One strategy at a time, in priority order.
    #[default]
    Sequential,
    /// All viable strategies at once; first authenticated transport wins.
    Race,
}

impl FromStr for ConnectMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(Self::Sequential),
            "race" | "parallel" => Ok(Self::Race),
            other => Err(format!("unknown connect mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the ntfy-compatible relay.
    pub relay_url: String,
    pub relay_keepalive: Duration,
    pub relay_backoff_base: Duration,
    pub relay_backoff_cap: Duration,
    /// Reconnect attempts after the relay subscription drops.
    pub relay_max_attempts: u32,
    pub subscribe_ready_timeout: Duration,

    /// Accepted clock skew for signaling envelopes, either direction.
    pub signal_window: Duration,
    pub replay_cache_capacity: usize,

    pub pairing_timeout: Duration,
    pub probe_timeout: Duration,
    pub relay_capabilities_timeout: Duration,

    pub vpn_handshake_attempts: u32,
    pub vpn_attempt_timeout: Duration,
    /// Used when the daemon does not advertise an overlay port.
    pub vpn_port: u16,

    pub lan_auth_timeout: Duration,
    pub auth_timeout: Duration,
    /// Upper bound for one strategy, including post-connect authentication.
    pub strategy_timeout: Duration,
    pub connect_mode: ConnectMode,

    /// Delay between a connection error and the reconnection it triggers.
    pub reconnect_settle_delay: Duration,

    pub device_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            relay_keepalive: Duration::from_secs(15),
            relay_backoff_base: Duration::from_secs(1),
            relay_backoff_cap: Duration::from_secs(10),
            relay_max_attempts: 3,
            subscribe_ready_timeout: Duration::from_secs(10),
            signal_window: Duration::from_secs(30),
            replay_cache_capacity: 100,
            pairing_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            relay_capabilities_timeout: Duration::from_secs(15),
            vpn_handshake_attempts: 3,
            vpn_attempt_timeout: Duration::from_millis(1500),
            vpn_port: DEFAULT_OVERLAY_PORT,
            lan_auth_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            strategy_timeout: Duration::from_secs(15),
            connect_mode: ConnectMode::Sequential,
            reconnect_settle_delay: Duration::from_secs(1),
            device_name: "RAS phone".to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `RAS_*` environment variables.
    ///
    /// Unparseable numeric values fall back to the default; an unknown
    /// `RAS_CONNECT_MODE` is an error.
    pub fn from_env() -> ras_common::Result<Self> {
        let defaults = Self::default();

        let connect_mode = match env_string("RAS_CONNECT_MODE") {
            Some(mode) => mode.parse().map_err(ras_common::Error::config)?,
            None => defaults.connect_mode,
        };

        let vpn_port = env_u64("RAS_VPN_PORT", defaults.vpn_port as u64);
        let vpn_port = u16::try_from(vpn_port)
            .map_err(|_| ras_common::Error::config(format!("invalid RAS_VPN_PORT: {}", vpn_port)))?;

        Ok(Self {
            relay_url: env_string("RAS_RELAY_URL").unwrap_or(defaults.relay_url),
            relay_keepalive: env_millis("RAS_RELAY_KEEPALIVE_MS", defaults.relay_keepalive),
            relay_max_attempts: env_u64("RAS_RELAY_MAX_ATTEMPTS", defaults.relay_max_attempts as u64)
                as u32,
            signal_window: env_millis("RAS_SIGNAL_WINDOW_MS", defaults.signal_window),
            replay_cache_capacity: env_usize(
                "RAS_REPLAY_CACHE_CAPACITY",
                defaults.replay_cache_capacity,
            ),
            pairing_timeout: env_millis("RAS_PAIRING_TIMEOUT_MS", defaults.pairing_timeout),
            probe_timeout: env_millis("RAS_PROBE_TIMEOUT_MS", defaults.probe_timeout),
            vpn_port,
            strategy_timeout: env_millis("RAS_STRATEGY_TIMEOUT_MS", defaults.strategy_timeout),
            connect_mode,
            device_name: env_string("RAS_DEVICE_NAME").unwrap_or(defaults.device_name),
            ..defaults
        })
    }

    pub fn relay_settings(&self) -> crate::signaling::RelaySettings {
        crate::signaling::RelaySettings {
            keepalive: self.relay_keepalive,
            backoff_base: self.relay_backoff_base,
            backoff_cap: self.relay_backoff_cap,
            max_attempts: self.relay_max_attempts,
            ready_timeout: self.subscribe_ready_timeout,
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_u64(name, default.as_millis() as u64))
}
