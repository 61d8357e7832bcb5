use std::env;
use std::time::Duration;

use crate::media::DeviceClass;
use crate::supervisor::{DEFAULT_GRACE_WINDOW, DEFAULT_WAITING_TICK, MAX_RECONNECT_ATTEMPTS};
use crate::transport::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_DELAY, TransportConfig};

pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";

/// Every timer the call session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub grace_window: Duration,
    pub waiting_tick: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            grace_window: DEFAULT_GRACE_WINDOW,
            waiting_tick: DEFAULT_WAITING_TICK,
        }
    }
}

impl SessionTimings {
    pub fn transport(&self, relay_url: impl Into<String>) -> TransportConfig {
        TransportConfig {
            relay_url: relay_url.into(),
            heartbeat_interval: self.heartbeat_interval,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub relay_url: String,
    pub api_url: String,
    pub token: Option<String>,
    pub participant_id: Option<String>,
    pub device_class: DeviceClass,
    pub timings: SessionTimings,
}

impl CallConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|val| val.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let defaults = SessionTimings::default();
        let timings = SessionTimings {
            heartbeat_interval: secs("BEACH_CALL_HEARTBEAT_SECS", defaults.heartbeat_interval),
            reconnect_delay: secs("BEACH_CALL_RECONNECT_DELAY_SECS", defaults.reconnect_delay),
            max_reconnect_attempts: lookup("BEACH_CALL_MAX_RECONNECTS")
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.max_reconnect_attempts),
            grace_window: secs("BEACH_CALL_GRACE_SECS", defaults.grace_window),
            waiting_tick: defaults.waiting_tick,
        };

        Self {
            relay_url: lookup("BEACH_CALL_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.into()),
            api_url: lookup("BEACH_CALL_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into()),
            token: lookup("BEACH_CALL_TOKEN").filter(|value| !value.is_empty()),
            participant_id: lookup("BEACH_CALL_PARTICIPANT").filter(|value| !value.is_empty()),
            device_class: lookup("BEACH_CALL_DEVICE_CLASS")
                .and_then(|val| val.parse().ok())
                .unwrap_or_default(),
            timings,
        }
    }
}
