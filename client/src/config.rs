//! Call Configuration
//!
//! Loads client configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::rtc::IceServerConfig;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// WebRTC STUN server
    pub stun_server: String,

    /// WebRTC TURN server (optional)
    pub turn_server: Option<String>,

    /// WebRTC TURN username (optional)
    pub turn_username: Option<String>,

    /// WebRTC TURN credential (optional)
    pub turn_credential: Option<String>,

    /// Try camera+microphone before microphone-only (default: true)
    pub prefer_video: bool,

    /// Give up on a call that has not connected in time (default: never)
    pub negotiation_timeout: Option<Duration>,

    /// Interval between duration ticks (default: 1s)
    pub duration_tick: Duration,

    /// How often the initiator republishes its offer until answered (default: 1s)
    pub offer_resend_interval: Duration,

    /// Relay URL for WebSocket signaling
    pub signaling_url: String,

    /// Capacity of the call event broadcast channel
    pub event_buffer: usize,
}

impl CallConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let negotiation_timeout = match env::var("CALL_NEGOTIATION_TIMEOUT_SECS") {
            Ok(v) => Some(Duration::from_secs(
                v.parse()
                    .context("CALL_NEGOTIATION_TIMEOUT_SECS must be a whole number of seconds")?,
            )),
            Err(_) => None,
        };

        Ok(Self {
            stun_server: env::var("STUN_SERVER")
                .unwrap_or_else(|_| "stun:stun.l.google.com:19302".into()),
            turn_server: env::var("TURN_SERVER").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_credential: env::var("TURN_CREDENTIAL").ok(),
            prefer_video: env::var("CALL_PREFER_VIDEO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            negotiation_timeout,
            duration_tick: Duration::from_millis(
                env::var("CALL_DURATION_TICK_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|ms| *ms > 0)
                    .unwrap_or(1000),
            ),
            offer_resend_interval: Duration::from_millis(
                env::var("CALL_OFFER_RESEND_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|ms| *ms > 0)
                    .unwrap_or(1000),
            ),
            signaling_url: env::var("SIGNALING_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8090".into()),
            event_buffer: env::var("CALL_EVENT_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(64),
        })
    }

    /// Check if TURN is configured.
    #[must_use]
    pub const fn has_turn(&self) -> bool {
        self.turn_server.is_some()
    }

    /// ICE servers handed to the peer connection.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = vec![IceServerConfig {
            urls: vec![self.stun_server.clone()],
            username: None,
            credential: None,
        }];
        if let Some(turn) = &self.turn_server {
            servers.push(IceServerConfig {
                urls: vec![turn.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }

    /// Replace values the runtime cannot work with by their defaults.
    ///
    /// A zero channel capacity or a zero interval would panic inside tokio.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.event_buffer == 0 {
            self.event_buffer = defaults.event_buffer;
        }
        if self.duration_tick.is_zero() {
            self.duration_tick = defaults.duration_tick;
        }
        if self.offer_resend_interval.is_zero() {
            self.offer_resend_interval = defaults.offer_resend_interval;
        }
        self
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            duration_tick: Duration::from_millis(50),
            offer_resend_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_server: "stun:stun.l.google.com:19302".into(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            prefer_video: true,
            negotiation_timeout: None,
            duration_tick: Duration::from_secs(1),
            offer_resend_interval: Duration::from_secs(1),
            signaling_url: "ws://127.0.0.1:8090".into(),
            event_buffer: 64,
        }
    }
}
