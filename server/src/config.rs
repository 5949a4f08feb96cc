//! Relay Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{Context, Result};
use std::env;

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8090")
    pub bind_address: String,

    /// Maximum connections per room (default: 4)
    pub max_room_members: usize,

    /// Frames queued per connection before it is considered stalled (default: 100)
    pub outbound_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let max_room_members = match env::var("RELAY_MAX_ROOM_MEMBERS") {
            Ok(v) => v
                .parse()
                .context("RELAY_MAX_ROOM_MEMBERS must be a positive integer")?,
            Err(_) => 4,
        };
        anyhow::ensure!(max_room_members >= 2, "RELAY_MAX_ROOM_MEMBERS must be at least 2");

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8090".into()),
            max_room_members,
            outbound_buffer: env::var("RELAY_OUTBOUND_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(100),
        })
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            max_room_members: 4,
            outbound_buffer: 100,
        }
    }
}
