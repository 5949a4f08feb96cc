//! Peercall Relay
//!
//! Room-scoped publish/subscribe over WebSocket. Carries the signaling
//! messages two call clients exchange while negotiating a direct connection.

pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod ws;
