//! Peercall Client Library
//!
//! Peer-to-peer audio/video call session manager: acquires local media,
//! negotiates a direct connection with one remote party over a room-scoped
//! signaling channel, and tears every resource down on any exit path.
//!
//! [`CallController`] is the entry point.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use config::CallConfig;
pub use error::{AcquisitionError, CallError, NegotiationError, SignalingError};
pub use events::{CallEvent, TrackInfo};
pub use negotiation::{is_initiator, CallState, Role};
pub use session::{CallController, CallSession};
