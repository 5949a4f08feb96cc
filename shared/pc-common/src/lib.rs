//! Peercall Common Library
//!
//! Wire types shared by the call client and the signaling relay.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use protocol::{
    IceCandidate, RelayClientFrame, RelayServerFrame, SdpType, SessionDescription,
    SignalingMessage,
};
pub use types::*;
