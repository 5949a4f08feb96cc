//! Identifier Types
//!
//! Users and rooms are identified by opaque strings supplied by the
//! surrounding application. Ordering is plain lexicographic byte order,
//! which the call client relies on to pick the offering side.

use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{Error, Result};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(SmolStr);

        impl $name {
            /// Wrap an identifier without validation.
            pub fn new(id: impl Into<SmolStr>) -> Self {
                Self(id.into())
            }

            /// Wrap an identifier, rejecting empty or blank strings.
            pub fn parse(id: &str) -> Result<Self> {
                if id.trim().is_empty() {
                    return Err(Error::InvalidId(id.to_string()));
                }
                Ok(Self(SmolStr::new(id)))
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.0.as_str())
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self::new(id)
            }
        }
    };
}

opaque_id!(
    /// Stable opaque user identity from the identity provider.
    UserId
);

opaque_id!(
    /// Call room shared by both parties of a call.
    RoomId
);
