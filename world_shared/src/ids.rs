//! Entity and client identifiers.
//!
//! Ids are fixed-length 22-byte strings derived from UUIDv4 (128 bits in
//! base64url without padding). Equality, hashing and lexicographic ordering
//! are load-bearing: ids key maps everywhere and the ordering is reused for
//! wire encoding and consistent hashing.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Length of every id on the wire and in memory.
pub const ID_LENGTH: usize = 22;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; ID_LENGTH]);

        impl $name {
            /// Generates a fresh unique id.
            pub fn new_unique() -> Self {
                let encoded = URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes());
                debug_assert_eq!(encoded.len(), ID_LENGTH);
                let mut raw = [0u8; ID_LENGTH];
                raw.copy_from_slice(encoded.as_bytes());
                Self(raw)
            }

            /// Raw wire form.
            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }

            /// Reconstructs an id from its raw wire form.
            pub fn from_bytes(raw: [u8; ID_LENGTH]) -> Self {
                Self(raw)
            }

            pub fn as_str(&self) -> &str {
                // Always base64url, so always valid UTF-8.
                std::str::from_utf8(&self.0).unwrap_or("")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != ID_LENGTH {
                    anyhow::bail!(
                        "bad {} length {}, want {}",
                        stringify!($name),
                        s.len(),
                        ID_LENGTH
                    );
                }
                let mut raw = [0u8; ID_LENGTH];
                raw.copy_from_slice(s.as_bytes());
                Ok(Self(raw))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

define_id! {
    /// Identifies one entity across all processes.
    EntityId
}

define_id! {
    /// Identifies one client connection, assigned by its gate.
    ClientId
}
