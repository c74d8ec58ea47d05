//! Identifier types for containers.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Numeric container identifier, unique per host. Zero is reserved for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(u32);

impl ContainerId {
    pub fn new(id: u32) -> Result<Self, ConfigError> {
        if id == 0 {
            return Err(ConfigError::invalid("CTID", "id 0 is reserved for the host"));
        }
        Ok(Self(id))
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u32 = s
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid("CTID", format!("'{s}' is not a container id")))?;
        Self::new(id)
    }
}

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype!(
    /// Human-readable container alias. Names are a side index onto ids.
    ContainerName
);

impl ContainerName {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        if name.is_empty() || name.len() > 64 {
            return Err(ConfigError::invalid(
                "NAME",
                "container name must be 1-64 characters",
            ));
        }
        if name.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::invalid(
                "NAME",
                "container name must not be purely numeric",
            ));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
        {
            return Err(ConfigError::invalid(
                "NAME",
                "container name must match [a-zA-Z0-9_.-]",
            ));
        }
        Ok(Self(name.to_owned()))
    }
}
