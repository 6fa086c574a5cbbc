//! Identifier, action and attempt key handling.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BulwarkError, Result};

/// The subject being throttled (an email, IP address or account id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

/// The operation class being throttled (e.g. `login`, `password_reset`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Action(String);

macro_rules! non_empty_string {
    ($name:ident, $label:literal) => {
        impl $name {
            /// Create a new value, rejecting empty strings.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                if value.is_empty() {
                    return Err(BulwarkError::InvalidInput(format!(
                        "{} must not be empty",
                        $label
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = BulwarkError;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = BulwarkError;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

non_empty_string!(Identifier, "identifier");
non_empty_string!(Action, "action");

/// A key that uniquely identifies an attempt stream.
///
/// Attempts for the same identifier under different actions are tracked
/// independently, so both halves take part in equality and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    /// Who is being throttled
    pub identifier: Identifier,
    /// What they are attempting
    pub action: Action,
}

impl AttemptKey {
    /// Build a key from already validated parts.
    pub fn new(identifier: Identifier, action: Action) -> Self {
        Self { identifier, action }
    }

    /// Build a key from raw strings, validating both parts.
    pub fn parse(identifier: &str, action: &str) -> Result<Self> {
        Ok(Self {
            identifier: Identifier::new(identifier)?,
            action: Action::new(action)?,
        })
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action, self.identifier)
    }
}
