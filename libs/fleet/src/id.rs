//! Broker-assigned identifiers.
//!
//! Machine and session names are opaque strings owned by the broker. They
//! are stable for the lifetime of a run and compared byte-for-byte.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::IdError;

macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parses a name, rejecting empty input and control characters.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(IdError::Empty);
                }
                if trimmed.chars().any(char::is_control) {
                    return Err(IdError::ControlCharacter(trimmed.to_string()));
                }
                Ok(Self(trimmed.to_string()))
            }

            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
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
    };
}

define_name!(
    /// Identifier of a session-hosting machine, e.g. `CORP\\VDA-042`.
    MachineId
);

define_name!(
    /// Identifier of a user session on a machine.
    SessionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_whitespace() {
        let id = MachineId::parse("  CORP\\VDA-01 ").unwrap();
        assert_eq!(id.as_str(), "CORP\\VDA-01");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(MachineId::parse("   "), Err(IdError::Empty));
        assert_eq!(SessionId::parse(""), Err(IdError::Empty));
    }

    #[test]
    fn test_parse_rejects_control_characters() {
        let err = MachineId::parse("vda\n01").unwrap_err();
        assert!(matches!(err, IdError::ControlCharacter(_)));
    }

    #[test]
    fn test_serde_validates() {
        let id: MachineId = serde_json::from_str("\"vda-01\"").unwrap();
        assert_eq!(id.to_string(), "vda-01");

        let bad: Result<MachineId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }
}
