//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so persisted records stay
//! readable by other tools.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

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

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Identifier (name or id) of a container in the environment runtime.
    EnvironmentId
);

string_newtype!(
    /// Self-describing snapshot digest, e.g. `sha256:9f86d0…`.
    Checksum
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_id_display_and_as_ref() {
        let id = EnvironmentId::new("devbox-web");
        assert_eq!(id.to_string(), "devbox-web");
        assert_eq!(id.as_str(), "devbox-web");
        assert_eq!(AsRef::<str>::as_ref(&id), "devbox-web");
    }

    #[test]
    fn checksum_serializes_as_plain_string() {
        let c = Checksum::new("sha256:abc");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"sha256:abc\"");
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn compares_against_str() {
        let c = Checksum::from("sha256:00");
        assert_eq!(c, "sha256:00");
        assert!(c.starts_with("sha256:"));
    }
}
