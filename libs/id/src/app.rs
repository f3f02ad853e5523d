//! User-facing application identifiers.

use rand::seq::IndexedRandom;
use rand::Rng;

use crate::IdError;

/// App IDs that can never be registered.
pub const RESERVED_APP_IDS: &[&str] = &["deis"];

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "bold", "brisk", "calm", "crisp", "dapper", "eager", "fancy", "frosty",
    "gentle", "golden", "hollow", "humble", "icy", "jolly", "keen", "lively", "lucky", "mellow",
    "misty", "nimble", "quiet", "rapid", "rustic", "sandy", "silent", "sturdy", "sunny", "tidy",
    "vivid", "windy",
];

const NOUNS: &[&str] = &[
    "anchor", "badger", "beacon", "buoy", "canal", "cargo", "cutter", "dinghy", "ferry", "harbor",
    "hull", "jetty", "keel", "lantern", "lighthouse", "mast", "mooring", "oar", "pier", "quay",
    "rudder", "sail", "schooner", "skiff", "tide", "tugboat", "wharf", "yawl",
];

/// An application identifier: lowercase ASCII letters, digits and hyphens.
///
/// Unlike record IDs these are chosen by users (or generated as a readable
/// `adjective-noun` pair) and are used to address the app's containers on
/// the scheduler backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppId(String);

impl AppId {
    /// Validates and wraps a caller-supplied app ID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(IdError::InvalidFormat {
                message: "app IDs can only contain [a-z0-9-]".to_string(),
            });
        }

        if RESERVED_APP_IDS.contains(&s) {
            return Err(IdError::Reserved(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Generates a random `adjective-noun` app ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// Generates a random `adjective-noun` app ID from the given RNG.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("brisk");
        let noun = NOUNS.choose(rng).copied().unwrap_or("skiff");
        Self(format!("{adjective}-{noun}"))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for AppId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for AppId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for AppId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for AppId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
