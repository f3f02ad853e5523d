//! Record IDs and the release version sequence.

use crate::define_id;
use crate::IdError;

define_id!(
    /// Identifies an immutable build (image plus optional procfile).
    BuildId,
    "bld"
);
define_id!(
    /// Identifies an immutable config snapshot.
    ConfigId,
    "cfg"
);
define_id!(
    /// Identifies an immutable release record.
    ReleaseId,
    "rel"
);
define_id!(
    /// Identifies a single container record.
    ContainerId,
    "ctr"
);

// =============================================================================
// Release Version
// =============================================================================

/// Per-app release version number.
///
/// Versions form a gap-free sequence starting at 1; the first release is
/// created together with the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseVersion(u32);

impl ReleaseVersion {
    /// Version of the release created along with the app.
    pub const FIRST: Self = Self(1);

    /// Creates a version, rejecting zero.
    pub fn new(version: u32) -> Result<Self, IdError> {
        if version == 0 {
            return Err(IdError::InvalidVersion(version));
        }
        Ok(Self(version))
    }

    /// Returns the raw version number.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns the version that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the preceding version, or `None` for `v1`.
    #[must_use]
    pub const fn previous(&self) -> Option<Self> {
        if self.0 > 1 {
            Some(Self(self.0 - 1))
        } else {
            None
        }
    }
}

impl Default for ReleaseVersion {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl std::str::FromStr for ReleaseVersion {
    type Err = IdError;

    /// Accepts both `3` and `v3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('v').unwrap_or(s);
        let value = digits.parse::<u32>().map_err(|_| IdError::InvalidFormat {
            message: format!("not a release version: '{s}'"),
        })?;
        Self::new(value)
    }
}

impl serde::Serialize for ReleaseVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ReleaseVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = u32::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}
