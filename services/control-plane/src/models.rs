//! Apps, builds, configs and releases.
//!
//! Builds, configs and releases are immutable once stored: a change always
//! produces a new record with a fresh ID.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_id::{AppId, BuildId, ConfigId, ReleaseId, ReleaseVersion};

use crate::validation::{
    parse_cpu_shares, parse_memory_limit, validate_config_key, validate_image, validate_procfile,
    validate_process_type, validate_tag, ValidationError,
};

/// Process type used when a build carries no procfile.
pub const DEFAULT_PROCESS_TYPE: &str = "cmd";

// =============================================================================
// App
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct App {
    pub id: AppId,
    pub owner: String,

    /// Counts from the last scale request that converged, per process type.
    pub structure: BTreeMap<String, u32>,

    /// Version of the app's current release.
    pub latest_version: ReleaseVersion,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    pub fn new(id: AppId, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner: owner.into(),
            structure: BTreeMap::new(),
            latest_version: ReleaseVersion::FIRST,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Build
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Build {
    pub id: BuildId,
    pub app: AppId,
    pub owner: String,
    pub image: String,
    pub sha: Option<String>,
    pub dockerfile: Option<String>,
    pub procfile: Option<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

impl Build {
    /// Process types this build can run. Without a procfile only
    /// [`DEFAULT_PROCESS_TYPE`] is available.
    pub fn process_types(&self) -> BTreeSet<String> {
        match &self.procfile {
            Some(procfile) if !procfile.is_empty() => procfile.keys().cloned().collect(),
            _ => BTreeSet::from([DEFAULT_PROCESS_TYPE.to_string()]),
        }
    }

    /// Command the procfile assigns to a process type, if any.
    pub fn command_for(&self, process_type: &str) -> Option<&str> {
        self.procfile
            .as_ref()
            .and_then(|procfile| procfile.get(process_type))
            .map(String::as_str)
    }
}

/// Input for a build push.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewBuild {
    pub owner: String,
    pub image: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub procfile: Option<BTreeMap<String, String>>,
}

impl NewBuild {
    pub fn new(owner: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_procfile<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.procfile = Some(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_image(&self.image)?;
        if let Some(procfile) = &self.procfile {
            validate_procfile(procfile)?;
        }
        Ok(())
    }

    pub(crate) fn into_build(self, app: &AppId) -> Build {
        Build {
            id: BuildId::new(),
            app: app.clone(),
            owner: self.owner,
            image: self.image,
            sha: self.sha,
            dockerfile: self.dockerfile,
            procfile: self.procfile,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Memory limits
// =============================================================================

/// Unit suffix of a [`MemoryLimit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUnit {
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
}

impl MemoryUnit {
    fn from_suffix(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'B' => Some(Self::Bytes),
            'K' => Some(Self::Kilobytes),
            'M' => Some(Self::Megabytes),
            'G' => Some(Self::Gigabytes),
            _ => None,
        }
    }

    fn suffix(&self) -> char {
        match self {
            Self::Bytes => 'B',
            Self::Kilobytes => 'K',
            Self::Megabytes => 'M',
            Self::Gigabytes => 'G',
        }
    }

    fn multiplier(&self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kilobytes => 1 << 10,
            Self::Megabytes => 1 << 20,
            Self::Gigabytes => 1 << 30,
        }
    }
}

/// A memory limit written as `<number><unit>`, e.g. `512M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit {
    amount: u64,
    unit: MemoryUnit,
}

impl MemoryLimit {
    /// Parses `<digits><B|K|M|G>`, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let suffix = s.chars().last()?;
        let unit = MemoryUnit::from_suffix(suffix)?;
        let digits = &s[..s.len() - suffix.len_utf8()];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let amount = digits.parse().ok()?;
        Some(Self { amount, unit })
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn unit(&self) -> MemoryUnit {
        self.unit
    }

    /// The limit in bytes, or `None` on overflow.
    pub fn bytes(&self) -> Option<u64> {
        self.amount.checked_mul(self.unit.multiplier())
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

impl Serialize for MemoryLimit {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppConfig {
    pub id: ConfigId,
    pub app: AppId,
    pub owner: String,
    pub values: BTreeMap<String, String>,
    pub memory: BTreeMap<String, MemoryLimit>,
    pub cpu: BTreeMap<String, u32>,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A partial config update. A `None` value removes the key; keys the patch
/// does not mention are carried over unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub owner: String,
    pub values: BTreeMap<String, Option<String>>,
    pub memory: BTreeMap<String, Option<String>>,
    pub cpu: BTreeMap<String, Option<String>>,
    pub tags: BTreeMap<String, Option<String>>,
}

impl ConfigPatch {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), Some(value.into()));
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.values.insert(key.into(), None);
        self
    }

    pub fn memory(mut self, process_type: impl Into<String>, limit: Option<&str>) -> Self {
        self.memory
            .insert(process_type.into(), limit.map(str::to_string));
        self
    }

    pub fn cpu(mut self, process_type: impl Into<String>, shares: Option<&str>) -> Self {
        self.cpu
            .insert(process_type.into(), shares.map(str::to_string));
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.tags.insert(key.into(), value.map(str::to_string));
        self
    }
}

/// Keys touched by an applied [`ConfigPatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,

    /// Process types whose memory or CPU limit changed.
    pub limits: BTreeSet<String>,

    pub tags: bool,
}

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.limits.is_empty()
            && !self.tags
    }
}

enum EntryChange {
    Added,
    Changed,
    Removed,
}

fn merge_entry<V: PartialEq>(
    map: &mut BTreeMap<String, V>,
    key: &str,
    value: Option<V>,
) -> Option<EntryChange> {
    match value {
        Some(value) => match map.insert(key.to_string(), value) {
            None => Some(EntryChange::Added),
            Some(previous) if map.get(key) != Some(&previous) => Some(EntryChange::Changed),
            Some(_) => None,
        },
        None => map.remove(key).map(|_| EntryChange::Removed),
    }
}

impl AppConfig {
    /// The config every app starts with.
    pub fn empty(app: &AppId, owner: impl Into<String>) -> Self {
        Self {
            id: ConfigId::new(),
            app: app.clone(),
            owner: owner.into(),
            values: BTreeMap::new(),
            memory: BTreeMap::new(),
            cpu: BTreeMap::new(),
            tags: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Validates `patch` in full, then merges it into a copy of this config.
    pub fn apply(&self, patch: &ConfigPatch) -> Result<(AppConfig, ConfigChanges), ValidationError> {
        for key in patch.values.keys() {
            validate_config_key(key)?;
        }
        let memory = patch
            .memory
            .iter()
            .map(|(process_type, value)| -> Result<_, ValidationError> {
                validate_process_type(process_type)?;
                let limit = value
                    .as_deref()
                    .map(|v| parse_memory_limit(process_type, v))
                    .transpose()?;
                Ok((process_type.as_str(), limit))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cpu = patch
            .cpu
            .iter()
            .map(|(process_type, value)| -> Result<_, ValidationError> {
                validate_process_type(process_type)?;
                let shares = value
                    .as_deref()
                    .map(|v| parse_cpu_shares(process_type, v))
                    .transpose()?;
                Ok((process_type.as_str(), shares))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (key, value) in &patch.tags {
            if let Some(value) = value {
                validate_tag(key, value)?;
            }
        }

        let mut next = Self {
            id: ConfigId::new(),
            owner: patch.owner.clone(),
            created_at: Utc::now(),
            ..self.clone()
        };
        let mut changes = ConfigChanges::default();

        for (key, value) in &patch.values {
            match merge_entry(&mut next.values, key, value.clone()) {
                Some(EntryChange::Added) => changes.added.push(key.clone()),
                Some(EntryChange::Changed) => changes.changed.push(key.clone()),
                Some(EntryChange::Removed) => changes.removed.push(key.clone()),
                None => {}
            }
        }
        for (process_type, limit) in memory {
            if merge_entry(&mut next.memory, process_type, limit).is_some() {
                changes.limits.insert(process_type.to_string());
            }
        }
        for (process_type, shares) in cpu {
            if merge_entry(&mut next.cpu, process_type, shares).is_some() {
                changes.limits.insert(process_type.to_string());
            }
        }
        for (key, value) in &patch.tags {
            if merge_entry(&mut next.tags, key, value.clone()).is_some() {
                changes.tags = true;
            }
        }

        if changes.is_empty() {
            return Err(ValidationError::EmptyConfigChange);
        }
        Ok((next, changes))
    }
}

// =============================================================================
// Release
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Release {
    pub id: ReleaseId,
    pub app: AppId,
    pub version: ReleaseVersion,
    pub build: Option<BuildId>,
    pub config: ConfigId,
    pub summary: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

/// A release together with the build and config it references.
#[derive(Debug, Clone)]
pub struct ResolvedRelease {
    pub release: Release,
    pub build: Option<Build>,
    pub config: AppConfig,
}

impl ResolvedRelease {
    pub fn version(&self) -> ReleaseVersion {
        self.release.version
    }

    /// Process types runnable under this release; empty without a build.
    pub fn process_types(&self) -> BTreeSet<String> {
        self.build
            .as_ref()
            .map(Build::process_types)
            .unwrap_or_default()
    }
}
