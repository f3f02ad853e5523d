//! Scheduler backend interface.
//!
//! A scheduler performs the four primitive operations on one backend unit
//! at a time. It keeps no container state of its own that the engine relies
//! on: the container records are the source of truth and are updated from
//! each call's result.
//!
//! Two implementations are provided:
//! - [`MockScheduler`]: in-process, always succeeds unless told otherwise
//! - [`ChaosScheduler`]: wraps another scheduler and fails calls at random

pub mod chaos;
pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use stevedore_id::{AppId, ReleaseVersion};
use stevedore_reconcile::OperationKind;

use crate::container::Container;
use crate::models::{MemoryLimit, ResolvedRelease};

pub use chaos::{ChaosConfigError, ChaosRates, ChaosScheduler};
pub use mock::MockScheduler;

/// Everything the backend needs to run one container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerUnit {
    /// Backend address, `{app}_v{version}.{type}.{index}`.
    pub name: String,
    pub app: AppId,
    pub process_type: String,
    pub index: u32,
    pub release: ReleaseVersion,
    pub image: String,

    /// Procfile command; `None` runs the image's default command.
    pub command: Option<String>,
    pub env: BTreeMap<String, String>,
    pub memory: Option<MemoryLimit>,
    pub cpu_shares: Option<u32>,
    pub tags: BTreeMap<String, String>,
}

impl ContainerUnit {
    pub fn unit_name(
        app: &AppId,
        release: ReleaseVersion,
        process_type: &str,
        index: u32,
    ) -> String {
        format!("{app}_{release}.{process_type}.{index}")
    }

    /// Builds the unit for `container` from the release it points at.
    pub fn for_container(container: &Container, release: &ResolvedRelease) -> Self {
        let process_type = container.process_type();
        let build = release.build.as_ref();
        let config = &release.config;

        Self {
            name: container.unit_name(),
            app: container.app().clone(),
            process_type: process_type.to_string(),
            index: container.index(),
            release: container.release(),
            image: build.map(|b| b.image.clone()).unwrap_or_default(),
            command: build
                .and_then(|b| b.command_for(process_type))
                .map(str::to_string),
            env: config.values.clone(),
            memory: config.memory.get(process_type).copied(),
            cpu_shares: config.cpu.get(process_type).copied(),
            tags: config.tags.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn bare(container: &Container, image: &str) -> Self {
        Self {
            name: container.unit_name(),
            app: container.app().clone(),
            process_type: container.process_type().to_string(),
            index: container.index(),
            release: container.release(),
            image: image.to_string(),
            command: None,
            env: BTreeMap::new(),
            memory: None,
            cpu_shares: None,
            tags: BTreeMap::new(),
        }
    }
}

/// A backend call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} {unit} failed: {message}")]
pub struct SchedulerError {
    pub operation: OperationKind,
    pub unit: String,
    pub message: String,
}

impl SchedulerError {
    pub fn new(operation: OperationKind, unit: &ContainerUnit, message: impl Into<String>) -> Self {
        Self {
            operation,
            unit: unit.name.clone(),
            message: message.into(),
        }
    }
}

/// Compute backend interface.
///
/// Every call addresses a single unit and is independent of any other call.
/// Implementations must not retry internally; retrying is up to the caller.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create the unit without starting it.
    async fn create(&self, unit: &ContainerUnit) -> Result<(), SchedulerError>;

    /// Start a created unit.
    async fn start(&self, unit: &ContainerUnit) -> Result<(), SchedulerError>;

    /// Stop a running unit, keeping it created.
    async fn stop(&self, unit: &ContainerUnit) -> Result<(), SchedulerError>;

    /// Remove the unit from the backend.
    async fn destroy(&self, unit: &ContainerUnit) -> Result<(), SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppConfig, ConfigPatch, NewBuild, Release};
    use chrono::Utc;
    use stevedore_id::ReleaseId;

    #[test]
    fn test_unit_carries_release_content() {
        let app = AppId::parse("demo").unwrap();
        let build = NewBuild::new("alice", "demo:v2")
            .with_procfile([("web", "node server.js")])
            .into_build(&app);
        let (config, _) = AppConfig::empty(&app, "alice")
            .apply(
                &ConfigPatch::new("alice")
                    .set("PORT", "5000")
                    .memory("web", Some("256M"))
                    .cpu("web", Some("100"))
                    .tag("environ", Some("dev")),
            )
            .unwrap();
        let version = ReleaseVersion::new(3).unwrap();
        let release = ResolvedRelease {
            release: Release {
                id: ReleaseId::new(),
                app: app.clone(),
                version,
                build: Some(build.id),
                config: config.id,
                summary: String::new(),
                owner: "alice".to_string(),
                created_at: Utc::now(),
            },
            build: Some(build),
            config,
        };
        let container = Container::new(app, "web", 2, version);

        let unit = ContainerUnit::for_container(&container, &release);
        assert_eq!(unit.name, "demo_v3.web.2");
        assert_eq!(unit.image, "demo:v2");
        assert_eq!(unit.command.as_deref(), Some("node server.js"));
        assert_eq!(unit.env["PORT"], "5000");
        assert_eq!(unit.memory.map(|m| m.to_string()).as_deref(), Some("256M"));
        assert_eq!(unit.cpu_shares, Some(100));
        assert_eq!(unit.tags["environ"], "dev");
    }
}
