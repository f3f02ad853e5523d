//! Persistence interface for apps, builds, configs, releases and containers.
//!
//! The store is the source of truth for container state: every scheduler
//! result is written here before the next call is made.

pub mod memory;

use async_trait::async_trait;
use stevedore_id::{AppId, BuildId, ConfigId, ReleaseVersion};

use crate::container::Container;
use crate::models::{App, AppConfig, Build, Release};

pub use memory::MemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn conflict(kind: &'static str, id: impl ToString) -> Self {
        Self::Conflict {
            kind,
            id: id.to_string(),
        }
    }
}

/// Transactional CRUD over the engine's records.
///
/// Uniqueness rules:
/// - app IDs are unique
/// - release versions per app are unique and appended in order (`latest + 1`)
/// - containers are keyed by `(app, process type, index)`
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Conflict` if the ID is taken.
    async fn insert_app(&self, app: App) -> StoreResult<()>;
    async fn get_app(&self, id: &AppId) -> StoreResult<App>;
    async fn list_apps(&self) -> StoreResult<Vec<App>>;
    async fn update_app(&self, app: App) -> StoreResult<()>;

    /// Removes the app with all of its builds, configs, releases and
    /// container records, retiring ones included.
    async fn delete_app(&self, id: &AppId) -> StoreResult<()>;

    async fn insert_build(&self, build: Build) -> StoreResult<()>;
    async fn get_build(&self, app: &AppId, id: BuildId) -> StoreResult<Build>;

    /// Builds of an app, oldest first.
    async fn list_builds(&self, app: &AppId) -> StoreResult<Vec<Build>>;

    async fn insert_config(&self, config: AppConfig) -> StoreResult<()>;
    async fn get_config(&self, app: &AppId, id: ConfigId) -> StoreResult<AppConfig>;

    /// Fails with `Conflict` unless the version directly follows the app's
    /// latest release.
    async fn insert_release(&self, release: Release) -> StoreResult<()>;
    async fn get_release(&self, app: &AppId, version: ReleaseVersion) -> StoreResult<Release>;

    /// Releases of an app in ascending version order.
    async fn list_releases(&self, app: &AppId) -> StoreResult<Vec<Release>>;

    /// Inserts or replaces the record at the container's `(app, type, index)`.
    async fn put_container(&self, container: Container) -> StoreResult<()>;
    async fn remove_container(
        &self,
        app: &AppId,
        process_type: &str,
        index: u32,
    ) -> StoreResult<()>;

    /// Containers of an app ordered by process type, then index.
    async fn list_containers(&self, app: &AppId) -> StoreResult<Vec<Container>>;

    /// Inserts or replaces a container that was superseded by a migration
    /// but whose unit is not destroyed yet. Keyed by `(app, unit name)`.
    async fn put_retiring(&self, container: Container) -> StoreResult<()>;
    async fn remove_retiring(&self, app: &AppId, unit: &str) -> StoreResult<()>;

    /// Retiring containers of an app ordered by unit name.
    async fn list_retiring(&self, app: &AppId) -> StoreResult<Vec<Container>>;
}
