//! Append-only release history.

use std::sync::Arc;

use chrono::Utc;
use stevedore_id::{AppId, BuildId, ConfigId, ReleaseId, ReleaseVersion};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::models::{Release, ResolvedRelease};
use crate::store::Store;

/// Content of a release before it gets a version.
#[derive(Debug, Clone)]
pub struct ReleaseDraft {
    pub build: Option<BuildId>,
    pub config: ConfigId,
    pub summary: String,
    pub owner: String,
}

/// Per-app ordered history of immutable releases.
///
/// Versions are assigned here, one past the app's latest release, so the
/// sequence never has gaps. Nothing is ever updated or removed.
#[derive(Clone)]
pub struct ReleaseStore {
    store: Arc<dyn Store>,
}

impl ReleaseStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Appends a release and points the app at it.
    pub async fn append(&self, app: &AppId, draft: ReleaseDraft) -> CoreResult<Release> {
        let version = match self.latest(app).await {
            Ok(latest) => latest.version.next(),
            Err(CoreError::NotFound { .. }) => ReleaseVersion::FIRST,
            Err(err) => return Err(err),
        };

        let release = Release {
            id: ReleaseId::new(),
            app: app.clone(),
            version,
            build: draft.build,
            config: draft.config,
            summary: draft.summary,
            owner: draft.owner,
            created_at: Utc::now(),
        };
        self.store.insert_release(release.clone()).await?;

        let mut record = self.store.get_app(app).await?;
        record.latest_version = version;
        record.updated_at = release.created_at;
        self.store.update_app(record).await?;

        info!(
            app = %app,
            version = %version,
            release_id = %release.id,
            summary = %release.summary,
            "Release appended"
        );
        Ok(release)
    }

    pub async fn latest(&self, app: &AppId) -> CoreResult<Release> {
        self.store
            .list_releases(app)
            .await?
            .pop()
            .ok_or_else(|| CoreError::not_found("release", format!("{app} latest")))
    }

    pub async fn get(&self, app: &AppId, version: ReleaseVersion) -> CoreResult<Release> {
        Ok(self.store.get_release(app, version).await?)
    }

    /// All releases of an app, oldest first.
    pub async fn history(&self, app: &AppId) -> CoreResult<Vec<Release>> {
        Ok(self.store.list_releases(app).await?)
    }

    /// Loads a release with its build and config.
    pub async fn resolve(&self, app: &AppId, version: ReleaseVersion) -> CoreResult<ResolvedRelease> {
        let release = self.get(app, version).await?;
        let build = match release.build {
            Some(id) => Some(self.store.get_build(app, id).await?),
            None => None,
        };
        let config = self.store.get_config(app, release.config).await?;
        Ok(ResolvedRelease {
            release,
            build,
            config,
        })
    }
}
