//! In-memory store implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use stevedore_id::{AppId, BuildId, ConfigId, ReleaseVersion};
use tokio::sync::RwLock;

use super::{Store, StoreError, StoreResult};
use crate::container::Container;
use crate::models::{App, AppConfig, Build, Release};

type ContainerKey = (AppId, String, u32);

#[derive(Default)]
struct MemoryState {
    apps: BTreeMap<AppId, App>,
    builds: BTreeMap<BuildId, Build>,
    configs: BTreeMap<ConfigId, AppConfig>,
    releases: BTreeMap<(AppId, ReleaseVersion), Release>,
    containers: BTreeMap<ContainerKey, Container>,
    retiring: BTreeMap<(AppId, String), Container>,
}

impl MemoryState {
    fn require_app(&self, id: &AppId) -> StoreResult<()> {
        if self.apps.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::not_found("app", id))
        }
    }

    fn latest_version(&self, app: &AppId) -> Option<ReleaseVersion> {
        self.releases
            .range((app.clone(), ReleaseVersion::FIRST)..)
            .take_while(|((owner, _), _)| owner == app)
            .map(|((_, version), _)| *version)
            .last()
    }
}

/// Store backed by ordered maps behind a single lock.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_app(&self, app: App) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.apps.contains_key(&app.id) {
            return Err(StoreError::conflict("app", &app.id));
        }
        state.apps.insert(app.id.clone(), app);
        Ok(())
    }

    async fn get_app(&self, id: &AppId) -> StoreResult<App> {
        let state = self.state.read().await;
        state
            .apps
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("app", id))
    }

    async fn list_apps(&self) -> StoreResult<Vec<App>> {
        Ok(self.state.read().await.apps.values().cloned().collect())
    }

    async fn update_app(&self, app: App) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.apps.get_mut(&app.id) {
            Some(slot) => {
                *slot = app;
                Ok(())
            }
            None => Err(StoreError::not_found("app", &app.id)),
        }
    }

    async fn delete_app(&self, id: &AppId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.apps.remove(id).is_none() {
            return Err(StoreError::not_found("app", id));
        }
        state.builds.retain(|_, build| &build.app != id);
        state.configs.retain(|_, config| &config.app != id);
        state.releases.retain(|(app, _), _| app != id);
        state.containers.retain(|(app, _, _), _| app != id);
        state.retiring.retain(|(app, _), _| app != id);
        Ok(())
    }

    async fn insert_build(&self, build: Build) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.require_app(&build.app)?;
        if state.builds.contains_key(&build.id) {
            return Err(StoreError::conflict("build", build.id));
        }
        state.builds.insert(build.id, build);
        Ok(())
    }

    async fn get_build(&self, app: &AppId, id: BuildId) -> StoreResult<Build> {
        let state = self.state.read().await;
        state
            .builds
            .get(&id)
            .filter(|build| &build.app == app)
            .cloned()
            .ok_or_else(|| StoreError::not_found("build", id))
    }

    async fn list_builds(&self, app: &AppId) -> StoreResult<Vec<Build>> {
        let state = self.state.read().await;
        state.require_app(app)?;
        let mut builds: Vec<Build> = state
            .builds
            .values()
            .filter(|build| &build.app == app)
            .cloned()
            .collect();
        builds.sort_by_key(|build| (build.created_at, build.id));
        Ok(builds)
    }

    async fn insert_config(&self, config: AppConfig) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.require_app(&config.app)?;
        if state.configs.contains_key(&config.id) {
            return Err(StoreError::conflict("config", config.id));
        }
        state.configs.insert(config.id, config);
        Ok(())
    }

    async fn get_config(&self, app: &AppId, id: ConfigId) -> StoreResult<AppConfig> {
        let state = self.state.read().await;
        state
            .configs
            .get(&id)
            .filter(|config| &config.app == app)
            .cloned()
            .ok_or_else(|| StoreError::not_found("config", id))
    }

    async fn insert_release(&self, release: Release) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.require_app(&release.app)?;
        let expected = state
            .latest_version(&release.app)
            .map(|v| v.next())
            .unwrap_or(ReleaseVersion::FIRST);
        if release.version != expected {
            return Err(StoreError::conflict(
                "release",
                format!("{} {}", release.app, release.version),
            ));
        }
        state
            .releases
            .insert((release.app.clone(), release.version), release);
        Ok(())
    }

    async fn get_release(&self, app: &AppId, version: ReleaseVersion) -> StoreResult<Release> {
        let state = self.state.read().await;
        state
            .releases
            .get(&(app.clone(), version))
            .cloned()
            .ok_or_else(|| StoreError::not_found("release", format!("{app} {version}")))
    }

    async fn list_releases(&self, app: &AppId) -> StoreResult<Vec<Release>> {
        let state = self.state.read().await;
        state.require_app(app)?;
        Ok(state
            .releases
            .values()
            .filter(|release| &release.app == app)
            .cloned()
            .collect())
    }

    async fn put_container(&self, container: Container) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.require_app(container.app())?;
        let key = (
            container.app().clone(),
            container.process_type().to_string(),
            container.index(),
        );
        state.containers.insert(key, container);
        Ok(())
    }

    async fn remove_container(
        &self,
        app: &AppId,
        process_type: &str,
        index: u32,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = (app.clone(), process_type.to_string(), index);
        match state.containers.remove(&key) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(
                "container",
                format!("{app}.{process_type}.{index}"),
            )),
        }
    }

    async fn list_containers(&self, app: &AppId) -> StoreResult<Vec<Container>> {
        let state = self.state.read().await;
        state.require_app(app)?;
        Ok(state
            .containers
            .iter()
            .filter(|((owner, _, _), _)| owner == app)
            .map(|(_, container)| container.clone())
            .collect())
    }

    async fn put_retiring(&self, container: Container) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.require_app(container.app())?;
        let key = (container.app().clone(), container.unit_name());
        state.retiring.insert(key, container);
        Ok(())
    }

    async fn remove_retiring(&self, app: &AppId, unit: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.retiring.remove(&(app.clone(), unit.to_string())) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found("retiring container", unit)),
        }
    }

    async fn list_retiring(&self, app: &AppId) -> StoreResult<Vec<Container>> {
        let state = self.state.read().await;
        state.require_app(app)?;
        Ok(state
            .retiring
            .iter()
            .filter(|((owner, _), _)| owner == app)
            .map(|(_, container)| container.clone())
            .collect())
    }
}
