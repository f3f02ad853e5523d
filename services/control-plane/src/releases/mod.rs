//! Release creation and container migration.
//!
//! A build push, config change or rollback produces a new release. If the
//! app has containers, they are then moved onto the new release one process
//! type at a time:
//!
//! 1. create and start a replacement for every container of the type
//! 2. if every replacement is up, commit them and destroy the old units
//! 3. otherwise discard the replacements and keep the old containers serving
//!
//! Old units stay in the store's retiring set until their destroy succeeds;
//! every later migration or scale pass retries them first.
//!
//! The release itself is recorded either way.

mod history;
mod summary;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use stevedore_id::{AppId, ReleaseVersion};
use stevedore_reconcile::{drain_order, FailurePolicy, OperationKind, Severity};
use tracing::{debug, info, instrument, warn};

use crate::container::{Container, ContainerState};
use crate::driver::{ContainerDriver, Persist};
use crate::error::{CoreError, CoreResult};
use crate::models::{App, AppConfig, Build, ConfigPatch, NewBuild, Release, ResolvedRelease};
use crate::outcome::Outcome;
use crate::scheduler::{ContainerUnit, SchedulerAdapter};
use crate::store::Store;
use crate::validation::ValidationError;

pub use history::{ReleaseDraft, ReleaseStore};

/// A committed release and the result of migrating containers onto it.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub release: Release,
    pub outcome: Outcome,
}

impl Deployment {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The release, or [`CoreError::Unavailable`] if migration failed.
    pub fn into_result(self) -> CoreResult<Release> {
        self.outcome.into_result()?;
        Ok(self.release)
    }
}

/// Every failure during migration fails the deployment.
fn migration_policy() -> FailurePolicy {
    OperationKind::ALL
        .into_iter()
        .fold(FailurePolicy::default(), |policy, kind| {
            policy.with(kind, Severity::Fatal)
        })
}

pub struct ReleaseManager {
    store: Arc<dyn Store>,
    releases: ReleaseStore,
    driver: ContainerDriver,
    policy: FailurePolicy,
}

impl ReleaseManager {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<dyn SchedulerAdapter>) -> Self {
        Self {
            releases: ReleaseStore::new(store.clone()),
            driver: ContainerDriver::new(store.clone(), scheduler),
            store,
            policy: migration_policy(),
        }
    }

    pub fn releases(&self) -> &ReleaseStore {
        &self.releases
    }

    /// Records v1 for a freshly registered app: no build, empty config.
    pub async fn create_initial(&self, app: &App) -> CoreResult<Release> {
        let config = AppConfig::empty(&app.id, &app.owner);
        self.store.insert_config(config.clone()).await?;
        self.releases
            .append(
                &app.id,
                ReleaseDraft {
                    build: None,
                    config: config.id,
                    summary: summary::initial(&app.owner),
                    owner: app.owner.clone(),
                },
            )
            .await
    }

    /// New release with `build` and the current config.
    #[instrument(skip(self, app, build), fields(app = %app.id, image = %build.image))]
    pub async fn deploy_build(&self, app: &App, build: NewBuild) -> CoreResult<Deployment> {
        build.validate()?;
        let current = self.releases.resolve(&app.id, app.latest_version).await?;

        let build = build.into_build(&app.id);
        self.store.insert_build(build.clone()).await?;

        let summary = summary::deployed(&build.owner, &build.image);
        let owner = build.owner.clone();
        self.deploy(&app.id, Some(build), current.config, summary, owner)
            .await
    }

    /// New release with the current build and `patch` merged into the config.
    #[instrument(skip(self, app, patch), fields(app = %app.id))]
    pub async fn deploy_config(&self, app: &App, patch: ConfigPatch) -> CoreResult<Deployment> {
        let current = self.releases.resolve(&app.id, app.latest_version).await?;
        let (config, changes) = current.config.apply(&patch)?;
        self.store.insert_config(config.clone()).await?;

        let summary = summary::config_changed(&patch.owner, &changes);
        self.deploy(&app.id, current.build, config, summary, patch.owner)
            .await
    }

    /// New release reusing the build and config of `target`, by default the
    /// release before the current one.
    #[instrument(skip(self, app), fields(app = %app.id))]
    pub async fn rollback(
        &self,
        app: &App,
        owner: &str,
        target: Option<ReleaseVersion>,
    ) -> CoreResult<Deployment> {
        let current = app.latest_version;
        let target = match target {
            Some(target) => target,
            None => current.previous().ok_or_else(|| {
                ValidationError::InvalidRollback(format!("{current} is the first release"))
            })?,
        };
        if target >= current {
            return Err(ValidationError::InvalidRollback(format!(
                "{target} is not older than the current release {current}"
            ))
            .into());
        }

        let resolved = self.releases.resolve(&app.id, target).await?;
        if resolved.build.is_none() && !self.store.list_containers(&app.id).await?.is_empty() {
            return Err(ValidationError::InvalidRollback(format!(
                "{target} has no build to run the existing containers"
            ))
            .into());
        }

        self.deploy(
            &app.id,
            resolved.build,
            resolved.config,
            summary::rolled_back(owner, target),
            owner.to_string(),
        )
        .await
    }

    async fn deploy(
        &self,
        app: &AppId,
        build: Option<Build>,
        config: AppConfig,
        summary: String,
        owner: String,
    ) -> CoreResult<Deployment> {
        let release = self
            .releases
            .append(
                app,
                ReleaseDraft {
                    build: build.as_ref().map(|b| b.id),
                    config: config.id,
                    summary,
                    owner,
                },
            )
            .await?;

        let resolved = ResolvedRelease {
            release: release.clone(),
            build,
            config,
        };
        let outcome = self.migrate(app, &resolved).await?;
        if !outcome.is_success() {
            warn!(
                app = %app,
                version = %release.version,
                failures = outcome.fatal.len(),
                "Release recorded but migration failed"
            );
        }
        Ok(Deployment { release, outcome })
    }

    /// Moves every container of the app onto `release`, one type at a time.
    #[instrument(skip(self, release), fields(version = %release.version()))]
    async fn migrate(&self, app: &AppId, release: &ResolvedRelease) -> CoreResult<Outcome> {
        let mut outcome = Outcome::default();
        for step in self.driver.drain_retiring(app, &self.releases).await? {
            step.record_into(&mut outcome, &self.policy);
        }

        let containers = self.store.list_containers(app).await?;
        if containers.is_empty() {
            debug!("No containers to migrate");
            return Ok(outcome);
        }

        let mut previous: BTreeMap<ReleaseVersion, ResolvedRelease> = BTreeMap::new();
        let mut by_type: BTreeMap<String, Vec<Container>> = BTreeMap::new();
        for container in containers {
            let version = container.release();
            if !previous.contains_key(&version) {
                previous.insert(version, self.releases.resolve(app, version).await?);
            }
            by_type
                .entry(container.process_type().to_string())
                .or_default()
                .push(container);
        }

        for (process_type, old) in by_type {
            let type_outcome = self
                .migrate_type(&process_type, old, release, &previous)
                .await?;
            outcome.merge(type_outcome);
        }
        Ok(outcome)
    }

    async fn migrate_type(
        &self,
        process_type: &str,
        old: Vec<Container>,
        release: &ResolvedRelease,
        previous: &BTreeMap<ReleaseVersion, ResolvedRelease>,
    ) -> CoreResult<Outcome> {
        let mut outcome = Outcome::default();

        let replacements: Vec<(Container, ContainerUnit)> = old
            .iter()
            .map(|c| {
                let replacement =
                    Container::new(c.app().clone(), process_type, c.index(), release.version());
                let unit = ContainerUnit::for_container(&replacement, release);
                (replacement, unit)
            })
            .collect();

        let steps = join_all(
            replacements
                .iter()
                .map(|(c, unit)| self.driver.provision(c.clone(), unit, Persist::Never)),
        )
        .await
        .into_iter()
        .collect::<CoreResult<Vec<_>>>()?;
        for step in &steps {
            step.record_into(&mut outcome, &self.policy);
        }

        if steps
            .iter()
            .any(|step| step.container.state() != ContainerState::Up)
        {
            warn!(
                process_type,
                failed = outcome.fatal.len(),
                "Replacements failed, keeping previous containers"
            );
            let mut discard = Vec::with_capacity(steps.len());
            for (step, (_, unit)) in steps.into_iter().zip(&replacements) {
                if step.container.state() == ContainerState::Initialized {
                    continue;
                }
                self.store.put_retiring(step.container.clone()).await?;
                discard.push(self.driver.retire(step.container, unit, Persist::Retiring));
            }
            for step in join_all(discard).await {
                step?.record_into(&mut outcome, &self.policy);
            }
            return Ok(outcome);
        }

        let mut retirements = Vec::with_capacity(old.len());
        for container in drain_order(old, Container::index) {
            if container.state() == ContainerState::Initialized {
                continue;
            }
            let source = previous
                .get(&container.release())
                .ok_or_else(|| CoreError::not_found("release", container.release()))?;
            let unit = ContainerUnit::for_container(&container, source);
            self.store.put_retiring(container.clone()).await?;
            retirements.push((container, unit));
        }

        for step in &steps {
            self.store.put_container(step.container.clone()).await?;
        }

        let retired = join_all(
            retirements
                .into_iter()
                .map(|(c, unit)| async move { self.driver.retire(c, &unit, Persist::Retiring).await }),
        )
        .await;
        for step in retired {
            step?.record_into(&mut outcome, &self.policy);
        }

        info!(
            process_type,
            count = steps.len(),
            version = %release.version(),
            "Containers migrated"
        );
        Ok(outcome)
    }
}
