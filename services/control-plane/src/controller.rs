//! Entry point for every engine operation.
//!
//! Mutating operations take the app's lock for their whole duration. Reads
//! go straight to the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use stevedore_id::{AppId, ReleaseVersion};
use stevedore_reconcile::{drain_order, ConvergenceStatus, FailurePolicy, Severity};
use tracing::{info, instrument, warn};

use crate::container::{Container, ContainerState};
use crate::driver::ContainerDriver;
use crate::error::{CoreError, CoreResult};
use crate::lock::{AppLocks, DEFAULT_LOCK_TIMEOUT};
use crate::models::{App, AppConfig, Build, ConfigPatch, NewBuild, Release, ResolvedRelease};
use crate::outcome::{OperationFailure, Outcome};
use crate::releases::{Deployment, ReleaseManager};
use crate::scale::{ScaleReconciler, ScaleRequest, DEFAULT_MAX_PER_TYPE};
use crate::scheduler::{ContainerUnit, SchedulerAdapter};
use crate::store::{Store, StoreError};

/// Attempts at finding an unused generated app ID.
const GENERATE_ATTEMPTS: usize = 16;

/// Tunables for a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub lock_timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Largest count a scale request may ask for per process type.
    pub max_per_type: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            failure_policy: FailurePolicy::default(),
            max_per_type: DEFAULT_MAX_PER_TYPE,
        }
    }
}

struct ControllerInner {
    store: Arc<dyn Store>,
    scheduler: Arc<dyn SchedulerAdapter>,
    locks: AppLocks,
    releases: ReleaseManager,
    reconciler: ScaleReconciler,
    driver: ContainerDriver,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<dyn SchedulerAdapter>,
        settings: ControllerSettings,
    ) -> Self {
        let inner = ControllerInner {
            locks: AppLocks::new(settings.lock_timeout),
            releases: ReleaseManager::new(store.clone(), scheduler.clone()),
            reconciler: ScaleReconciler::new(
                store.clone(),
                scheduler.clone(),
                settings.failure_policy,
                settings.max_per_type,
            ),
            driver: ContainerDriver::new(store.clone(), scheduler.clone()),
            store,
            scheduler,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn SchedulerAdapter> {
        &self.inner.scheduler
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    // -------------------------------------------------------------------------
    // Apps
    // -------------------------------------------------------------------------

    /// Registers an app and records its initial release. Without a
    /// requested ID a readable one is generated.
    #[instrument(skip(self))]
    pub async fn create_app(&self, owner: &str, requested: Option<&str>) -> CoreResult<App> {
        let app = match requested {
            Some(id) => {
                let app = App::new(AppId::parse(id)?, owner);
                self.inner.store.insert_app(app.clone()).await?;
                app
            }
            None => self.insert_generated(owner).await?,
        };

        self.inner.releases.create_initial(&app).await?;
        info!(app = %app.id, owner, "App created");
        Ok(self.inner.store.get_app(&app.id).await?)
    }

    async fn insert_generated(&self, owner: &str) -> CoreResult<App> {
        for _ in 0..GENERATE_ATTEMPTS {
            let app = App::new(AppId::generate(), owner);
            match self.inner.store.insert_app(app.clone()).await {
                Ok(()) => return Ok(app),
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(CoreError::Conflict(
            "could not generate an unused app id".to_string(),
        ))
    }

    /// Tears down every container (best effort) and removes the app with
    /// its whole history. Teardown failures are reported as non-fatal.
    #[instrument(skip(self), fields(app = %app))]
    pub async fn destroy_app(&self, app: &AppId) -> CoreResult<Outcome> {
        let guard = self.inner.locks.acquire(app).await?;
        self.inner.store.get_app(app).await?;

        let mut containers = self.inner.store.list_containers(app).await?;
        containers.extend(self.inner.store.list_retiring(app).await?);
        let mut releases: BTreeMap<ReleaseVersion, ResolvedRelease> = BTreeMap::new();
        let mut jobs = Vec::with_capacity(containers.len());
        for container in drain_order(containers, Container::index) {
            let version = container.release();
            if !releases.contains_key(&version) {
                let resolved = self.inner.releases.releases().resolve(app, version).await?;
                releases.insert(version, resolved);
            }
            if let Some(release) = releases.get(&version) {
                let unit = ContainerUnit::for_container(&container, release);
                jobs.push((container, unit));
            }
        }

        let driver = &self.inner.driver;
        let steps = join_all(
            jobs.into_iter()
                .map(|(c, unit)| async move { driver.teardown(c, &unit).await }),
        )
        .await;

        let mut outcome = Outcome::default();
        for step in steps {
            let step = step?;
            outcome.calls += step.calls;
            for failure in step.failures() {
                outcome.record(failure, Severity::NonFatal);
            }
        }
        if !outcome.non_fatal.is_empty() {
            warn!(
                failures = outcome.non_fatal.len(),
                "Some units could not be torn down"
            );
        }

        self.inner.store.delete_app(app).await?;
        drop(guard);
        self.inner.locks.forget(app);

        info!(calls = outcome.calls, "App destroyed");
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Releases
    // -------------------------------------------------------------------------

    /// Records a build as a new release and migrates running containers.
    pub async fn create_build(&self, app: &AppId, build: NewBuild) -> CoreResult<Deployment> {
        let _guard = self.inner.locks.acquire(app).await?;
        let record = self.inner.store.get_app(app).await?;
        self.inner.releases.deploy_build(&record, build).await
    }

    /// Merges `patch` into the current config as a new release and migrates
    /// running containers.
    pub async fn update_config(&self, app: &AppId, patch: ConfigPatch) -> CoreResult<Deployment> {
        let _guard = self.inner.locks.acquire(app).await?;
        let record = self.inner.store.get_app(app).await?;
        self.inner.releases.deploy_config(&record, patch).await
    }

    /// Re-releases the build and config of an older release.
    pub async fn rollback(
        &self,
        app: &AppId,
        owner: &str,
        version: Option<ReleaseVersion>,
    ) -> CoreResult<Deployment> {
        let _guard = self.inner.locks.acquire(app).await?;
        let record = self.inner.store.get_app(app).await?;
        self.inner.releases.rollback(&record, owner, version).await
    }

    pub async fn list_releases(&self, app: &AppId) -> CoreResult<Vec<Release>> {
        self.inner.releases.releases().history(app).await
    }

    pub async fn get_release(&self, app: &AppId, version: ReleaseVersion) -> CoreResult<Release> {
        self.inner.releases.releases().get(app, version).await
    }

    pub async fn list_builds(&self, app: &AppId) -> CoreResult<Vec<Build>> {
        Ok(self.inner.store.list_builds(app).await?)
    }

    /// The config of the app's current release.
    pub async fn get_config(&self, app: &AppId) -> CoreResult<AppConfig> {
        let record = self.inner.store.get_app(app).await?;
        let resolved = self
            .inner
            .releases
            .releases()
            .resolve(app, record.latest_version)
            .await?;
        Ok(resolved.config)
    }

    // -------------------------------------------------------------------------
    // Containers
    // -------------------------------------------------------------------------

    /// Runs one scale pass. Backend failures are reported in the outcome;
    /// the app's structure is updated only when the pass succeeds.
    pub async fn scale(&self, app: &AppId, request: &ScaleRequest) -> CoreResult<Outcome> {
        let _guard = self.inner.locks.acquire(app).await?;
        let record = self.inner.store.get_app(app).await?;
        let outcome = self.inner.reconciler.reconcile(&record, request).await?;

        if outcome.is_success() {
            let mut record = self.inner.store.get_app(app).await?;
            record.structure.extend(request.counts().clone());
            record.updated_at = Utc::now();
            self.inner.store.update_app(record).await?;
        }
        Ok(outcome)
    }

    /// Containers of an app, optionally narrowed to one type and index.
    pub async fn list_containers(
        &self,
        app: &AppId,
        process_type: Option<&str>,
        index: Option<u32>,
    ) -> CoreResult<Vec<Container>> {
        let containers = self.inner.store.list_containers(app).await?;
        Ok(containers
            .into_iter()
            .filter(|c| process_type.is_none_or(|t| c.process_type() == t))
            .filter(|c| index.is_none_or(|i| c.index() == i))
            .collect())
    }

    /// Containers superseded by a migration whose units are still waiting
    /// to be destroyed.
    pub async fn list_retiring(&self, app: &AppId) -> CoreResult<Vec<Container>> {
        Ok(self.inner.store.list_retiring(app).await?)
    }

    /// Convergence of each type in the app's structure.
    pub async fn status(&self, app: &AppId) -> CoreResult<BTreeMap<String, ConvergenceStatus>> {
        let record = self.inner.store.get_app(app).await?;
        let containers = self.inner.store.list_containers(app).await?;
        Ok(record
            .structure
            .iter()
            .map(|(process_type, desired)| {
                let of_type: Vec<_> = containers
                    .iter()
                    .filter(|c| c.process_type() == process_type)
                    .collect();
                let healthy = of_type
                    .iter()
                    .filter(|c| c.state() == ContainerState::Up)
                    .count();
                let status =
                    ConvergenceStatus::from_counts(*desired, of_type.len() as u32, healthy as u32);
                (process_type.clone(), status)
            })
            .collect())
    }

    pub async fn get_app(&self, app: &AppId) -> CoreResult<App> {
        Ok(self.inner.store.get_app(app).await?)
    }

    pub async fn list_apps(&self) -> CoreResult<Vec<App>> {
        Ok(self.inner.store.list_apps().await?)
    }
}

/// Failures of a finished operation, for callers that only need a summary.
pub fn describe_failures(failures: &[OperationFailure]) -> Vec<String> {
    failures
        .iter()
        .map(|f| format!("{} {}: {}", f.operation, f.container, f.message))
        .collect()
}
