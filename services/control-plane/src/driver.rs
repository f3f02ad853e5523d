//! Drives single containers through scheduler calls.
//!
//! Each call's result is written to the store before the next call for the
//! same container is made. Sibling containers are never touched.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use stevedore_id::{AppId, ReleaseVersion};
use stevedore_reconcile::{FailurePolicy, OperationKind};
use tracing::info;

use crate::container::{CallResult, Container, ContainerState};
use crate::error::CoreResult;
use crate::models::ResolvedRelease;
use crate::outcome::{OperationFailure, Outcome};
use crate::releases::ReleaseStore;
use crate::scheduler::{ContainerUnit, SchedulerAdapter, SchedulerError};
use crate::store::Store;

/// Whether container records are written back after each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Persist {
    /// Write after every call; remove the record once destroyed.
    Each,
    /// Leave the store alone; the caller commits the result.
    Never,
    /// Write to the retiring set after every call; drop the entry once
    /// destroyed.
    Retiring,
}

/// What happened to one container.
#[derive(Debug)]
pub(crate) struct Step {
    pub container: Container,
    pub calls: u32,
    pub errors: Vec<SchedulerError>,
}

impl Step {
    fn new(container: Container) -> Self {
        Self {
            container,
            calls: 0,
            errors: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = OperationFailure> + '_ {
        self.errors
            .iter()
            .map(|err| OperationFailure::new(&self.container, err))
    }

    /// Adds this step's calls and failures to `outcome`.
    pub fn record_into(&self, outcome: &mut Outcome, policy: &FailurePolicy) {
        outcome.calls += self.calls;
        for failure in self.failures() {
            outcome.record_with(failure, policy);
        }
    }
}

pub(crate) struct ContainerDriver {
    store: Arc<dyn Store>,
    scheduler: Arc<dyn SchedulerAdapter>,
}

impl ContainerDriver {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<dyn SchedulerAdapter>) -> Self {
        Self { store, scheduler }
    }

    /// Brings a container up: `create` if it has not been created (or
    /// creation failed before), then `start` if it is created.
    ///
    /// A container whose stop or destroy failed may still have a unit on
    /// the backend. That unit is destroyed first and the container starts
    /// over from a fresh record at the same index.
    pub async fn provision(
        &self,
        container: Container,
        unit: &ContainerUnit,
        persist: Persist,
    ) -> CoreResult<Step> {
        let mut step = Step::new(container);

        if step.container.state() == ContainerState::Error
            && matches!(
                step.container.failed_operation(),
                Some(OperationKind::Stop | OperationKind::Destroy)
            )
        {
            if !self
                .call(&mut step, OperationKind::Destroy, unit, persist)
                .await?
            {
                return Ok(step);
            }
            let old = &step.container;
            step.container = Container::new(
                old.app().clone(),
                old.process_type(),
                old.index(),
                old.release(),
            );
        }

        if persist == Persist::Each && step.container.state() == ContainerState::Initialized {
            self.store.put_container(step.container.clone()).await?;
        }

        if matches!(
            step.container.state(),
            ContainerState::Initialized | ContainerState::Error
        ) && !self
            .call(&mut step, OperationKind::Create, unit, persist)
            .await?
        {
            return Ok(step);
        }

        if step.container.state() == ContainerState::Created {
            self.call(&mut step, OperationKind::Start, unit, persist)
                .await?;
        }

        Ok(step)
    }

    /// Destroys a container. A record that never reached the backend is
    /// simply dropped.
    pub async fn retire(
        &self,
        container: Container,
        unit: &ContainerUnit,
        persist: Persist,
    ) -> CoreResult<Step> {
        let mut step = Step::new(container);

        if step.container.state() == ContainerState::Initialized {
            match persist {
                Persist::Each => self.remove(&step.container).await?,
                Persist::Retiring => self.remove_retiring(&step.container).await?,
                Persist::Never => {}
            }
            return Ok(step);
        }

        self.call(&mut step, OperationKind::Destroy, unit, persist)
            .await?;
        Ok(step)
    }

    /// Stops a running container, then destroys it even if the stop failed.
    pub async fn teardown(&self, container: Container, unit: &ContainerUnit) -> CoreResult<Step> {
        let mut step = Step::new(container);

        if step.container.state().is_running() {
            self.call(&mut step, OperationKind::Stop, unit, Persist::Never)
                .await?;
        }
        if step.container.state() != ContainerState::Initialized {
            self.call(&mut step, OperationKind::Destroy, unit, Persist::Never)
                .await?;
        }
        Ok(step)
    }

    /// Issues one call and records its result. Returns whether it succeeded.
    async fn call(
        &self,
        step: &mut Step,
        operation: OperationKind,
        unit: &ContainerUnit,
        persist: Persist,
    ) -> CoreResult<bool> {
        let scheduler = self.scheduler.as_ref();
        let container = &mut step.container;
        let result = match operation {
            OperationKind::Create => container.create(scheduler, unit).await?,
            OperationKind::Start => container.start(scheduler, unit).await?,
            OperationKind::Stop => container.stop(scheduler, unit).await?,
            OperationKind::Destroy => container.destroy(scheduler, unit).await?,
        };
        step.calls += 1;

        let destroyed = step.container.state() == ContainerState::Destroyed;
        match persist {
            Persist::Each if destroyed => self.remove(&step.container).await?,
            Persist::Each => self.store.put_container(step.container.clone()).await?,
            Persist::Retiring if destroyed => self.remove_retiring(&step.container).await?,
            Persist::Retiring => self.store.put_retiring(step.container.clone()).await?,
            Persist::Never => {}
        }

        match result {
            CallResult::Succeeded => Ok(true),
            CallResult::Failed(err) => {
                step.errors.push(err);
                Ok(false)
            }
        }
    }

    /// Retries destroy for every unit an earlier migration superseded but
    /// could not remove.
    pub async fn drain_retiring(
        &self,
        app: &AppId,
        releases: &ReleaseStore,
    ) -> CoreResult<Vec<Step>> {
        let retiring = self.store.list_retiring(app).await?;
        if retiring.is_empty() {
            return Ok(Vec::new());
        }
        info!(app = %app, count = retiring.len(), "Retrying destroy of retired units");

        let mut resolved: BTreeMap<ReleaseVersion, ResolvedRelease> = BTreeMap::new();
        let mut jobs = Vec::with_capacity(retiring.len());
        for container in retiring {
            let release = match resolved.entry(container.release()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    entry.insert(releases.resolve(app, container.release()).await?)
                }
            };
            let unit = ContainerUnit::for_container(&container, release);
            jobs.push((container, unit));
        }

        join_all(
            jobs.into_iter()
                .map(|(c, unit)| async move { self.retire(c, &unit, Persist::Retiring).await }),
        )
        .await
        .into_iter()
        .collect()
    }

    async fn remove(&self, container: &Container) -> CoreResult<()> {
        self.store
            .remove_container(container.app(), container.process_type(), container.index())
            .await?;
        Ok(())
    }

    async fn remove_retiring(&self, container: &Container) -> CoreResult<()> {
        self.store
            .remove_retiring(container.app(), &container.unit_name())
            .await?;
        Ok(())
    }
}
