//! Scale reconciliation.
//!
//! Given desired counts per process type, the reconciler diffs them against
//! the container records and drives the scheduler toward them:
//!
//! - missing indices in `1..=desired` are allocated, created and started
//! - in-range containers left in `error` or `created` by an earlier pass are
//!   repaired; one whose stop or destroy failed has its unit destroyed and
//!   is created again
//! - indices above `desired` are destroyed, highest first
//!
//! Units a migration could not destroy are retried before anything else.
//!
//! Containers are driven concurrently and every result is committed as soon
//! as it arrives. A request that is already satisfied makes no calls.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use stevedore_id::{AppId, ReleaseVersion};
use stevedore_reconcile::{ConvergenceStatus, FailurePolicy, ScalePlan};
use tracing::{debug, info, instrument, warn};

use crate::container::{Container, ContainerState};
use crate::driver::{ContainerDriver, Persist};
use crate::error::CoreResult;
use crate::models::{App, ResolvedRelease};
use crate::outcome::Outcome;
use crate::releases::ReleaseStore;
use crate::scheduler::{ContainerUnit, SchedulerAdapter};
use crate::store::Store;
use crate::validation::{validate_process_type, ValidationError};

/// Desired container counts per process type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleRequest {
    counts: BTreeMap<String, u32>,
}

impl ScaleRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, process_type: impl Into<String>, count: u32) -> Self {
        self.counts.insert(process_type.into(), count);
        self
    }

    /// Parses `{"web": 3, "worker": "2"}`. Counts may be non-negative
    /// integers or strings of digits; anything else rejects the whole
    /// request.
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = value else {
            return Err(ValidationError::InvalidScale {
                process_type: String::new(),
                reason: "expected an object of process type to count".to_string(),
            });
        };

        let mut counts = BTreeMap::new();
        for (process_type, raw) in map {
            validate_process_type(process_type)?;
            let invalid = |reason: &str| ValidationError::InvalidScale {
                process_type: process_type.clone(),
                reason: reason.to_string(),
            };
            let count = match raw {
                Value::Number(n) => n
                    .as_u64()
                    .ok_or_else(|| invalid("count must be a non-negative integer"))?,
                Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => s
                    .parse::<u64>()
                    .map_err(|_| invalid("count is too large"))?,
                _ => return Err(invalid("count must be a non-negative integer")),
            };
            let count = u32::try_from(count).map_err(|_| invalid("count is too large"))?;
            counts.insert(process_type.clone(), count);
        }
        Ok(Self { counts })
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, process_type: &str) -> Option<u32> {
        self.counts.get(process_type).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn counts(&self) -> &BTreeMap<String, u32> {
        &self.counts
    }
}

impl<K: Into<String>> FromIterator<(K, u32)> for ScaleRequest {
    fn from_iter<I: IntoIterator<Item = (K, u32)>>(iter: I) -> Self {
        Self {
            counts: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

enum Task {
    Provision(Container),
    Retire(Container),
}

impl Task {
    fn container(&self) -> &Container {
        match self {
            Self::Provision(c) | Self::Retire(c) => c,
        }
    }
}

/// Default upper bound on the containers of one process type.
pub const DEFAULT_MAX_PER_TYPE: u32 = 100;

pub struct ScaleReconciler {
    store: Arc<dyn Store>,
    releases: ReleaseStore,
    driver: ContainerDriver,
    policy: FailurePolicy,
    max_per_type: u32,
}

impl ScaleReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<dyn SchedulerAdapter>,
        policy: FailurePolicy,
        max_per_type: u32,
    ) -> Self {
        Self {
            releases: ReleaseStore::new(store.clone()),
            driver: ContainerDriver::new(store.clone(), scheduler),
            store,
            policy,
            max_per_type,
        }
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    /// Runs one reconciliation pass for the requested types. Types not in
    /// the request are left alone.
    #[instrument(skip(self, app, request), fields(app = %app.id, version = %app.latest_version))]
    pub async fn reconcile(&self, app: &App, request: &ScaleRequest) -> CoreResult<Outcome> {
        let current = self.releases.resolve(&app.id, app.latest_version).await?;
        validate_request(&current, request, self.max_per_type)?;

        let mut outcome = Outcome::default();
        for step in self.driver.drain_retiring(&app.id, &self.releases).await? {
            step.record_into(&mut outcome, &self.policy);
        }

        let mut by_type: BTreeMap<String, BTreeMap<u32, Container>> = BTreeMap::new();
        for container in self.store.list_containers(&app.id).await? {
            by_type
                .entry(container.process_type().to_string())
                .or_default()
                .insert(container.index(), container);
        }

        let mut tasks = Vec::new();
        for (process_type, desired) in request.iter() {
            let mut existing = by_type.remove(process_type).unwrap_or_default();
            let plan = ScalePlan::compute(existing.keys().copied(), desired);
            debug!(
                process_type,
                desired,
                current = existing.len(),
                allocate = plan.allocate.len(),
                retire = plan.retire.len(),
                "Computed scale plan"
            );

            for index in plan.allocate {
                tasks.push(Task::Provision(Container::new(
                    app.id.clone(),
                    process_type,
                    index,
                    current.version(),
                )));
            }
            for index in plan.keep {
                let Some(container) = existing.remove(&index) else {
                    continue;
                };
                if matches!(
                    container.state(),
                    ContainerState::Initialized | ContainerState::Error | ContainerState::Created
                ) {
                    tasks.push(Task::Provision(container));
                }
            }
            for index in plan.retire {
                if let Some(container) = existing.remove(&index) {
                    tasks.push(Task::Retire(container));
                }
            }
        }

        if tasks.is_empty() {
            info!(calls = outcome.calls, "Scale request already satisfied");
            return Ok(outcome);
        }

        let mut releases: BTreeMap<ReleaseVersion, ResolvedRelease> = BTreeMap::new();
        releases.insert(current.version(), current);
        let mut jobs = Vec::with_capacity(tasks.len());
        for task in tasks {
            let version = task.container().release();
            let release = match releases.entry(version) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.releases.resolve(&app.id, version).await?),
            };
            let unit = ContainerUnit::for_container(task.container(), release);
            jobs.push((task, unit));
        }

        info!(operations = jobs.len(), "Reconciling containers");
        let steps = join_all(jobs.into_iter().map(|(task, unit)| async move {
            match task {
                Task::Provision(c) => self.driver.provision(c, &unit, Persist::Each).await,
                Task::Retire(c) => self.driver.retire(c, &unit, Persist::Each).await,
            }
        }))
        .await;

        for step in steps {
            step?.record_into(&mut outcome, &self.policy);
        }

        self.log_convergence(&app.id, request).await?;
        if outcome.is_success() {
            info!(
                calls = outcome.calls,
                non_fatal = outcome.non_fatal.len(),
                "Scale pass complete"
            );
        } else {
            warn!(
                calls = outcome.calls,
                fatal = outcome.fatal.len(),
                non_fatal = outcome.non_fatal.len(),
                "Scale pass finished with failures"
            );
        }
        Ok(outcome)
    }

    async fn log_convergence(&self, app: &AppId, request: &ScaleRequest) -> CoreResult<()> {
        let containers = self.store.list_containers(app).await?;
        for (process_type, desired) in request.iter() {
            let of_type = containers
                .iter()
                .filter(|c| c.process_type() == process_type);
            let total = of_type.clone().count() as u32;
            let healthy = of_type.filter(|c| c.state() == ContainerState::Up).count() as u32;
            let status = ConvergenceStatus::from_counts(desired, total, healthy);
            debug!(process_type, desired, total, healthy, status = ?status, "Type status");
        }
        Ok(())
    }
}

/// Rejects the request before any side effect.
fn validate_request(
    current: &ResolvedRelease,
    request: &ScaleRequest,
    max_per_type: u32,
) -> Result<(), ValidationError> {
    if current.build.is_none() {
        return Err(ValidationError::NoBuild);
    }
    let available = current.process_types();
    for (process_type, count) in request.iter() {
        validate_process_type(process_type)?;
        if count > max_per_type {
            return Err(ValidationError::InvalidScale {
                process_type: process_type.to_string(),
                reason: format!("{count} exceeds the limit of {max_per_type} containers"),
            });
        }
        if !available.contains(process_type) {
            return Err(ValidationError::UnknownProcessType(process_type.to_string()));
        }
    }
    Ok(())
}
