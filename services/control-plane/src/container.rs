//! Container records and their lifecycle.
//!
//! A container's state only changes as the result of a scheduler call made
//! through one of the transition methods. There is no setter:
//!
//! ```text
//! initialized --create--> created --start--> up
//!                            ^                |
//!                            +------stop------+  (also from crashed)
//!
//! start failure            -> crashed
//! create/stop/destroy fail -> error   (create or destroy may be retried)
//! destroy success          -> destroyed
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stevedore_id::{AppId, ContainerId, ReleaseVersion};
use stevedore_reconcile::OperationKind;
use tracing::{debug, error, warn};

use crate::scheduler::{ContainerUnit, SchedulerAdapter, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Initialized,
    Created,
    Up,
    Crashed,
    Destroyed,
    Error,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Created => "created",
            Self::Up => "up",
            Self::Crashed => "crashed",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
        }
    }

    /// States from which the backend unit may be running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Up | Self::Crashed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {operation} container {container} in state {state}")]
pub struct IllegalTransition {
    pub container: String,
    pub operation: OperationKind,
    pub state: ContainerState,
}

/// Result of a permitted transition: the scheduler call either succeeded or
/// failed, and the container state already reflects which.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    Succeeded,
    Failed(SchedulerError),
}

impl CallResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One scheduled unit of an app, addressed by `(app, process type, index)`.
#[derive(Debug, Clone, Serialize)]
pub struct Container {
    id: ContainerId,
    app: AppId,
    process_type: String,
    index: u32,
    release: ReleaseVersion,
    state: ContainerState,
    failed_operation: Option<OperationKind>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Container {
    /// A fresh record in `initialized`, not yet known to the scheduler.
    pub fn new(
        app: AppId,
        process_type: impl Into<String>,
        index: u32,
        release: ReleaseVersion,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ContainerId::new(),
            app,
            process_type: process_type.into(),
            index,
            release,
            state: ContainerState::Initialized,
            failed_operation: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn app(&self) -> &AppId {
        &self.app
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn release(&self) -> ReleaseVersion {
        self.release
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// The operation that put the container in `error`, if it is there.
    pub fn failed_operation(&self) -> Option<OperationKind> {
        self.failed_operation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// `{app}.{type}.{index}`
    pub fn short_name(&self) -> String {
        format!("{}.{}.{}", self.app, self.process_type, self.index)
    }

    /// Backend unit name: `{app}_v{version}.{type}.{index}`.
    pub fn unit_name(&self) -> String {
        ContainerUnit::unit_name(&self.app, self.release, &self.process_type, self.index)
    }

    /// `initialized|error -> created`, or `error` on failure.
    pub async fn create(
        &mut self,
        scheduler: &dyn SchedulerAdapter,
        unit: &ContainerUnit,
    ) -> Result<CallResult, IllegalTransition> {
        self.guard(
            OperationKind::Create,
            &[ContainerState::Initialized, ContainerState::Error],
        )?;
        let result = scheduler.create(unit).await;
        Ok(self.settle(OperationKind::Create, result, ContainerState::Created, ContainerState::Error))
    }

    /// `created -> up`, or `crashed` on failure.
    pub async fn start(
        &mut self,
        scheduler: &dyn SchedulerAdapter,
        unit: &ContainerUnit,
    ) -> Result<CallResult, IllegalTransition> {
        self.guard(OperationKind::Start, &[ContainerState::Created])?;
        let result = scheduler.start(unit).await;
        Ok(self.settle(OperationKind::Start, result, ContainerState::Up, ContainerState::Crashed))
    }

    /// `up|crashed -> created`, or `error` on failure.
    pub async fn stop(
        &mut self,
        scheduler: &dyn SchedulerAdapter,
        unit: &ContainerUnit,
    ) -> Result<CallResult, IllegalTransition> {
        self.guard(
            OperationKind::Stop,
            &[ContainerState::Up, ContainerState::Crashed],
        )?;
        let result = scheduler.stop(unit).await;
        Ok(self.settle(OperationKind::Stop, result, ContainerState::Created, ContainerState::Error))
    }

    /// `created|up|crashed|error -> destroyed`, or `error` on failure.
    pub async fn destroy(
        &mut self,
        scheduler: &dyn SchedulerAdapter,
        unit: &ContainerUnit,
    ) -> Result<CallResult, IllegalTransition> {
        self.guard(
            OperationKind::Destroy,
            &[
                ContainerState::Created,
                ContainerState::Up,
                ContainerState::Crashed,
                ContainerState::Error,
            ],
        )?;
        let result = scheduler.destroy(unit).await;
        Ok(self.settle(OperationKind::Destroy, result, ContainerState::Destroyed, ContainerState::Error))
    }

    fn guard(
        &self,
        operation: OperationKind,
        allowed: &[ContainerState],
    ) -> Result<(), IllegalTransition> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let err = IllegalTransition {
            container: self.short_name(),
            operation,
            state: self.state,
        };
        error!(error = %err, "Illegal container transition");
        Err(err)
    }

    fn settle(
        &mut self,
        operation: OperationKind,
        result: Result<(), SchedulerError>,
        on_success: ContainerState,
        on_failure: ContainerState,
    ) -> CallResult {
        self.updated_at = Utc::now();
        match result {
            Ok(()) => {
                debug!(
                    container = %self.short_name(),
                    operation = %operation,
                    from = %self.state,
                    to = %on_success,
                    "Scheduler call succeeded"
                );
                self.state = on_success;
                self.failed_operation = None;
                CallResult::Succeeded
            }
            Err(err) => {
                warn!(
                    container = %self.short_name(),
                    operation = %operation,
                    from = %self.state,
                    to = %on_failure,
                    error = %err,
                    "Scheduler call failed"
                );
                self.state = on_failure;
                self.failed_operation =
                    (on_failure == ContainerState::Error).then_some(operation);
                CallResult::Failed(err)
            }
        }
    }
}
