//! Aggregate result of a multi-container operation.

use serde::Serialize;
use stevedore_reconcile::{FailurePolicy, OperationKind, Severity};

use crate::container::Container;
use crate::error::CoreError;
use crate::scheduler::SchedulerError;

/// One failed scheduler call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    /// Short container name, `{app}.{type}.{index}`.
    pub container: String,
    /// Backend unit the call addressed.
    pub unit: String,
    pub operation: OperationKind,
    pub message: String,
}

impl OperationFailure {
    pub fn new(container: &Container, err: &SchedulerError) -> Self {
        Self {
            container: container.short_name(),
            unit: err.unit.clone(),
            operation: err.operation,
            message: err.message.clone(),
        }
    }
}

/// Overall status of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Unavailable,
}

/// What a scale, migration or teardown did.
///
/// Failures are split by the severity the failure policy gives them. Only
/// fatal failures make the outcome unsuccessful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// Scheduler calls issued.
    pub calls: u32,
    pub fatal: Vec<OperationFailure>,
    pub non_fatal: Vec<OperationFailure>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.fatal.is_empty()
    }

    pub fn status(&self) -> OutcomeStatus {
        if self.is_success() {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::Unavailable
        }
    }

    pub fn record(&mut self, failure: OperationFailure, severity: Severity) {
        match severity {
            Severity::Fatal => self.fatal.push(failure),
            Severity::NonFatal => self.non_fatal.push(failure),
        }
    }

    /// Records a failure with the severity `policy` assigns to its operation.
    pub fn record_with(&mut self, failure: OperationFailure, policy: &FailurePolicy) {
        let severity = policy.severity(failure.operation);
        self.record(failure, severity);
    }

    pub fn merge(&mut self, other: Outcome) {
        self.calls += other.calls;
        self.fatal.extend(other.fatal);
        self.non_fatal.extend(other.non_fatal);
    }

    /// Turns fatal failures into [`CoreError::Unavailable`].
    pub fn into_result(self) -> Result<Outcome, CoreError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CoreError::Unavailable {
                failures: self.fatal,
            })
        }
    }
}
