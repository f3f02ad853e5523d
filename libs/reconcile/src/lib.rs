//! Reconciliation primitives.
//!
//! This library holds the pure, I/O-free parts of converging an app's
//! containers toward a desired per-process-type count:
//!
//! - **Scale planning**: given the indices that currently exist for a process
//!   type and the desired count, decide which indices to allocate, which to
//!   keep, and which to retire.
//! - **Failure policy**: a table that decides which backend operation
//!   failures are fatal to the aggregate outcome of a request.
//! - **Convergence status**: a summary of how far a type is from its target.
//!
//! # Invariants
//!
//! - Plans are deterministic given the same inputs.
//! - Applying a plan completely yields exactly the indices `1..=desired`.
//! - Retirement always starts from the highest index.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Operations and failure policy
// =============================================================================

/// The four primitive scheduler operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    Destroy,
}

impl OperationKind {
    /// All operation kinds, in lifecycle order.
    pub const ALL: [OperationKind; 4] = [Self::Create, Self::Start, Self::Stop, Self::Destroy];

    /// Lowercase name used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "create" => Ok(Self::Create),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "destroy" => Ok(Self::Destroy),
            other => Err(PolicyParseError::UnknownOperation(other.to_string())),
        }
    }
}

/// Whether a failed operation fails the whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// The request reports an unavailable-class outcome.
    Fatal,

    /// The failure is only recorded in the container's state.
    NonFatal,
}

impl FromStr for Severity {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fatal" => Ok(Self::Fatal),
            "non-fatal" | "nonfatal" => Ok(Self::NonFatal),
            other => Err(PolicyParseError::UnknownSeverity(other.to_string())),
        }
    }
}

/// Errors from parsing a failure policy string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyParseError {
    #[error("unknown operation '{0}' (expected create, start, stop or destroy)")]
    UnknownOperation(String),

    #[error("unknown severity '{0}' (expected fatal or non-fatal)")]
    UnknownSeverity(String),

    #[error("malformed policy entry '{0}' (expected <operation>=<severity>)")]
    MalformedEntry(String),
}

/// Table mapping each operation kind to the severity of its failure.
///
/// The default treats a failed `start` as non-fatal (the container is left
/// `crashed`) and every other failure as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    table: BTreeMap<OperationKind, Severity>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        let table = OperationKind::ALL
            .into_iter()
            .map(|kind| {
                let severity = match kind {
                    OperationKind::Start => Severity::NonFatal,
                    _ => Severity::Fatal,
                };
                (kind, severity)
            })
            .collect();
        Self { table }
    }
}

impl FailurePolicy {
    /// Returns a copy of this policy with one entry overridden.
    #[must_use]
    pub fn with(mut self, kind: OperationKind, severity: Severity) -> Self {
        self.table.insert(kind, severity);
        self
    }

    /// Severity of a failure of the given operation.
    pub fn severity(&self, kind: OperationKind) -> Severity {
        self.table.get(&kind).copied().unwrap_or(Severity::Fatal)
    }

    /// Returns true if a failure of `kind` fails the whole request.
    pub fn is_fatal(&self, kind: OperationKind) -> bool {
        self.severity(kind) == Severity::Fatal
    }
}

impl FromStr for FailurePolicy {
    type Err = PolicyParseError;

    /// Parses overrides on top of the default table, e.g.
    /// `"start=fatal,destroy=non-fatal"`. Empty input yields the default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut policy = Self::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((kind, severity)) = entry.split_once('=') else {
                return Err(PolicyParseError::MalformedEntry(entry.to_string()));
            };
            policy = policy.with(kind.parse()?, severity.parse()?);
        }
        Ok(policy)
    }
}

// =============================================================================
// Scale planning
// =============================================================================

/// What to do with one process type to reach its desired count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Indices in `1..=desired` with no container yet, ascending.
    pub allocate: Vec<u32>,

    /// Existing indices within `1..=desired`, ascending.
    pub keep: Vec<u32>,

    /// Existing indices above `desired`, highest first.
    pub retire: Vec<u32>,
}

impl ScalePlan {
    /// Computes the plan for a type with the given existing indices.
    ///
    /// With a gap-free index set `1..=current` this reduces to allocating
    /// `current+1..=desired` on scale-up and retiring the highest
    /// `current-desired` indices on scale-down. Gaps left behind by a
    /// partially failed scale-down are filled on the next pass.
    pub fn compute<I>(existing: I, desired: u32) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let existing: BTreeSet<u32> = existing.into_iter().collect();

        let allocate = (1..=desired).filter(|i| !existing.contains(i)).collect();
        let keep = existing
            .iter()
            .copied()
            .filter(|i| (1..=desired).contains(i))
            .collect();
        let retire = existing.iter().rev().copied().filter(|i| *i > desired).collect();

        Self {
            allocate,
            keep,
            retire,
        }
    }

    /// Returns true if the plan neither allocates nor retires anything.
    pub fn is_noop(&self) -> bool {
        self.allocate.is_empty() && self.retire.is_empty()
    }

    /// Net change in container count (`desired - current`).
    pub fn delta(&self) -> i64 {
        self.allocate.len() as i64 - self.retire.len() as i64
    }
}

/// Orders items for retirement: highest index first.
pub fn drain_order<T, F>(mut items: Vec<T>, index_of: F) -> Vec<T>
where
    F: Fn(&T) -> u32,
{
    items.sort_by_key(|item| std::cmp::Reverse(index_of(item)));
    items
}

// =============================================================================
// Convergence
// =============================================================================

/// Convergence status for one process type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceStatus {
    /// Exactly `desired` containers exist and all are healthy.
    Converged,

    /// The count matches but some containers are crashed or not yet started.
    Degraded,

    /// The count does not match the desired count.
    Diverged,
}

impl ConvergenceStatus {
    /// Derives a status from the observed counts.
    pub fn from_counts(desired: u32, total: u32, healthy: u32) -> Self {
        if total != desired {
            Self::Diverged
        } else if healthy < desired {
            Self::Degraded
        } else {
            Self::Converged
        }
    }

    /// Returns true if the type has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_default_policy_table() {
        let policy = FailurePolicy::default();
        assert!(policy.is_fatal(OperationKind::Create));
        assert!(!policy.is_fatal(OperationKind::Start));
        assert!(policy.is_fatal(OperationKind::Stop));
        assert!(policy.is_fatal(OperationKind::Destroy));
    }

    #[test]
    fn test_policy_override() {
        let policy = FailurePolicy::default().with(OperationKind::Start, Severity::Fatal);
        assert!(policy.is_fatal(OperationKind::Start));
    }

    #[rstest]
    #[case("", FailurePolicy::default())]
    #[case("start=fatal", FailurePolicy::default().with(OperationKind::Start, Severity::Fatal))]
    #[case(
        " create = non-fatal , destroy=nonfatal ",
        FailurePolicy::default()
            .with(OperationKind::Create, Severity::NonFatal)
            .with(OperationKind::Destroy, Severity::NonFatal)
    )]
    fn test_policy_parse(#[case] input: &str, #[case] expected: FailurePolicy) {
        assert_eq!(input.parse::<FailurePolicy>().unwrap(), expected);
    }

    #[rstest]
    #[case("launch=fatal")]
    #[case("start=maybe")]
    #[case("start")]
    fn test_policy_parse_errors(#[case] input: &str) {
        assert!(input.parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_scale_up_from_zero() {
        let plan = ScalePlan::compute([], 4);
        assert_eq!(plan.allocate, vec![1, 2, 3, 4]);
        assert!(plan.keep.is_empty());
        assert!(plan.retire.is_empty());
        assert_eq!(plan.delta(), 4);
    }

    #[test]
    fn test_scale_down_retires_highest_first() {
        let plan = ScalePlan::compute(1..=4, 2);
        assert!(plan.allocate.is_empty());
        assert_eq!(plan.keep, vec![1, 2]);
        assert_eq!(plan.retire, vec![4, 3]);
        assert_eq!(plan.delta(), -2);
    }

    #[test]
    fn test_satisfied_plan_is_noop() {
        let plan = ScalePlan::compute([3, 1, 2], 3);
        assert!(plan.is_noop());
        assert_eq!(plan.keep, vec![1, 2, 3]);
    }

    #[test]
    fn test_gaps_are_filled() {
        // Left behind by a scale-down where destroys of 6 and 8 succeeded
        // but 7 and 9 failed.
        let plan = ScalePlan::compute([1, 2, 3, 4, 5, 7, 9], 8);
        assert_eq!(plan.allocate, vec![6, 8]);
        assert_eq!(plan.keep, vec![1, 2, 3, 4, 5, 7]);
        assert_eq!(plan.retire, vec![9]);
    }

    #[test]
    fn test_drain_order() {
        let items = vec![("a", 2), ("b", 5), ("c", 1)];
        let ordered = drain_order(items, |(_, i)| *i);
        assert_eq!(ordered, vec![("b", 5), ("a", 2), ("c", 1)]);
    }

    #[rstest]
    #[case(3, 3, 3, ConvergenceStatus::Converged)]
    #[case(3, 3, 1, ConvergenceStatus::Degraded)]
    #[case(3, 5, 5, ConvergenceStatus::Diverged)]
    #[case(0, 0, 0, ConvergenceStatus::Converged)]
    fn test_convergence_status(
        #[case] desired: u32,
        #[case] total: u32,
        #[case] healthy: u32,
        #[case] expected: ConvergenceStatus,
    ) {
        assert_eq!(ConvergenceStatus::from_counts(desired, total, healthy), expected);
    }

    proptest! {
        #[test]
        fn prop_plan_converges_to_exact_range(
            existing in proptest::collection::btree_set(1u32..40, 0..30),
            desired in 0u32..40,
        ) {
            let plan = ScalePlan::compute(existing.iter().copied(), desired);

            let mut after: BTreeSet<u32> = existing.clone();
            for i in &plan.retire {
                after.remove(i);
            }
            after.extend(plan.allocate.iter().copied());

            let expected: BTreeSet<u32> = (1..=desired).collect();
            prop_assert_eq!(after, expected);
            prop_assert!(plan.retire.windows(2).all(|w| w[0] > w[1]));
            prop_assert!(plan.retire.iter().all(|i| *i > desired));
        }
    }
}
