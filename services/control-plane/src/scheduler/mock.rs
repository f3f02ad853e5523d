//! In-process scheduler for tests and local simulation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stevedore_reconcile::OperationKind;
use tracing::{debug, info};

use super::{ContainerUnit, SchedulerAdapter, SchedulerError};

/// Phase of a unit as the mock backend sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    Created,
    Running,
}

/// Mock scheduler backend.
///
/// Tracks units in memory and counts every call it receives, failed or not.
pub struct MockScheduler {
    units: Mutex<BTreeMap<String, UnitPhase>>,

    /// Calls per operation kind, in [`OperationKind::ALL`] order.
    calls: [AtomicU64; 4],

    /// Failure rules: an operation kind, optionally limited to one process
    /// type.
    failing: Mutex<Vec<(OperationKind, Option<String>)>>,

    /// Simulated per-call latency.
    latency: Option<Duration>,
}

impl MockScheduler {
    /// Create a new mock scheduler.
    pub fn new() -> Self {
        Self {
            units: Mutex::new(BTreeMap::new()),
            calls: Default::default(),
            failing: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// Create a mock scheduler that fails every call of the given kinds.
    pub fn failing(kinds: impl IntoIterator<Item = OperationKind>) -> Self {
        let scheduler = Self::new();
        for kind in kinds {
            scheduler.fail(kind, None);
        }
        scheduler
    }

    /// Fail every later call of `kind`, or only those for units of
    /// `process_type` when one is given.
    pub fn fail(&self, kind: OperationKind, process_type: Option<&str>) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, process_type.map(str::to_string)));
    }

    /// Drop every failure rule.
    pub fn heal(&self) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of calls received for one operation kind.
    pub fn calls(&self, kind: OperationKind) -> u64 {
        self.calls[kind as usize].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> u64 {
        OperationKind::ALL.iter().map(|k| self.calls(*k)).sum()
    }

    /// Units currently known to the backend.
    pub fn units(&self) -> BTreeMap<String, UnitPhase> {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the units currently running.
    pub fn running_units(&self) -> Vec<String> {
        self.units()
            .into_iter()
            .filter(|(_, phase)| *phase == UnitPhase::Running)
            .map(|(name, _)| name)
            .collect()
    }

    async fn enter(&self, kind: OperationKind, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.calls[kind as usize].fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let fails = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(failing, process_type)| {
                *failing == kind
                    && process_type
                        .as_deref()
                        .is_none_or(|t| t == unit.process_type)
            });
        if fails {
            return Err(SchedulerError::new(
                kind,
                unit,
                "mock scheduler configured to fail",
            ));
        }
        Ok(())
    }

    fn transition(
        &self,
        kind: OperationKind,
        unit: &ContainerUnit,
        to: Option<UnitPhase>,
    ) -> Result<(), SchedulerError> {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        match (kind, to) {
            (OperationKind::Create, Some(phase)) => {
                if units.contains_key(&unit.name) {
                    return Err(SchedulerError::new(kind, unit, "unit already exists"));
                }
                units.insert(unit.name.clone(), phase);
            }
            (_, Some(phase)) => match units.get_mut(&unit.name) {
                Some(current) => *current = phase,
                None => return Err(SchedulerError::new(kind, unit, "unit does not exist")),
            },
            (_, None) => {
                units.remove(&unit.name);
            }
        }
        Ok(())
    }
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulerAdapter for MockScheduler {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.enter(OperationKind::Create, unit).await?;
        info!(
            unit = %unit.name,
            image = %unit.image,
            command = unit.command.as_deref().unwrap_or("<default>"),
            "[MOCK] Creating unit"
        );
        self.transition(OperationKind::Create, unit, Some(UnitPhase::Created))
    }

    async fn start(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.enter(OperationKind::Start, unit).await?;
        info!(unit = %unit.name, "[MOCK] Starting unit");
        self.transition(OperationKind::Start, unit, Some(UnitPhase::Running))
    }

    async fn stop(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.enter(OperationKind::Stop, unit).await?;
        info!(unit = %unit.name, "[MOCK] Stopping unit");
        self.transition(OperationKind::Stop, unit, Some(UnitPhase::Created))
    }

    async fn destroy(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.enter(OperationKind::Destroy, unit).await?;
        debug!(unit = %unit.name, "[MOCK] Destroying unit");
        self.transition(OperationKind::Destroy, unit, None)
    }
}
