//! Fault-injecting scheduler.
//!
//! Wraps another scheduler and fails each call independently with a
//! per-operation probability. Injected failures never reach the inner
//! scheduler. Rates are fixed at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stevedore_reconcile::OperationKind;
use tracing::debug;

use super::{ContainerUnit, SchedulerAdapter, SchedulerError};

/// Failure probability per operation kind, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChaosRates {
    pub create: f64,
    pub start: f64,
    pub stop: f64,
    pub destroy: f64,
}

impl ChaosRates {
    /// No injected failures.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: OperationKind, rate: f64) -> Self {
        match kind {
            OperationKind::Create => self.create = rate,
            OperationKind::Start => self.start = rate,
            OperationKind::Stop => self.stop = rate,
            OperationKind::Destroy => self.destroy = rate,
        }
        self
    }

    pub fn rate(&self, kind: OperationKind) -> f64 {
        match kind {
            OperationKind::Create => self.create,
            OperationKind::Start => self.start,
            OperationKind::Stop => self.stop,
            OperationKind::Destroy => self.destroy,
        }
    }

    pub fn validate(&self) -> Result<(), ChaosConfigError> {
        for kind in OperationKind::ALL {
            let rate = self.rate(kind);
            if !(0.0..=1.0).contains(&rate) {
                return Err(ChaosConfigError {
                    operation: kind,
                    rate,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("chaos {operation} rate must be within [0, 1], got {rate}")]
pub struct ChaosConfigError {
    pub operation: OperationKind,
    pub rate: f64,
}

pub struct ChaosScheduler {
    inner: Arc<dyn SchedulerAdapter>,
    rates: ChaosRates,
    rng: Mutex<StdRng>,
    injected: [AtomicU64; 4],
}

impl ChaosScheduler {
    /// Wraps `inner`. A fixed `seed` makes the failure sequence reproducible
    /// for a given call order.
    pub fn new(
        inner: Arc<dyn SchedulerAdapter>,
        rates: ChaosRates,
        seed: Option<u64>,
    ) -> Result<Self, ChaosConfigError> {
        rates.validate()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            inner,
            rates,
            rng: Mutex::new(rng),
            injected: Default::default(),
        })
    }

    pub fn rates(&self) -> ChaosRates {
        self.rates
    }

    /// Number of failures injected for one operation kind.
    pub fn injected(&self, kind: OperationKind) -> u64 {
        self.injected[kind as usize].load(Ordering::SeqCst)
    }

    fn should_fail(&self, kind: OperationKind) -> bool {
        let rate = self.rates.rate(kind);
        if rate <= 0.0 {
            return false;
        }
        let fail = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_bool(rate);
        if fail {
            self.injected[kind as usize].fetch_add(1, Ordering::SeqCst);
        }
        fail
    }

    fn inject(&self, kind: OperationKind, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        if self.should_fail(kind) {
            debug!(unit = %unit.name, operation = %kind, "[CHAOS] Injecting failure");
            return Err(SchedulerError::new(kind, unit, "chaos: injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerAdapter for ChaosScheduler {
    fn name(&self) -> &'static str {
        "chaos"
    }

    async fn create(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.inject(OperationKind::Create, unit)?;
        self.inner.create(unit).await
    }

    async fn start(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.inject(OperationKind::Start, unit)?;
        self.inner.start(unit).await
    }

    async fn stop(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.inject(OperationKind::Stop, unit)?;
        self.inner.stop(unit).await
    }

    async fn destroy(&self, unit: &ContainerUnit) -> Result<(), SchedulerError> {
        self.inject(OperationKind::Destroy, unit)?;
        self.inner.destroy(unit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::scheduler::MockScheduler;
    use rstest::rstest;
    use stevedore_id::{AppId, ReleaseVersion};

    fn unit() -> ContainerUnit {
        let container = Container::new(
            AppId::parse("demo").unwrap(),
            "web",
            1,
            ReleaseVersion::FIRST,
        );
        ContainerUnit::bare(&container, "demo:latest")
    }

    #[rstest]
    #[case(-0.1)]
    #[case(1.5)]
    #[case(f64::NAN)]
    fn test_rates_out_of_range_rejected(#[case] rate: f64) {
        let rates = ChaosRates::none().with(OperationKind::Destroy, rate);
        let err = ChaosScheduler::new(Arc::new(MockScheduler::new()), rates, Some(1))
            .err()
            .unwrap();
        assert_eq!(err.operation, OperationKind::Destroy);
    }

    #[tokio::test]
    async fn test_zero_rate_passes_through() {
        let inner = Arc::new(MockScheduler::new());
        let chaos = ChaosScheduler::new(inner.clone(), ChaosRates::none(), Some(1)).unwrap();
        chaos.create(&unit()).await.unwrap();
        chaos.start(&unit()).await.unwrap();
        assert_eq!(inner.total_calls(), 2);
        assert_eq!(inner.running_units().len(), 1);
    }

    #[tokio::test]
    async fn test_full_rate_never_reaches_inner() {
        let inner = Arc::new(MockScheduler::new());
        let rates = ChaosRates::none().with(OperationKind::Create, 1.0);
        let chaos = ChaosScheduler::new(inner.clone(), rates, Some(1)).unwrap();

        for _ in 0..5 {
            let err = chaos.create(&unit()).await.unwrap_err();
            assert_eq!(err.operation, OperationKind::Create);
        }
        assert_eq!(chaos.injected(OperationKind::Create), 5);
        assert_eq!(inner.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_seeded_sequences_repeat() {
        async fn outcomes(seed: u64) -> Vec<bool> {
            let rates = ChaosRates::none().with(OperationKind::Create, 0.5);
            let chaos =
                ChaosScheduler::new(Arc::new(MockScheduler::new()), rates, Some(seed)).unwrap();
            let mut results = Vec::new();
            for _ in 0..32 {
                results.push(chaos.create(&unit()).await.is_ok());
            }
            results
        }

        let first = outcomes(42).await;
        assert_eq!(first, outcomes(42).await);
        assert!(first.contains(&true));
        assert!(first.contains(&false));
    }
}
