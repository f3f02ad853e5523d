//! stevedore control plane library.
//!
//! The engine behind the `control-plane` binary: apps, immutable release
//! history, config merging and container reconciliation against a pluggable
//! scheduler. Exposed as a library for integration testing and reuse.

pub mod config;
pub mod container;
pub mod controller;
pub(crate) mod driver;
pub mod error;
pub mod lock;
pub mod models;
pub mod outcome;
pub mod releases;
pub mod scale;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod validation;

pub use config::Config;
pub use container::{Container, ContainerState};
pub use controller::{describe_failures, Controller, ControllerSettings};
pub use error::{CoreError, CoreResult, ErrorClass};
pub use models::{App, AppConfig, Build, ConfigPatch, NewBuild, Release};
pub use outcome::{OperationFailure, Outcome, OutcomeStatus};
pub use releases::Deployment;
pub use scale::ScaleRequest;
