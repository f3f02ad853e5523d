#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use stevedore_control_plane::scheduler::{ChaosRates, ChaosScheduler, MockScheduler, SchedulerAdapter};
use stevedore_control_plane::store::MemoryStore;
use stevedore_control_plane::{App, Container, ContainerState, Controller, ControllerSettings, NewBuild};
use stevedore_id::AppId;

pub const OWNER: &str = "autotest";

/// A controller over a fresh store and a plain mock backend.
pub fn mock_controller() -> (Controller, Arc<MockScheduler>) {
    let mock = Arc::new(MockScheduler::new());
    let controller = Controller::new(
        Arc::new(MemoryStore::new()),
        mock.clone(),
        ControllerSettings::default(),
    );
    (controller, mock)
}

/// A controller whose backend fails calls at `rates`, reproducibly.
pub fn chaos_controller(rates: ChaosRates, seed: u64) -> (Controller, Arc<ChaosScheduler>) {
    let chaos = Arc::new(
        ChaosScheduler::new(Arc::new(MockScheduler::new()), rates, Some(seed))
            .expect("valid chaos rates"),
    );
    let controller = Controller::new(
        Arc::new(MemoryStore::new()),
        chaos.clone(),
        ControllerSettings::default(),
    );
    (controller, chaos)
}

/// A second controller over the same store, talking to another backend.
pub fn sharing_store(controller: &Controller, scheduler: Arc<dyn SchedulerAdapter>) -> Controller {
    Controller::new(
        controller.store().clone(),
        scheduler,
        ControllerSettings::default(),
    )
}

/// Creates `name` and pushes a build with one procfile entry per type.
pub async fn app_with_build(controller: &Controller, name: &str, types: &[&str]) -> App {
    let app = controller.create_app(OWNER, Some(name)).await.unwrap();
    let build = NewBuild::new(OWNER, "example/app:1")
        .with_procfile(types.iter().map(|t| (*t, format!("run {t}"))));
    controller.create_build(&app.id, build).await.unwrap();
    controller.get_app(&app.id).await.unwrap()
}

pub async fn containers(controller: &Controller, app: &AppId) -> Vec<Container> {
    controller.list_containers(app, None, None).await.unwrap()
}

pub fn short_names(containers: &[Container]) -> Vec<String> {
    containers.iter().map(Container::short_name).collect()
}

pub fn count_states(containers: &[Container]) -> BTreeMap<ContainerState, usize> {
    let mut counts = BTreeMap::new();
    for container in containers {
        *counts.entry(container.state()).or_default() += 1;
    }
    counts
}
