mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use stevedore_control_plane::scheduler::MockScheduler;
use stevedore_control_plane::store::MemoryStore;
use stevedore_control_plane::validation::ValidationError;
use stevedore_control_plane::{
    ContainerState, Controller, ControllerSettings, CoreError, ErrorClass, NewBuild,
    ScaleRequest,
};
use stevedore_id::ReleaseVersion;
use stevedore_reconcile::{ConvergenceStatus, OperationKind};

use common::*;

#[tokio::test]
async fn scale_up_then_down_keeps_lowest_indices() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web", "worker"]).await;

    let outcome = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 4).with("worker", 2))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.calls, 12);

    let up = containers(&controller, &app.id).await;
    assert_eq!(
        short_names(&up),
        vec![
            "demo.web.1",
            "demo.web.2",
            "demo.web.3",
            "demo.web.4",
            "demo.worker.1",
            "demo.worker.2",
        ]
    );
    assert!(up.iter().all(|c| c.state() == ContainerState::Up));
    assert!(up.iter().all(|c| c.release() == ReleaseVersion::new(2).unwrap()));
    assert_eq!(mock.running_units().len(), 6);

    let outcome = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2).with("worker", 1))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(mock.calls(OperationKind::Destroy), 3);

    let left = containers(&controller, &app.id).await;
    assert_eq!(
        short_names(&left),
        vec!["demo.web.1", "demo.web.2", "demo.worker.1"]
    );
    assert_eq!(
        mock.running_units(),
        vec!["demo_v2.web.1", "demo_v2.web.2", "demo_v2.worker.1"]
    );

    let record = controller.get_app(&app.id).await.unwrap();
    assert_eq!(
        record.structure,
        BTreeMap::from([("web".to_string(), 2), ("worker".to_string(), 1)])
    );
    let status = controller.status(&app.id).await.unwrap();
    assert!(status.values().all(ConvergenceStatus::is_converged));
}

#[tokio::test]
async fn satisfied_request_makes_no_calls() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    let request = ScaleRequest::new().with("web", 3);

    controller.scale(&app.id, &request).await.unwrap();
    let before = mock.total_calls();

    let outcome = controller.scale(&app.id, &request).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.calls, 0);
    assert_eq!(mock.total_calls(), before);
}

#[tokio::test]
async fn scale_to_zero_removes_every_container() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;

    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();
    let outcome = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 0))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert!(containers(&controller, &app.id).await.is_empty());
    assert!(mock.units().is_empty());
}

#[tokio::test]
async fn types_outside_the_request_are_untouched() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web", "worker"]).await;

    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 1).with("worker", 1))
        .await
        .unwrap();
    let before = mock.total_calls();

    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();
    assert_eq!(mock.total_calls(), before + 2);
    assert_eq!(
        controller
            .list_containers(&app.id, Some("worker"), None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn invalid_requests_have_no_side_effects() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;

    let unknown = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2).with("clock", 1))
        .await
        .unwrap_err();
    assert_eq!(unknown.class(), ErrorClass::InvalidRequest);

    assert!(ScaleRequest::from_json(&json!({"web": -1})).is_err());
    assert!(ScaleRequest::from_json(&json!({"web": 2, "worker": 1.5})).is_err());

    assert_eq!(mock.total_calls(), 0);
    assert!(containers(&controller, &app.id).await.is_empty());
}

#[tokio::test]
async fn scale_without_build_is_rejected() {
    let (controller, mock) = mock_controller();
    let app = controller.create_app(OWNER, Some("empty")).await.unwrap();

    let err = controller
        .scale(&app.id, &ScaleRequest::new().with("cmd", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert_eq!(err.to_string(), "no build associated with this release");
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test]
async fn image_only_build_runs_cmd() {
    let (controller, _mock) = mock_controller();
    let app = controller.create_app(OWNER, Some("plain")).await.unwrap();
    controller
        .create_build(&app.id, NewBuild::new(OWNER, "example/plain:1"))
        .await
        .unwrap();

    let outcome = controller
        .scale(&app.id, &ScaleRequest::new().with("cmd", 2))
        .await
        .unwrap();
    assert!(outcome.is_success());

    let err = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 1))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidRequest);
}

#[tokio::test]
async fn failed_creates_are_repaired_by_a_later_pass() {
    let (controller, _) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    let broken = sharing_store(
        &controller,
        Arc::new(MockScheduler::failing([OperationKind::Create])),
    );
    let request = ScaleRequest::new().with("web", 2);

    let outcome = broken.scale(&app.id, &request).await.unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.fatal.len(), 2);
    assert!(outcome
        .fatal
        .iter()
        .all(|f| f.operation == OperationKind::Create));
    let failed = containers(&controller, &app.id).await;
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|c| c.state() == ContainerState::Error));
    assert!(controller.get_app(&app.id).await.unwrap().structure.is_empty());

    let outcome = controller.scale(&app.id, &request).await.unwrap();
    assert!(outcome.is_success());
    assert!(containers(&controller, &app.id)
        .await
        .iter()
        .all(|c| c.state() == ContainerState::Up));
}

#[tokio::test]
async fn failed_destroy_is_retried_before_the_index_is_reused() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();

    mock.fail(OperationKind::Destroy, None);
    let down = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 1))
        .await
        .unwrap();
    assert!(!down.is_success());
    let stuck = controller
        .list_containers(&app.id, Some("web"), Some(2))
        .await
        .unwrap();
    assert_eq!(stuck[0].state(), ContainerState::Error);
    assert_eq!(stuck[0].failed_operation(), Some(OperationKind::Destroy));

    mock.heal();
    let up = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();
    assert!(up.is_success());
    assert_eq!(up.calls, 3);
    assert_eq!(mock.calls(OperationKind::Create), 3);
    assert_eq!(mock.running_units(), vec!["demo_v2.web.1", "demo_v2.web.2"]);
    assert!(containers(&controller, &app.id)
        .await
        .iter()
        .all(|c| c.state() == ContainerState::Up));
}

#[tokio::test]
async fn counts_above_the_type_limit_are_rejected() {
    let mock = Arc::new(MockScheduler::new());
    let controller = Controller::new(
        Arc::new(MemoryStore::new()),
        mock.clone(),
        ControllerSettings {
            max_per_type: 3,
            ..ControllerSettings::default()
        },
    );
    let app = app_with_build(&controller, "demo", &["web"]).await;

    for count in [4, u32::MAX] {
        let err = controller
            .scale(&app.id, &ScaleRequest::new().with("web", count))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::InvalidScale { .. })
        ));
        assert_eq!(err.class(), ErrorClass::InvalidRequest);
    }
    assert_eq!(mock.total_calls(), 0);

    let outcome = controller
        .scale(&app.id, &ScaleRequest::new().with("web", 3))
        .await
        .unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
async fn default_limit_rejects_huge_counts() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    let err = controller
        .scale(&app.id, &ScaleRequest::new().with("web", u32::MAX))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidRequest);
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test]
async fn start_failures_leave_crashed_containers() {
    let (controller, _) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    let flaky = sharing_store(
        &controller,
        Arc::new(MockScheduler::failing([OperationKind::Start])),
    );

    let outcome = flaky
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.non_fatal.len(), 2);
    assert!(containers(&controller, &app.id)
        .await
        .iter()
        .all(|c| c.state() == ContainerState::Crashed));

    let status = controller.status(&app.id).await.unwrap();
    assert_eq!(status.get("web"), Some(&ConvergenceStatus::Degraded));
}

#[tokio::test]
async fn list_containers_filters() {
    let (controller, _) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web", "worker"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 3).with("worker", 1))
        .await
        .unwrap();

    let web = controller
        .list_containers(&app.id, Some("web"), None)
        .await
        .unwrap();
    assert_eq!(web.len(), 3);

    let second = controller
        .list_containers(&app.id, Some("web"), Some(2))
        .await
        .unwrap();
    assert_eq!(short_names(&second), vec!["demo.web.2"]);
    assert_eq!(second[0].release().to_string(), "v2");
}

#[tokio::test]
async fn destroy_app_tears_down_everything() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();

    let outcome = controller.destroy_app(&app.id).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(mock.calls(OperationKind::Stop), 2);
    assert_eq!(mock.calls(OperationKind::Destroy), 2);
    assert!(mock.units().is_empty());

    let err = controller.get_app(&app.id).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert_eq!(
        controller.list_releases(&app.id).await.unwrap_err().class(),
        ErrorClass::NotFound
    );

    controller.create_app(OWNER, Some("demo")).await.unwrap();
}

#[tokio::test]
async fn destroy_app_reports_teardown_failures_as_non_fatal() {
    let (controller, _) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();

    let broken = sharing_store(
        &controller,
        Arc::new(MockScheduler::failing([OperationKind::Destroy])),
    );
    let outcome = broken.destroy_app(&app.id).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(
        outcome
            .non_fatal
            .iter()
            .filter(|f| f.operation == OperationKind::Destroy)
            .count(),
        2
    );
    assert!(controller.list_apps().await.unwrap().is_empty());
}
