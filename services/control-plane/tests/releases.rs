mod common;

use stevedore_control_plane::models::ConfigPatch;
use stevedore_control_plane::{
    Container, ContainerState, CoreError, ErrorClass, NewBuild, ScaleRequest,
};
use stevedore_id::ReleaseVersion;
use stevedore_reconcile::OperationKind;

use common::*;

fn v(n: u32) -> ReleaseVersion {
    ReleaseVersion::new(n).unwrap()
}

#[tokio::test]
async fn versions_are_gap_free_across_builds_configs_and_rollbacks() {
    let (controller, _) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .update_config(&app.id, ConfigPatch::new(OWNER).set("DATABASE_URL", "postgres://db"))
        .await
        .unwrap();
    controller.rollback(&app.id, OWNER, None).await.unwrap();
    controller
        .create_build(&app.id, NewBuild::new(OWNER, "example/app:2"))
        .await
        .unwrap();

    let releases = controller.list_releases(&app.id).await.unwrap();
    let versions: Vec<u32> = releases.iter().map(|r| r.version.value()).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    let summaries: Vec<&str> = releases.iter().map(|r| r.summary.as_str()).collect();
    assert_eq!(
        summaries,
        vec![
            "autotest created initial release",
            "autotest deployed example/app:1",
            "autotest added DATABASE_URL",
            "autotest rolled back to v2",
            "autotest deployed example/app:2",
        ]
    );
    assert_eq!(
        controller.get_app(&app.id).await.unwrap().latest_version,
        v(5)
    );
}

#[tokio::test]
async fn rollback_to_first_release_reuses_its_content() {
    let (controller, _) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .update_config(&app.id, ConfigPatch::new(OWNER).set("FOO", "bar"))
        .await
        .unwrap();

    let first = controller.get_release(&app.id, v(1)).await.unwrap();
    let deployment = controller
        .rollback(&app.id, OWNER, Some(v(1)))
        .await
        .unwrap();
    assert!(deployment.is_success());

    let release = deployment.release;
    assert_eq!(release.version, v(4));
    assert_eq!(release.build, first.build);
    assert_eq!(release.config, first.config);
    assert!(controller.get_config(&app.id).await.unwrap().values.is_empty());
}

#[tokio::test]
async fn rollback_migrates_running_containers() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .create_build(
            &app.id,
            NewBuild::new(OWNER, "example/app:2").with_procfile([("web", "run web")]),
        )
        .await
        .unwrap();
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();

    let deployment = controller.rollback(&app.id, OWNER, None).await.unwrap();
    assert!(deployment.is_success());
    assert_eq!(deployment.release.version, v(4));
    assert_eq!(
        deployment.release.build,
        controller.get_release(&app.id, v(2)).await.unwrap().build
    );

    let records = containers(&controller, &app.id).await;
    assert_eq!(short_names(&records), vec!["demo.web.1", "demo.web.2"]);
    assert!(records
        .iter()
        .all(|c| c.release() == v(4) && c.state() == ContainerState::Up));
    assert_eq!(mock.running_units(), vec!["demo_v4.web.1", "demo_v4.web.2"]);
}

#[tokio::test]
async fn invalid_rollbacks_are_rejected() {
    let (controller, _) = mock_controller();
    let app = controller.create_app(OWNER, Some("fresh")).await.unwrap();

    let at_first = controller.rollback(&app.id, OWNER, None).await.unwrap_err();
    assert_eq!(at_first.class(), ErrorClass::InvalidRequest);

    controller
        .create_build(&app.id, NewBuild::new(OWNER, "example/app:1"))
        .await
        .unwrap();
    let forward = controller
        .rollback(&app.id, OWNER, Some(v(2)))
        .await
        .unwrap_err();
    assert_eq!(forward.class(), ErrorClass::InvalidRequest);

    let missing = controller
        .rollback(&app.id, OWNER, Some(v(9)))
        .await
        .unwrap_err();
    assert_eq!(missing.class(), ErrorClass::InvalidRequest);

    controller
        .scale(&app.id, &ScaleRequest::new().with("cmd", 1))
        .await
        .unwrap();
    let buildless = controller
        .rollback(&app.id, OWNER, Some(v(1)))
        .await
        .unwrap_err();
    assert!(matches!(buildless, CoreError::Validation(_)));

    assert_eq!(controller.list_releases(&app.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn build_push_migrates_every_type() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web", "worker"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2).with("worker", 1))
        .await
        .unwrap();

    let deployment = controller
        .create_build(
            &app.id,
            NewBuild::new(OWNER, "example/app:2")
                .with_sha("abc123")
                .with_procfile([("web", "run web"), ("worker", "run worker")]),
        )
        .await
        .unwrap();
    assert!(deployment.is_success());
    assert_eq!(deployment.outcome.calls, 3 * 3);
    assert_eq!(mock.calls(OperationKind::Destroy), 3);

    let records = containers(&controller, &app.id).await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|c| c.release() == v(3)));
    assert_eq!(
        mock.running_units(),
        vec!["demo_v3.web.1", "demo_v3.web.2", "demo_v3.worker.1"]
    );

    let builds = controller.list_builds(&app.id).await.unwrap();
    assert_eq!(builds.len(), 2);
}

#[tokio::test]
async fn migration_commits_each_type_on_its_own() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web", "worker"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2).with("worker", 1))
        .await
        .unwrap();

    mock.fail(OperationKind::Create, Some("worker"));
    let deployment = controller
        .create_build(
            &app.id,
            NewBuild::new(OWNER, "example/app:2")
                .with_procfile([("web", "run web"), ("worker", "run worker")]),
        )
        .await
        .unwrap();
    assert!(!deployment.is_success());
    assert_eq!(deployment.outcome.fatal.len(), 1);
    assert_eq!(deployment.outcome.fatal[0].operation, OperationKind::Create);
    assert_eq!(deployment.outcome.fatal[0].container, "demo.worker.1");

    let web = controller
        .list_containers(&app.id, Some("web"), None)
        .await
        .unwrap();
    assert_eq!(web.len(), 2);
    assert!(web
        .iter()
        .all(|c| c.release() == v(3) && c.state() == ContainerState::Up));

    let worker = controller
        .list_containers(&app.id, Some("worker"), None)
        .await
        .unwrap();
    assert_eq!(worker.len(), 1);
    assert_eq!(worker[0].release(), v(2));
    assert_eq!(worker[0].state(), ContainerState::Up);

    assert_eq!(
        mock.running_units(),
        vec!["demo_v2.worker.1", "demo_v3.web.1", "demo_v3.web.2"]
    );
    assert!(controller.list_retiring(&app.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn old_units_that_fail_to_destroy_are_retried_by_the_next_scale() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    let request = ScaleRequest::new().with("web", 2);
    controller.scale(&app.id, &request).await.unwrap();

    mock.fail(OperationKind::Destroy, None);
    let deployment = controller
        .create_build(
            &app.id,
            NewBuild::new(OWNER, "example/app:2").with_procfile([("web", "run web")]),
        )
        .await
        .unwrap();
    assert!(!deployment.is_success());
    assert_eq!(deployment.outcome.fatal.len(), 2);
    assert!(deployment
        .outcome
        .fatal
        .iter()
        .all(|f| f.operation == OperationKind::Destroy));

    let records = containers(&controller, &app.id).await;
    assert!(records
        .iter()
        .all(|c| c.release() == v(3) && c.state() == ContainerState::Up));
    let retiring = controller.list_retiring(&app.id).await.unwrap();
    assert_eq!(
        retiring.iter().map(Container::unit_name).collect::<Vec<_>>(),
        vec!["demo_v2.web.1", "demo_v2.web.2"]
    );
    assert!(retiring.iter().all(|c| c.state() == ContainerState::Error));
    assert_eq!(mock.running_units().len(), 4);

    mock.heal();
    let retry = controller.scale(&app.id, &request).await.unwrap();
    assert!(retry.is_success());
    assert_eq!(retry.calls, 2);
    assert!(controller.list_retiring(&app.id).await.unwrap().is_empty());
    assert_eq!(mock.running_units(), vec!["demo_v3.web.1", "demo_v3.web.2"]);
}

#[tokio::test]
async fn old_units_that_fail_to_destroy_are_retried_by_the_next_deploy() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 1))
        .await
        .unwrap();

    mock.fail(OperationKind::Destroy, None);
    let failed = controller
        .update_config(&app.id, ConfigPatch::new(OWNER).set("FOO", "1"))
        .await
        .unwrap();
    assert!(!failed.is_success());
    assert_eq!(controller.list_retiring(&app.id).await.unwrap().len(), 1);

    mock.heal();
    let deployment = controller
        .update_config(&app.id, ConfigPatch::new(OWNER).set("FOO", "2"))
        .await
        .unwrap();
    assert!(deployment.is_success());
    assert!(controller.list_retiring(&app.id).await.unwrap().is_empty());
    assert_eq!(mock.running_units(), vec!["demo_v4.web.1"]);
}

#[tokio::test]
async fn destroy_app_removes_units_still_retiring() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;
    controller
        .scale(&app.id, &ScaleRequest::new().with("web", 2))
        .await
        .unwrap();

    mock.fail(OperationKind::Destroy, None);
    controller
        .update_config(&app.id, ConfigPatch::new(OWNER).set("FOO", "1"))
        .await
        .unwrap();
    assert_eq!(mock.units().len(), 4);

    mock.heal();
    let outcome = controller.destroy_app(&app.id).await.unwrap();
    assert!(outcome.is_success());
    assert!(mock.units().is_empty());
}

#[tokio::test]
async fn invalid_build_creates_no_release() {
    let (controller, mock) = mock_controller();
    let app = app_with_build(&controller, "demo", &["web"]).await;

    let no_image = controller
        .create_build(&app.id, NewBuild::new(OWNER, ""))
        .await
        .unwrap_err();
    assert_eq!(no_image.class(), ErrorClass::InvalidRequest);

    let bad_type = controller
        .create_build(
            &app.id,
            NewBuild::new(OWNER, "example/app:2").with_procfile([("Web", "run")]),
        )
        .await
        .unwrap_err();
    assert_eq!(bad_type.class(), ErrorClass::InvalidRequest);

    assert_eq!(controller.list_releases(&app.id).await.unwrap().len(), 2);
    assert_eq!(controller.list_builds(&app.id).await.unwrap().len(), 1);
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test]
async fn unknown_release_is_not_found() {
    let (controller, _) = mock_controller();
    let app = controller.create_app(OWNER, Some("demo")).await.unwrap();
    let err = controller.get_release(&app.id, v(7)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
}
