use super::common::{archive_path, controller, open_controller, Call, MockEngine};
use crate::database::{
    Command, ConditionKind, DispatchError, EngineError, LifecycleError, LifecycleState,
    RollbackInfo,
};

#[tokio::test]
async fn successful_open_reaches_open_without_condition() {
    let engine = MockEngine::new();
    let ctl = open_controller(&engine).await;

    assert_eq!(ctl.status().state(), LifecycleState::Open);
    assert!(ctl.status().current().is_none());
    assert_eq!(engine.calls(), vec![Call::Open(archive_path())]);
    assert_eq!(ctl.storage_path().unwrap(), archive_path().as_path());
}

#[tokio::test]
async fn storage_path_is_resolved_once() {
    let engine = MockEngine::new();
    let ctl = open_controller(&engine).await;

    let err = ctl
        .initialize("/elsewhere".into())
        .await
        .unwrap_err();
    assert_eq!(err, LifecycleError::AlreadyInitialized(archive_path()));
    assert_eq!(engine.calls().len(), 1);
}

#[tokio::test]
async fn operations_before_initialize_are_rejected() {
    let engine = MockEngine::new();
    let ctl = controller(&engine);
    assert_eq!(
        ctl.create_store().await.unwrap_err(),
        DispatchError::NotOffered(Command::CreateStore)
    );

    let g = ctl
        .status()
        .set(crate::database::conditions::request_create());
    assert_eq!(
        ctl.dispatch(g, Command::CreateStore).await.unwrap_err(),
        DispatchError::Lifecycle(LifecycleError::NotInitialized)
    );
    assert_eq!(ctl.status().generation(), g, "rejected dispatch claims nothing");
    assert!(engine.calls().is_empty());
    assert_eq!(ctl.status().state(), LifecycleState::Unresolved);
}

#[tokio::test]
async fn concurrent_initialize_opens_once() {
    let engine = MockEngine::new();
    let ctl = controller(&engine);

    let (a, b) = tokio::join!(
        ctl.initialize(archive_path()),
        ctl.initialize("/elsewhere".into())
    );
    assert!(a.is_ok() ^ b.is_ok(), "exactly one initialize must win");
    assert_eq!(engine.count(|c| matches!(c, Call::Open(_))), 1);
    assert_eq!(ctl.storage_path().unwrap(), archive_path().as_path());
}

#[tokio::test]
async fn unknown_open_tags_become_fatal_with_raw_detail() {
    for tag in ["DiskFull", "PermissionDenied", "AlreadyExists", ""] {
        let engine = MockEngine::new();
        engine.on_open(Err(EngineError::from_tag(tag)));
        let ctl = open_controller(&engine).await;

        let cond = ctl.status().current().expect("condition");
        assert_eq!(cond.kind, ConditionKind::Fatal, "tag {tag:?}");
        assert_eq!(cond.title, "error");
        assert_eq!(cond.detail.as_deref(), Some(tag));
        assert_eq!(cond.action, Some(Command::TerminateProcess));
        assert_eq!(ctl.status().state(), LifecycleState::Blocked);
    }
}

#[tokio::test]
async fn already_open_is_transparent_after_one_cleanup() {
    let engine = MockEngine::new();
    engine.on_open(Err(EngineError::AlreadyOpen));
    let ctl = open_controller(&engine).await;

    assert_eq!(ctl.status().state(), LifecycleState::Open);
    assert!(ctl.status().current().is_none());
    assert_eq!(
        engine.calls(),
        vec![Call::Open(archive_path()), Call::ReleaseStaleHandles]
    );
}

#[tokio::test]
async fn missing_store_offers_creation_at_resolved_path() {
    let engine = MockEngine::new();
    engine.on_open(Err(EngineError::NotFound));
    let ctl = open_controller(&engine).await;

    let snap = ctl.status().snapshot();
    let cond = snap.condition.clone().expect("condition");
    assert_eq!(cond.title, "no database found");
    assert_eq!(cond.action_label.as_deref(), Some("create"));
    assert_eq!(cond.action, Some(Command::CreateStore));
    assert_eq!(snap.state, LifecycleState::AwaitingCreation);

    ctl.dispatch(snap.generation, Command::CreateStore)
        .await
        .unwrap();
    assert_eq!(engine.calls()[1], Call::Create(archive_path()));
    assert_eq!(ctl.status().state(), LifecycleState::Open);
    assert!(ctl.status().current().is_none());
}

#[tokio::test]
async fn create_into_non_empty_folder_is_fatal_and_names_the_path() {
    let engine = MockEngine::new();
    engine
        .on_open(Err(EngineError::NotFound))
        .on_create(Err(EngineError::AlreadyExists));
    let ctl = open_controller(&engine).await;

    let g = ctl.status().generation();
    ctl.dispatch(g, Command::CreateStore).await.unwrap();

    let cond = ctl.status().current().expect("condition");
    assert!(cond.is_fatal());
    let detail = cond.detail.expect("detail");
    assert!(
        detail.contains(&archive_path().display().to_string()),
        "detail should name the folder: {detail}"
    );
    assert_eq!(ctl.status().state(), LifecycleState::Blocked);
}

#[tokio::test]
async fn create_collision_and_unknown_failures_are_fatal() {
    for (err, title) in [
        (EngineError::Collision, "app already open"),
        (EngineError::Other("Io".to_string()), "error"),
    ] {
        let engine = MockEngine::new();
        engine.on_open(Err(EngineError::NotFound)).on_create(Err(err));
        let ctl = open_controller(&engine).await;
        ctl.dispatch(ctl.status().generation(), Command::CreateStore)
            .await
            .unwrap();
        let cond = ctl.status().current().expect("condition");
        assert_eq!(cond.title, title);
        assert_eq!(cond.action, Some(Command::TerminateProcess));
    }
}

#[tokio::test]
async fn corrupted_store_offers_rollback_with_both_instants() {
    let engine = MockEngine::new();
    engine
        .on_open(Err(EngineError::DataIsCorrupted))
        .on_query_integrity(Ok(RollbackInfo {
            corrupted_instant: "2024-01-01T00:00Z".to_string(),
            rollback_candidate_instant: "2023-12-31T00:00Z".to_string(),
        }));
    let ctl = open_controller(&engine).await;

    let snap = ctl.status().snapshot();
    let cond = snap.condition.expect("condition");
    let detail = cond.detail.expect("detail");
    assert!(detail.contains("2024-01-01T00:00Z"));
    assert!(detail.contains("2023-12-31T00:00Z"));
    assert_eq!(cond.action, Some(Command::CommitRollback));
    assert_eq!(cond.kind, ConditionKind::Recoverable);
    assert_eq!(snap.state, LifecycleState::AwaitingRollbackChoice);

    ctl.dispatch(snap.generation, Command::CommitRollback)
        .await
        .unwrap();
    assert_eq!(
        engine.calls(),
        vec![
            Call::Open(archive_path()),
            Call::QueryIntegrity(archive_path()),
            Call::CommitRollback(archive_path()),
        ]
    );
    assert_eq!(ctl.status().state(), LifecycleState::Open);
    assert!(ctl.status().current().is_none());
}

#[tokio::test]
async fn discovery_writes_interim_condition_before_outcome() {
    let engine = MockEngine::new();
    engine.on_open(Err(EngineError::DataIsCorrupted));
    let ctl = controller(&engine);

    ctl.initialize(archive_path()).await.unwrap();

    // Opening, the interim search condition, then the outcome.
    let snap = ctl.status().snapshot();
    assert_eq!(snap.generation, 3);
    assert!(snap.condition.expect("condition").is_fatal());
    assert_eq!(snap.state, LifecycleState::Blocked);
}

#[tokio::test]
async fn corrupted_store_without_backup_is_fatal() {
    let engine = MockEngine::new();
    engine
        .on_open(Err(EngineError::DataIsCorrupted))
        .on_query_integrity(Err(EngineError::NotFound));
    let ctl = open_controller(&engine).await;

    let cond = ctl.status().current().expect("condition");
    assert!(cond.is_fatal());
    assert_eq!(cond.detail.as_deref(), Some("no backup could be recovered"));
}

#[tokio::test]
async fn rollback_failures_are_classified() {
    for (err, title) in [
        (EngineError::NotFound, "no backup recoverable"),
        (EngineError::Collision, "app already open"),
        (EngineError::Other("Boom".to_string()), "error"),
    ] {
        let engine = MockEngine::new();
        engine
            .on_open(Err(EngineError::DataIsCorrupted))
            .on_query_integrity(Ok(RollbackInfo {
                corrupted_instant: "a".to_string(),
                rollback_candidate_instant: "b".to_string(),
            }))
            .on_commit_rollback(Err(err));
        let ctl = open_controller(&engine).await;
        ctl.dispatch(ctl.status().generation(), Command::CommitRollback)
            .await
            .unwrap();
        let cond = ctl.status().current().expect("condition");
        assert_eq!(cond.title, title);
        assert!(cond.is_fatal());
        assert_eq!(ctl.status().state(), LifecycleState::Blocked);
    }
}

#[tokio::test]
async fn lock_collision_is_fatal_and_stops_engine_traffic() {
    let engine = MockEngine::new();
    engine.on_open(Err(EngineError::Collision));
    let ctl = open_controller(&engine).await;

    let snap = ctl.status().snapshot();
    let cond = snap.condition.clone().expect("condition");
    assert_eq!(cond.title, "app already open");
    assert_eq!(cond.action_label.as_deref(), Some("close"));
    assert_eq!(cond.action, Some(Command::TerminateProcess));

    // A periodic checkpoint does nothing while the lock error is shown.
    ctl.checkpoint().await;
    assert_eq!(
        ctl.dispatch(snap.generation, Command::CreateStore).await,
        Err(DispatchError::NotOffered(Command::CreateStore))
    );
    assert_eq!(engine.calls(), vec![Call::Open(archive_path())]);

    ctl.dispatch(snap.generation, Command::TerminateProcess)
        .await
        .unwrap();
    assert!(ctl.exit_signal().is_terminated());
    assert_eq!(engine.calls(), vec![Call::Open(archive_path())]);
}

#[tokio::test]
async fn stale_command_is_rejected_without_side_effects() {
    let engine = MockEngine::new();
    engine.on_open(Err(EngineError::NotFound));
    let ctl = open_controller(&engine).await;
    let seen = ctl.status().generation();

    ctl.status().set(crate::database::conditions::lock_collision());
    let err = ctl
        .dispatch(seen, Command::CreateStore)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DispatchError::Stale {
            issued: seen,
            current: seen + 1
        }
    );
    assert_eq!(engine.count(|c| matches!(c, Call::Create(_))), 0);
}

#[tokio::test]
async fn double_click_runs_the_action_once() {
    let engine = MockEngine::new();
    engine.on_open(Err(EngineError::NotFound));
    let ctl = open_controller(&engine).await;
    let g = ctl.status().generation();

    let (a, b) = tokio::join!(
        ctl.dispatch(g, Command::CreateStore),
        ctl.dispatch(g, Command::CreateStore)
    );
    assert!(a.is_ok() ^ b.is_ok(), "exactly one dispatch must win");
    assert_eq!(engine.count(|c| matches!(c, Call::Create(_))), 1);
}

#[tokio::test]
async fn superseded_response_does_not_overwrite_newer_condition() {
    let engine = MockEngine::new();
    engine.on_open(Err(EngineError::NotFound));
    let ctl = open_controller(&engine).await;
    let g = ctl.status().generation();

    // Claim the condition as a dispatch would, then let something newer land
    // before the create response is applied.
    let epoch = ctl.status().claim(g).expect("claim");
    let newer = ctl
        .status()
        .set(crate::database::conditions::lock_collision());
    assert!(!ctl.settle(epoch, LifecycleState::Open, None, "create"));

    assert_eq!(ctl.status().generation(), newer);
    assert_eq!(
        ctl.status().current().map(|c| c.title),
        Some("app already open".to_string())
    );
    assert_ne!(ctl.status().state(), LifecycleState::Open);
}

#[tokio::test]
async fn fatal_condition_rejects_direct_rollback_discovery() {
    let engine = MockEngine::new();
    engine
        .on_open(Err(EngineError::DataIsCorrupted))
        .on_query_integrity(Err(EngineError::Other("Busy".to_string())))
        .on_query_integrity(Ok(RollbackInfo {
            corrupted_instant: "now".to_string(),
            rollback_candidate_instant: "yesterday".to_string(),
        }));
    let ctl = open_controller(&engine).await;
    let before = ctl.status().snapshot();
    assert!(before.condition.as_ref().expect("condition").is_fatal());

    assert_eq!(
        ctl.begin_rollback_discovery().await.unwrap_err(),
        DispatchError::NotOffered(Command::BeginRollbackDiscovery)
    );
    assert_eq!(
        engine.count(|c| matches!(c, Call::QueryIntegrity(_))),
        1
    );
    assert_eq!(ctl.status().snapshot(), before);
}

#[tokio::test]
async fn rollback_of_healthy_store_is_rejected() {
    let engine = MockEngine::new();
    let ctl = open_controller(&engine).await;

    assert_eq!(
        ctl.commit_rollback().await.unwrap_err(),
        DispatchError::NotOffered(Command::CommitRollback)
    );
    assert_eq!(
        ctl.create_store().await.unwrap_err(),
        DispatchError::NotOffered(Command::CreateStore)
    );
    assert_eq!(engine.calls(), vec![Call::Open(archive_path())]);
    assert_eq!(ctl.status().state(), LifecycleState::Open);
    assert!(ctl.status().current().is_none());
}

#[tokio::test]
async fn offered_discovery_retry_is_dispatchable() {
    let engine = MockEngine::new();
    engine.on_query_integrity(Ok(RollbackInfo {
        corrupted_instant: "now".to_string(),
        rollback_candidate_instant: "yesterday".to_string(),
    }));
    let ctl = open_controller(&engine).await;

    let g = ctl.status().set(crate::database::BlockingCondition {
        title: "corrupted data found in the database".to_string(),
        detail: None,
        action_label: Some("search again".to_string()),
        action: Some(Command::BeginRollbackDiscovery),
        kind: ConditionKind::Recoverable,
    });
    ctl.dispatch(g, Command::BeginRollbackDiscovery)
        .await
        .unwrap();

    assert_eq!(
        engine.calls().last(),
        Some(&Call::QueryIntegrity(archive_path()))
    );
    assert_eq!(ctl.status().state(), LifecycleState::AwaitingRollbackChoice);
}
