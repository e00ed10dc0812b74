//! Integration tests for version reconciliation and request routing.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use modelvisor::models::{
    ConfigDocument, ConfigError, ErrorCode, ModelConfig, ReconcileError, RequestError, ScanError,
    StatefulParams, VersionPolicy, VersionSelector, VersionState,
};

fn specific(versions: &[u64]) -> VersionPolicy {
    VersionPolicy::Specific { versions: versions.iter().copied().collect() }
}

fn document(models: Vec<ModelConfig>) -> ConfigDocument {
    ConfigDocument { models }
}

fn state_of(manager: &modelvisor::models::Manager, name: &str, version: u64) -> VersionState {
    manager.entry(name).unwrap().get(version).unwrap().state()
}

// ============================================================================
// Start and Retire
// ============================================================================

#[tokio::test]
async fn test_single_model_becomes_available() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "resnet", &[1, 2]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    let report = manager.serve_single_model(ModelConfig::new("resnet", &base)).await;
    assert!(report.is_clean());
    assert_eq!(report.changes["resnet"].to_start, BTreeSet::from([2]));
    assert!(manager.wait_for_settled(SETTLE).await);

    let guard = manager.get_instance("resnet", VersionSelector::Default).await.unwrap();
    assert_eq!(guard.version(), 2);
    assert_eq!(guard.state(), VersionState::Available);
    assert_eq!(backend.loads(), 1);
}

#[tokio::test]
async fn test_start_then_retire_leaves_no_default() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[2]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(specific(&[2]))]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);
    assert_eq!(manager.default_version("m"), Some(2));

    // Version 5 is not on disk, so nothing is requested any more
    let report = manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(specific(&[5]))]))
        .await;
    assert_eq!(report.changes["m"].to_retire, BTreeSet::from([2]));
    assert!(manager.wait_for_settled(SETTLE).await);

    assert_eq!(state_of(&manager, "m", 2), VersionState::End);
    assert_eq!(manager.default_version("m"), None);
    assert_eq!(backend.unloads(), 1);

    let err = manager.get_instance("m", VersionSelector::Default).await.unwrap_err();
    assert_eq!(err, RequestError::ModelVersionMissing { model: "m".into(), version: None });
}

#[tokio::test]
async fn test_invalid_last_version_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1, 2, 3]);
    corrupt_version(&base, 3);
    let manager = manager(TestBackend::new());

    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(specific(&[2, 3]))]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);

    assert_eq!(manager.default_version("m"), Some(2));
    let failed = manager.entry("m").unwrap().get(3).unwrap().snapshot();
    assert_eq!(failed.state, VersionState::Loading);
    assert_eq!(failed.error_code, Some(ErrorCode::InvalidFormat));

    let err = manager.get_instance("m", VersionSelector::Specific(3)).await.unwrap_err();
    assert_eq!(err, RequestError::ModelVersionNotLoadedYet { model: "m".into(), version: 3 });

    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(specific(&[1]))]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);

    assert_eq!(state_of(&manager, "m", 1), VersionState::Available);
    assert_eq!(state_of(&manager, "m", 2), VersionState::End);
    assert_eq!(state_of(&manager, "m", 3), VersionState::End);
    assert_eq!(manager.default_version("m"), Some(1));
}

#[tokio::test]
async fn test_retired_version_is_resurrected() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1, 2]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(VersionPolicy::All)]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);
    let first = manager.entry("m").unwrap().get(1).unwrap();

    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(specific(&[2]))]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);
    assert_eq!(first.state(), VersionState::End);

    let report = manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(VersionPolicy::All)]))
        .await;
    assert_eq!(report.changes["m"].to_reload, BTreeSet::from([1]));
    assert!(manager.wait_for_settled(SETTLE).await);

    let guard = manager.get_instance("m", VersionSelector::Specific(1)).await.unwrap();
    assert!(!Arc::ptr_eq(guard.handle(), &first));
    assert_eq!(backend.loads(), 3);
    assert_eq!(backend.unloads(), 1);
}

// ============================================================================
// Reload
// ============================================================================

#[tokio::test]
async fn test_config_change_reloads_and_keeps_pinned_instance() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    let mut model = ModelConfig::new("m", &base);
    model.version.nireq = 1;
    manager.apply_document(document(vec![model.clone()])).await;
    assert!(manager.wait_for_settled(SETTLE).await);

    let old = manager.get_instance("m", VersionSelector::Default).await.unwrap();
    assert_eq!(old.config().nireq, 1);

    model.version.nireq = 2;
    let report = manager.apply_document(document(vec![model])).await;
    assert_eq!(report.changes["m"].to_reload, BTreeSet::from([1]));
    assert!(manager.wait_for_settled(SETTLE).await);

    let new = manager.get_instance("m", VersionSelector::Default).await.unwrap();
    assert_eq!(new.config().nireq, 2);
    let loaded = new.loaded_model().unwrap();
    assert_eq!(loaded.as_any().downcast_ref::<TestModel>().unwrap().nireq, 2);

    // The old instance is out of routing but still usable by its holder
    assert_eq!(old.state(), VersionState::Unloading);
    assert!(old.loaded_model().is_some());
    assert_eq!(backend.unloads(), 0);

    let old_handle = old.handle().clone();
    drop(old);
    // Replaced handles are out of the registry; wait on the handle itself
    assert!(old_handle.status().wait_for_state(VersionState::End, SETTLE).await);
    assert!(old_handle.loaded_model().is_none());
    assert_eq!(backend.unloads(), 1);
}

#[tokio::test]
async fn test_failed_reload_keeps_serving_old_instance() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    let mut model = ModelConfig::new("m", &base);
    model.version.nireq = 1;
    manager.apply_document(document(vec![model.clone()])).await;
    assert!(manager.wait_for_settled(SETTLE).await);

    corrupt_version(&base, 1);
    model.version.nireq = 2;
    let report = manager.apply_document(document(vec![model.clone()])).await;
    assert_eq!(report.changes["m"].to_reload, BTreeSet::from([1]));
    assert!(manager.wait_for_settled(SETTLE).await);

    let guard = manager.get_instance("m", VersionSelector::Default).await.unwrap();
    assert_eq!(guard.config().nireq, 1);
    assert_eq!(guard.state(), VersionState::Available);
    assert_eq!(manager.default_version("m"), Some(1));
    assert_eq!(backend.unloads(), 0);
    drop(guard);

    // Same desired config again: the failed attempt is not retried
    let report = manager.apply_document(document(vec![model])).await;
    assert!(report.changes["m"].is_empty());
    assert_eq!(backend.loads(), 2);
}

#[tokio::test]
async fn test_identical_config_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    let model = ModelConfig::new("m", &base);
    manager.apply_document(document(vec![model.clone()])).await;
    assert!(manager.wait_for_settled(SETTLE).await);

    let report = manager.apply_document(document(vec![model])).await;
    assert!(report.changes["m"].is_empty());
    assert!(manager.wait_for_settled(SETTLE).await);
    assert_eq!(backend.loads(), 1);
    assert_eq!(backend.unloads(), 0);
}

#[tokio::test]
async fn test_stateful_flip_is_rejected_and_serving_continues() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "seq", &[1]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    let mut model = ModelConfig::new("seq", &base);
    manager.apply_document(document(vec![model.clone()])).await;
    assert!(manager.wait_for_settled(SETTLE).await);

    model.version.stateful = Some(StatefulParams::default());
    let report = manager.apply_document(document(vec![model])).await;
    assert!(matches!(
        report.failures.get("seq"),
        Some(ReconcileError::Incompatible { model, .. }) if model == "seq"
    ));
    assert!(!report.is_clean());

    let guard = manager.get_instance("seq", VersionSelector::Default).await.unwrap();
    assert!(!guard.config().is_stateful());
    assert_eq!(backend.loads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_survive_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1]);
    let manager = manager(TestBackend::new());

    let mut model = ModelConfig::new("m", &base);
    manager.apply_document(document(vec![model.clone()])).await;
    assert!(manager.wait_for_settled(SETTLE).await);

    let mut readers = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..200 {
                let guard = manager.get_instance("m", VersionSelector::Default).await?;
                assert!(guard.loaded_model().is_some());
                tokio::task::yield_now().await;
            }
            Ok::<_, RequestError>(())
        }));
    }

    for nireq in 1..=5 {
        model.version.nireq = nireq;
        manager.apply_document(document(vec![model.clone()])).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for reader in readers {
        reader.await.unwrap().unwrap();
    }
    assert!(manager.wait_for_settled(SETTLE).await);
    let guard = manager.get_instance("m", VersionSelector::Default).await.unwrap();
    assert_eq!(guard.config().nireq, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_default_tracks_available_under_churn() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1, 2, 3]);
    let manager = manager(TestBackend::new());

    let with = |versions: &[u64]| document(vec![ModelConfig::new("m", &base).with_policy(specific(versions))]);
    manager.apply_document(with(&[1, 2])).await;
    assert!(manager.wait_for_settled(SETTLE).await);

    let mut readers = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..300 {
                match manager.get_instance("m", VersionSelector::Default).await {
                    Ok(guard) => assert!(guard.loaded_model().is_some()),
                    // A retire may land between the default lookup and the pin
                    Err(RequestError::ModelVersionNotLoadedAnymore { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    // Each flip starts one version on a worker while retiring the other
    for round in 0..20 {
        manager.apply_document(with(&[1, 3])).await;
        if round % 2 == 0 {
            tokio::task::yield_now().await;
        }
        manager.apply_document(with(&[1, 2])).await;
    }
    manager.apply_document(with(&[1, 3])).await;

    for reader in readers {
        reader.await.unwrap();
    }
    assert!(manager.wait_for_settled(SETTLE).await);

    let status = manager.model_status("m", None).unwrap();
    let highest_available = status
        .iter()
        .filter(|s| s.state == VersionState::Available)
        .map(|s| s.version)
        .max();
    assert_eq!(highest_available, Some(3));
    assert_eq!(manager.default_version("m"), highest_available);
    assert_eq!(state_of(&manager, "m", 2), VersionState::End);

    let guard = manager.get_instance("m", VersionSelector::Default).await.unwrap();
    assert_eq!(guard.version(), 3);
}

// ============================================================================
// Request Errors
// ============================================================================

#[tokio::test]
async fn test_request_errors() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1]);
    let manager = manager(TestBackend::new());
    manager.serve_single_model(ModelConfig::new("m", &base)).await;

    let err = manager.get_instance("other", VersionSelector::Default).await.unwrap_err();
    assert_eq!(err, RequestError::ModelNameMissing("other".into()));
    assert_eq!(err.kind(), "model_name_missing");

    let err = manager.get_instance("m", VersionSelector::Specific(9)).await.unwrap_err();
    assert_eq!(err, RequestError::ModelVersionMissing { model: "m".into(), version: Some(9) });

    assert!(manager.model_status("m", Some(9)).is_err());
    let status = manager.model_status("m", None).unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].version, 1);
}

#[tokio::test]
async fn test_slow_load_times_out_without_changing_state() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1]);
    let backend = TestBackend::new();
    backend.gate().close();
    let manager = manager_with(backend.clone(), Duration::from_millis(50));

    manager.serve_single_model(ModelConfig::new("m", &base)).await;
    let handle = manager.entry("m").unwrap().get(1).unwrap();
    assert!(handle.status().wait_for_state(VersionState::Loading, SETTLE).await);

    let err = manager.get_instance("m", VersionSelector::Specific(1)).await.unwrap_err();
    assert_eq!(err, RequestError::ModelVersionNotLoadedYet { model: "m".into(), version: 1 });
    assert_eq!(handle.state(), VersionState::Loading);
    assert_eq!(handle.snapshot().error_code, None);

    let err = manager.get_instance("m", VersionSelector::Default).await.unwrap_err();
    assert!(matches!(err, RequestError::ModelVersionMissing { version: None, .. }));

    backend.gate().open();
    assert!(manager.wait_for_settled(SETTLE).await);
    assert!(manager.get_instance("m", VersionSelector::Specific(1)).await.is_ok());
}

#[tokio::test]
async fn test_retired_version_refuses_new_requests_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1, 2]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(specific(&[1]))]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);
    let pinned = manager.get_instance("m", VersionSelector::Specific(1)).await.unwrap();

    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(specific(&[2]))]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);

    assert_eq!(pinned.state(), VersionState::Unloading);
    assert_eq!(pinned.ref_count(), 1);
    assert_eq!(backend.unloads(), 0);
    let err = manager.get_instance("m", VersionSelector::Specific(1)).await.unwrap_err();
    assert_eq!(err, RequestError::ModelVersionNotLoadedAnymore { model: "m".into(), version: 1 });

    drop(pinned);
    assert!(manager.wait_for_settled(SETTLE).await);
    assert_eq!(state_of(&manager, "m", 1), VersionState::End);
    assert_eq!(backend.unloads(), 1);
}

#[tokio::test]
async fn test_with_instance_releases_pin() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[4]);
    let manager = manager(TestBackend::new());
    manager.serve_single_model(ModelConfig::new("m", &base)).await;
    assert!(manager.wait_for_settled(SETTLE).await);

    let version = manager
        .with_instance("m", VersionSelector::Default, |instance| {
            assert_eq!(instance.ref_count(), 1);
            instance.version()
        })
        .await
        .unwrap();
    assert_eq!(version, 4);
    assert_eq!(manager.entry("m").unwrap().get(4).unwrap().ref_count(), 0);
}

// ============================================================================
// Configuration Files
// ============================================================================

#[tokio::test]
async fn test_rejected_file_keeps_previous_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1]);
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, config_json(&[("m", &base, "")])).unwrap();

    let manager = manager(TestBackend::new());
    let report = manager.load_configuration(&config_path).await.unwrap();
    assert!(report.is_clean());
    assert!(manager.wait_for_settled(SETTLE).await);
    let digest = manager.applied_digest();
    assert!(digest.is_some());

    // Second entry is broken: the whole document must be rejected
    let bad = config_json(&[("m", &base, r#""nireq": 8"#), ("n", &base, r#""batch_size": "many""#)]);
    std::fs::write(&config_path, bad).unwrap();
    let err = manager.load_configuration(&config_path).await.unwrap_err();
    assert!(matches!(err, ConfigError::InvalidParameter { parameter: "batch_size", .. }));

    assert_eq!(manager.applied_digest(), digest);
    let served = manager.served_models();
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].version.nireq, 0);
    assert!(manager.entry("n").is_none());
    assert!(manager.get_instance("m", VersionSelector::Default).await.is_ok());
}

#[tokio::test]
async fn test_relative_base_path_resolves_next_to_config() {
    let dir = tempfile::tempdir().unwrap();
    model_tree(&dir.path().join("models"), "m", &[1]);
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        r#"{"model_config_list": [{"config": {"name": "m", "base_path": "models/m"}}]}"#,
    )
    .unwrap();

    let manager = manager(TestBackend::new());
    manager.load_configuration(&config_path).await.unwrap();
    assert!(manager.wait_for_settled(SETTLE).await);
    assert_eq!(manager.config_source(), Some(config_path));
    assert!(manager.get_instance("m", VersionSelector::Default).await.is_ok());
}

#[tokio::test]
async fn test_missing_config_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(TestBackend::new());
    let err = manager.load_configuration(&dir.path().join("absent.json")).await.unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
    assert!(manager.config_source().is_none());
}

#[tokio::test]
async fn test_removed_model_is_retired() {
    let dir = tempfile::tempdir().unwrap();
    let a = model_tree(dir.path(), "a", &[1]);
    let b = model_tree(dir.path(), "b", &[1]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());

    manager
        .apply_document(document(vec![ModelConfig::new("a", &a), ModelConfig::new("b", &b)]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);

    let report = manager.apply_document(document(vec![ModelConfig::new("a", &a)])).await;
    assert_eq!(report.retired_models, vec!["b".to_string()]);
    assert!(manager.wait_for_settled(SETTLE).await);

    assert_eq!(state_of(&manager, "b", 1), VersionState::End);
    assert_eq!(manager.model_status("b", None).unwrap()[0].state, VersionState::End);
    assert!(manager.get_instance("a", VersionSelector::Default).await.is_ok());
    assert_eq!(backend.unloads(), 1);

    // A second pass has nothing left to retire
    let report = manager.reconcile_all().await;
    assert!(report.retired_models.is_empty());
}

#[tokio::test]
async fn test_scan_failure_is_isolated_to_its_model() {
    let dir = tempfile::tempdir().unwrap();
    let good = model_tree(dir.path(), "good", &[1]);
    let manager = manager(TestBackend::new());

    let report = manager
        .apply_document(document(vec![
            ModelConfig::new("ghost", dir.path().join("missing")),
            ModelConfig::new("good", &good),
        ]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);

    assert!(matches!(
        report.failures.get("ghost"),
        Some(ReconcileError::Scan(ScanError::PathInvalid(_)))
    ));
    assert!(manager.get_instance("good", VersionSelector::Default).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_retires_everything() {
    let dir = tempfile::tempdir().unwrap();
    let base = model_tree(dir.path(), "m", &[1, 2]);
    let backend = TestBackend::new();
    let manager = manager(backend.clone());
    manager
        .apply_document(document(vec![ModelConfig::new("m", &base).with_policy(VersionPolicy::All)]))
        .await;
    assert!(manager.wait_for_settled(SETTLE).await);

    manager.shutdown();
    assert!(!manager.is_running());
    assert!(manager.wait_for_settled(SETTLE).await);
    assert_eq!(state_of(&manager, "m", 1), VersionState::End);
    assert_eq!(state_of(&manager, "m", 2), VersionState::End);
    assert_eq!(backend.unloads(), 2);
}
