// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::Duration as ChronoDuration;
use farmhand_api::ServiceException;

use crate::testing::{test_credentials, test_identity, FakeDispatch};

use super::*;

async fn make(
    service: Arc<FakeDispatch>,
    persist: &std::path::Path,
    home: &std::path::Path,
) -> QueueCredentials {
    QueueCredentials::new(
        service,
        test_identity(),
        QueueId::new("queue-1"),
        None,
        persist,
        Some(home.to_path_buf()),
        Interrupt::new(),
    )
    .await
    .expect("queue credentials should install")
}

#[tokio::test]
async fn new_installs_cache_script_and_profiles() {
    let persist = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let service = Arc::new(FakeDispatch::new());
    let credentials = make(service, persist.path(), home.path()).await;

    assert_eq!(credentials.profile_name(), "deadline-queue-1");
    let dir = persist.path().join("queues/queue-1");
    assert!(dir.join("credentials.json").is_file());
    let script = std::fs::read_to_string(dir.join("get_aws_credentials.sh")).unwrap();
    assert!(script.contains("credentials.json"));

    let config = std::fs::read_to_string(home.path().join(".aws/config")).unwrap();
    assert!(config.contains("[profile deadline-queue-1]"));
    let creds_file = std::fs::read_to_string(home.path().join(".aws/credentials")).unwrap();
    assert!(creds_file.contains("[deadline-queue-1]"));
}

#[tokio::test]
async fn refresh_rewrites_the_cache_file() {
    let persist = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let service = Arc::new(FakeDispatch::new());
    let credentials = make(service.clone(), persist.path(), home.path()).await;

    let mut renewed = test_credentials(ChronoDuration::hours(2));
    renewed.access_key_id = "AKIDRENEWED".into();
    service.state.lock().queue_role_results.push_back(Ok(renewed));

    credentials.refresh_now().await.unwrap();

    assert_eq!(credentials.snapshot().access_key_id, "AKIDRENEWED");
    let file = super::super::files::read_credentials_file(
        &persist.path().join("queues/queue-1/credentials.json"),
    )
    .unwrap();
    assert_eq!(file.access_key_id, "AKIDRENEWED");
}

#[tokio::test]
async fn cleanup_removes_directory_and_profile() {
    let persist = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let service = Arc::new(FakeDispatch::new());
    let credentials = make(service, persist.path(), home.path()).await;

    credentials.cleanup();

    assert!(!persist.path().join("queues/queue-1").exists());
    let config = std::fs::read_to_string(home.path().join(".aws/config")).unwrap();
    assert!(!config.contains("deadline-queue-1"));
}

#[tokio::test]
async fn initial_access_denied_propagates_as_conditionally_recoverable() {
    let persist = tempfile::tempdir().unwrap();
    let service = Arc::new(FakeDispatch::new());
    service
        .state
        .lock()
        .queue_role_results
        .push_back(Err(ServiceException::AccessDenied { message: "denied".into() }));

    let error = QueueCredentials::new(
        service,
        test_identity(),
        QueueId::new("queue-1"),
        None,
        persist.path(),
        None,
        Interrupt::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        error,
        CredentialsError::Request(RequestError::ConditionallyRecoverable(_))
    ));
}
