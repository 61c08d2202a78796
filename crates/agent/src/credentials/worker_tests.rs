// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::Duration as ChronoDuration;

use crate::credentials::files::write_credentials_file;
use crate::testing::{test_credentials, test_identity, FakeDispatch};

use super::*;

#[tokio::test]
async fn fetches_and_caches_credentials_on_first_start() {
    let persist = tempfile::tempdir().unwrap();
    let service = Arc::new(FakeDispatch::new());
    let credentials =
        WorkerCredentials::new(service, test_identity(), persist.path(), Interrupt::new())
            .await
            .unwrap();

    assert_eq!(credentials.snapshot().access_key_id, "AKIDEXAMPLE");
    assert!(persist.path().join("credentials/worker-1.json").is_file());
}

#[tokio::test]
async fn reuses_a_valid_cache_without_calling_the_service() {
    let persist = tempfile::tempdir().unwrap();
    let cache_dir = persist.path().join("credentials");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let cached = TemporaryCredentials {
        access_key_id: "AKIDCACHED".into(),
        secret_access_key: "secret".into(),
        session_token: "token".into(),
        expiry: Utc::now() + ChronoDuration::hours(1),
    };
    write_credentials_file(&cache_dir.join("worker-1.json"), &cached, false).unwrap();

    let service = Arc::new(FakeDispatch::new());
    // Make a would-be service call visible by poisoning the scripted result.
    service.state.lock().fleet_role_results.push_back(Err(
        farmhand_api::ServiceException::AccessDenied { message: "must not be called".into() },
    ));

    let credentials =
        WorkerCredentials::new(service, test_identity(), persist.path(), Interrupt::new())
            .await
            .unwrap();
    assert_eq!(credentials.snapshot().access_key_id, "AKIDCACHED");
}

#[tokio::test]
async fn expired_cache_triggers_a_fresh_fetch() {
    let persist = tempfile::tempdir().unwrap();
    let cache_dir = persist.path().join("credentials");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let stale = TemporaryCredentials {
        access_key_id: "AKIDSTALE".into(),
        secret_access_key: "secret".into(),
        session_token: "token".into(),
        expiry: Utc::now() - ChronoDuration::hours(1),
    };
    write_credentials_file(&cache_dir.join("worker-1.json"), &stale, false).unwrap();

    let service = Arc::new(FakeDispatch::new());
    let credentials =
        WorkerCredentials::new(service, test_identity(), persist.path(), Interrupt::new())
            .await
            .unwrap();
    assert_eq!(credentials.snapshot().access_key_id, "AKIDEXAMPLE");
}

#[tokio::test]
async fn refresh_updates_slot_and_cache() {
    let persist = tempfile::tempdir().unwrap();
    let service = Arc::new(FakeDispatch::new());
    let credentials =
        WorkerCredentials::new(service.clone(), test_identity(), persist.path(), Interrupt::new())
            .await
            .unwrap();

    let mut renewed = test_credentials(ChronoDuration::hours(2));
    renewed.access_key_id = "AKIDRENEWED".into();
    service.state.lock().fleet_role_results.push_back(Ok(renewed));

    credentials.refresh_now().await.unwrap();
    assert_eq!(credentials.snapshot().access_key_id, "AKIDRENEWED");

    let on_disk =
        crate::credentials::files::read_credentials_file(&persist.path().join("credentials/worker-1.json"))
            .unwrap();
    assert_eq!(on_disk.access_key_id, "AKIDRENEWED");
}
