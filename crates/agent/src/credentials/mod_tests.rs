// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use chrono::TimeZone;
use proptest::prelude::*;

use super::*;

fn credentials(expiry: DateTime<Utc>) -> TemporaryCredentials {
    TemporaryCredentials {
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "secret".into(),
        session_token: "token".into(),
        expiry,
    }
}

#[test]
fn file_format_renders_utc_whole_seconds() {
    let expiry = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
    let file = credentials(expiry).to_file_format();
    assert_eq!(file.version, 1);
    assert_eq!(file.expiration, "2024-03-01T12:30:45Z");
}

#[test]
fn rejects_wrong_version() {
    let mut file = credentials(Utc::now()).to_file_format();
    file.version = 2;
    assert!(matches!(
        TemporaryCredentials::from_file_format(&file),
        Err(CredentialsFileError::BadVersion(2))
    ));
}

#[test]
fn rejects_empty_fields() {
    let mut file = credentials(Utc::now()).to_file_format();
    file.session_token = String::new();
    assert!(matches!(
        TemporaryCredentials::from_file_format(&file),
        Err(CredentialsFileError::EmptyField("SessionToken"))
    ));
}

#[test]
fn rejects_malformed_expiration() {
    let mut file = credentials(Utc::now()).to_file_format();
    file.expiration = "tomorrow-ish".into();
    assert!(matches!(
        TemporaryCredentials::from_file_format(&file),
        Err(CredentialsFileError::BadExpiration(_))
    ));
}

proptest! {
    // Round trip for any whole-second expiry across a wide range of dates.
    #[test]
    fn file_round_trip_is_lossless(seconds in 0i64..4_102_444_800) {
        let expiry = Utc.timestamp_opt(seconds, 0).single().unwrap();
        let original = credentials(expiry);
        let parsed = TemporaryCredentials::from_file_format(&original.to_file_format()).unwrap();
        prop_assert_eq!(parsed, original);
    }
}

#[test]
fn slot_snapshot_is_one_coherent_triple() {
    let slot = Arc::new(CredentialSlot::new(TemporaryCredentials {
        access_key_id: "A0".into(),
        secret_access_key: "S0".into(),
        session_token: "T0".into(),
        expiry: Utc::now(),
    }));

    let writer = Arc::clone(&slot);
    let handle = std::thread::spawn(move || {
        for index in 1..500u32 {
            writer.store(TemporaryCredentials {
                access_key_id: format!("A{index}"),
                secret_access_key: format!("S{index}"),
                session_token: format!("T{index}"),
                expiry: Utc::now(),
            });
        }
    });

    for _ in 0..500 {
        let snapshot = slot.snapshot();
        let generation = snapshot.access_key_id.trim_start_matches('A').to_string();
        assert_eq!(snapshot.secret_access_key, format!("S{generation}"));
        assert_eq!(snapshot.session_token, format!("T{generation}"));
    }
    handle.join().expect("writer thread panicked");
}

#[test]
fn expiry_check() {
    let now = Utc::now();
    assert!(!credentials(now + chrono::Duration::minutes(1)).is_expired(now));
    assert!(credentials(now - chrono::Duration::minutes(1)).is_expired(now));
}
