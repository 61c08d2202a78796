// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::testing::FakeRemoteLog;

use super::*;

fn awslogs(group: &str, stream: &str) -> LogConfiguration {
    LogConfiguration {
        log_driver: LOG_DRIVER_AWSLOGS.into(),
        options: HashMap::from([
            ("logGroupName".to_string(), group.to_string()),
            ("logStreamName".to_string(), stream.to_string()),
        ]),
        parameters: HashMap::new(),
        error: None,
    }
}

#[test]
fn valid_configuration_is_accepted() {
    let config = SessionLogConfig::from_assignment(Some(&awslogs("g", "s")), None).unwrap();
    assert_eq!(config.group(), "g");
    assert_eq!(config.stream(), "s");
}

#[test]
fn missing_configuration_is_a_provisioning_error() {
    let error = SessionLogConfig::from_assignment(None, None).unwrap_err();
    assert!(matches!(error, LogProvisioningError::Missing));
}

#[test]
fn unknown_driver_is_rejected() {
    let mut log = awslogs("g", "s");
    log.log_driver = "syslog".into();
    let error = SessionLogConfig::from_assignment(Some(&log), None).unwrap_err();
    assert!(matches!(error, LogProvisioningError::UnsupportedDriver(driver) if driver == "syslog"));
}

#[test]
fn service_error_field_is_surfaced() {
    let mut log = awslogs("g", "s");
    log.error = Some("no permissions to the log group".into());
    let error = SessionLogConfig::from_assignment(Some(&log), None).unwrap_err();
    assert!(error.to_string().contains("no permissions"));
}

#[test]
fn missing_options_are_rejected() {
    let mut log = awslogs("g", "s");
    log.options.remove("logStreamName");
    let error = SessionLogConfig::from_assignment(Some(&log), None).unwrap_err();
    assert!(matches!(error, LogProvisioningError::MissingOption("logStreamName")));
}

#[test]
fn update_parameters_replaces_previous_values() {
    let mut log = awslogs("g", "s");
    log.parameters.insert("interval".into(), "15".into());
    let config = SessionLogConfig::from_assignment(Some(&log), None).unwrap();
    config.update_parameters(HashMap::from([("interval".to_string(), "60".to_string())]));
    assert_eq!(config.parameters().get("interval").map(String::as_str), Some("60"));
}

#[tokio::test]
async fn attach_writes_local_file_and_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session-1.log");
    let config =
        SessionLogConfig::from_assignment(Some(&awslogs("g", "s")), Some(path.clone())).unwrap();
    let client = Arc::new(FakeRemoteLog::new());
    let (logger, handle) = config.attach(client.clone()).unwrap();

    logger.log("hello");
    logger.log("");
    handle.close().await;

    let local = std::fs::read_to_string(&path).unwrap();
    assert_eq!(local, "hello\n \n");
    assert_eq!(client.total_events(), 2);
    let batches = client.batches.lock();
    let messages: Vec<String> =
        batches.iter().flatten().map(|event| event.message.clone()).collect();
    assert!(messages.contains(&"hello".to_string()));
    assert!(messages.contains(&" ".to_string()), "blank lines are padded to one space");
}

#[test]
fn worker_log_target_is_lenient() {
    assert_eq!(worker_log_target(&awslogs("g", "s")), Some(("g".into(), "s".into())));

    let mut other = awslogs("g", "s");
    other.log_driver = "journald".into();
    assert_eq!(worker_log_target(&other), None);

    let mut missing = awslogs("g", "s");
    missing.options.clear();
    assert_eq!(worker_log_target(&missing), None);
}
