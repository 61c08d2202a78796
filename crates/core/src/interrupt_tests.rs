// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn wait_elapses_when_not_interrupted() {
    let interrupt = Interrupt::new();
    let outcome = interrupt.wait_for(Duration::from_millis(10)).await;
    assert_eq!(outcome, WaitOutcome::Elapsed);
}

#[tokio::test]
async fn wait_returns_interrupted_when_set_before() {
    let interrupt = Interrupt::new();
    interrupt.set();
    let outcome = interrupt.wait_for(Duration::from_secs(3600)).await;
    assert_eq!(outcome, WaitOutcome::Interrupted);
}

#[tokio::test]
async fn wait_returns_interrupted_when_set_concurrently() {
    let interrupt = Interrupt::new();
    let waiter = interrupt.clone();
    let handle = tokio::spawn(async move { waiter.wait_for(Duration::from_secs(3600)).await });
    tokio::time::sleep(Duration::from_millis(5)).await;
    interrupt.set();
    assert_eq!(handle.await.unwrap(), WaitOutcome::Interrupted);
}

#[tokio::test]
async fn set_is_idempotent_and_sticky() {
    let interrupt = Interrupt::new();
    assert!(!interrupt.is_set());
    interrupt.set();
    interrupt.set();
    assert!(interrupt.is_set());
    assert!(interrupt.clone().is_set());
}
