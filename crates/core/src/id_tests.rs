// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;

use super::*;

#[test]
fn round_trips_through_display() {
    let id = SessionId::new("session-0123456789abcdef");
    assert_eq!(id.to_string(), "session-0123456789abcdef");
    assert_eq!(id.as_str(), "session-0123456789abcdef");
}

#[test]
fn compares_against_str() {
    let id = QueueId::from("queue-abc");
    assert_eq!(id, "queue-abc");
    assert_eq!(id, *"queue-abc");
}

#[test]
fn serde_is_transparent() {
    let id = ActionId::new("sessionaction-42");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"sessionaction-42\"");
    let back: ActionId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn borrow_str_enables_map_lookup() {
    let mut map: HashMap<ActionId, u32> = HashMap::new();
    map.insert(ActionId::new("sessionaction-1"), 1);
    assert_eq!(map.get("sessionaction-1"), Some(&1));
    assert_eq!(map.get("sessionaction-2"), None);
}
