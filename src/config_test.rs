use std::collections::HashMap;

use super::*;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> =
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
    move |key: &str| map.get(key).cloned()
}

// =============================================================================
// env_parse
// =============================================================================

#[test]
fn env_parse_missing_returns_default() {
    let val: usize = env_parse("__CLASSBOARD_TEST_MISSING_KEY__", 42);
    assert_eq!(val, 42);
}

#[test]
fn env_parse_present_valid() {
    unsafe { std::env::set_var("__CLASSBOARD_TEST_EP_VALID__", "99") };
    let val: usize = env_parse("__CLASSBOARD_TEST_EP_VALID__", 0);
    assert_eq!(val, 99);
    unsafe { std::env::remove_var("__CLASSBOARD_TEST_EP_VALID__") };
}

#[test]
fn env_parse_present_invalid_returns_default() {
    unsafe { std::env::set_var("__CLASSBOARD_TEST_EP_INVALID__", "soon") };
    let val: u64 = env_parse("__CLASSBOARD_TEST_EP_INVALID__", 7);
    assert_eq!(val, 7);
    unsafe { std::env::remove_var("__CLASSBOARD_TEST_EP_INVALID__") };
}

// =============================================================================
// SyncConfig
// =============================================================================

#[test]
fn minimal_settings_use_defaults() {
    let cfg = SyncConfig::from_lookup(lookup_from(&[
        ("CLASSBOARD_ROOM_ID", "room-1"),
        ("CLASSBOARD_USER_NAME", "Ana"),
    ]))
    .expect("config");

    assert_eq!(cfg.server_url, DEFAULT_SERVER_URL);
    assert_eq!(cfg.room_id, "room-1");
    assert_eq!(cfg.identity, UserIdentity { id: None, name: "Ana".into(), email: None });
    assert_eq!(cfg.join_timeout, Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS));
    assert_eq!(cfg.save_timeout, Duration::from_millis(8000));
    assert_eq!(cfg.queue_cap, 500);
    assert_eq!(cfg.reconnect_initial, Duration::from_secs(1));
    assert_eq!(cfg.reconnect_max, Duration::from_secs(10));
}

#[test]
fn overrides_are_parsed() {
    let cfg = SyncConfig::from_lookup(lookup_from(&[
        ("CLASSBOARD_SERVER_URL", "wss://diagrams.example.test/ws"),
        ("CLASSBOARD_ROOM_ID", "room-9"),
        ("CLASSBOARD_USER_NAME", "Luis"),
        ("CLASSBOARD_USER_ID", "u-9"),
        ("CLASSBOARD_USER_EMAIL", "luis@example.test"),
        ("CLASSBOARD_SAVE_TIMEOUT_MS", "250"),
        ("CLASSBOARD_QUEUE_CAP", "3"),
        ("CLASSBOARD_JOIN_RETRY_MS", "not-a-number"),
    ]))
    .expect("config");

    assert_eq!(cfg.server_url, "wss://diagrams.example.test/ws");
    assert_eq!(cfg.identity.id.as_deref(), Some("u-9"));
    assert_eq!(cfg.identity.email.as_deref(), Some("luis@example.test"));
    assert_eq!(cfg.save_timeout, Duration::from_millis(250));
    assert_eq!(cfg.queue_cap, 3);
    assert_eq!(cfg.join_retry, Duration::from_millis(DEFAULT_JOIN_RETRY_MS));
}

#[test]
fn missing_room_is_an_error() {
    let err = SyncConfig::from_lookup(lookup_from(&[("CLASSBOARD_USER_NAME", "Ana")]))
        .expect_err("room required");
    assert_eq!(err, ConfigError::Missing("CLASSBOARD_ROOM_ID"));
}

#[test]
fn blank_user_name_is_an_error() {
    let err = SyncConfig::from_lookup(lookup_from(&[
        ("CLASSBOARD_ROOM_ID", "room-1"),
        ("CLASSBOARD_USER_NAME", "   "),
    ]))
    .expect_err("name required");
    assert_eq!(err, ConfigError::Missing("CLASSBOARD_USER_NAME"));
}

#[test]
fn http_url_is_rejected() {
    let err = SyncConfig::from_lookup(lookup_from(&[
        ("CLASSBOARD_SERVER_URL", "http://localhost:3001"),
        ("CLASSBOARD_ROOM_ID", "room-1"),
        ("CLASSBOARD_USER_NAME", "Ana"),
    ]))
    .expect_err("url");
    assert!(matches!(err, ConfigError::InvalidUrl(_)));
}

#[test]
fn zero_queue_cap_is_rejected() {
    let err = SyncConfig::from_lookup(lookup_from(&[
        ("CLASSBOARD_ROOM_ID", "room-1"),
        ("CLASSBOARD_USER_NAME", "Ana"),
        ("CLASSBOARD_QUEUE_CAP", "0"),
    ]))
    .expect_err("cap");
    assert_eq!(err, ConfigError::Zero("queue_cap"));
}
