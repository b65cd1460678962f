//! One-shot commands: awaited GET, callback GET, SET and PUBLISH.

mod common;

use common::{Harness, capture_warnings};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use webdis_bridge::bridge::BridgeConfig;
use webdis_bridge::bridge::codec::Command;
use webdis_bridge::bridge::error::TransportError;
use webdis_bridge::{BridgeError, GetCallback};

type Calls = Arc<Mutex<Vec<(String, Value)>>>;

fn recording_callback() -> (Calls, GetCallback) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let callback = GetCallback::foreign(move |key: &str, value: &Value| {
        sink.lock().push((key.to_string(), value.clone()));
    });
    (calls, callback)
}

fn short_get_timeout() -> BridgeConfig {
    BridgeConfig {
        get_timeout_ms: 50,
        ..BridgeConfig::default()
    }
}

#[test]
fn set_writes_then_announces() {
    let mut h = Harness::new();
    h.bridge.set("remote:k", json!({"a": 1}));

    assert_eq!(
        h.gateway.commands(),
        vec![
            Command::Set {
                key: "remote:k".into(),
                value: json!({"a": 1})
            },
            Command::Publish {
                channel: "remote:k_changed".into(),
                value: json!({"a": 1})
            },
        ]
    );
    assert_eq!(h.gateway.stored("remote:k"), Some(json!(r#"{"a":1}"#)));
    assert_eq!(h.settle(), 2);
}

#[test]
fn undecodable_set_reply_is_logged() {
    let mut h = Harness::new();
    h.gateway.answer_with("<html>502 Bad Gateway</html>");

    let log = capture_warnings(|| {
        h.bridge.set("remote:k", json!(1));
        assert_eq!(h.settle(), 2);
    });

    assert!(log.contains("undecodable gateway reply"), "{log}");
    assert!(log.contains("SET"), "{log}");
    assert!(log.contains("PUBLISH"), "{log}");
    assert_eq!(h.bridge.pending_requests(), 0);
}

#[test]
fn rejected_set_is_logged() {
    let mut h = Harness::new();
    h.gateway.answer_with(r#"{"SET":false}"#);

    let log = capture_warnings(|| {
        h.bridge.set("remote:k", json!(1));
        h.settle();
    });

    assert!(log.contains("gateway rejected command"), "{log}");
    assert!(!log.contains("undecodable"), "{log}");
}

#[test]
fn accepted_set_logs_no_warning() {
    let mut h = Harness::new();
    let log = capture_warnings(|| {
        h.bridge.set("remote:k", json!(1));
        h.bridge.publish("news", json!("hi"));
        assert_eq!(h.settle(), 3);
    });
    assert!(log.is_empty(), "{log}");
}

#[test]
fn foreign_callback_fires_once_on_dispatch() {
    let mut h = Harness::new();
    h.gateway.store_value("test:meta:value", json!("hello"));
    let (calls, callback) = recording_callback();

    let request = h.bridge.get_with("test:meta:value", callback);
    assert_eq!(h.bridge.pending_requests(), 1);
    assert!(calls.lock().is_empty());

    h.settle();
    assert_eq!(
        *calls.lock(),
        vec![("test:meta:value".to_string(), json!("hello"))]
    );
    assert_eq!(h.bridge.pending_requests(), 0);

    h.settle();
    assert_eq!(calls.lock().len(), 1);
    assert_ne!(request, h.bridge.get_with("other", recording_callback().1));
}

#[test]
fn native_callback_receives_key_and_value() {
    let mut h = Harness::new();
    h.gateway.store_value("test:meta:value", json!(3));
    let requester = Arc::new(h.host.registry());

    let callback = GetCallback::native(&requester, "getRequestResponse").unwrap();
    h.bridge.get_with("test:meta:value", callback);
    h.settle();

    assert_eq!(h.host.calls(), vec!["getRequestResponse(test:meta:value,3)".to_string()]);
}

#[test]
fn native_callback_must_be_a_handler() {
    let h = Harness::new();
    let requester = Arc::new(h.host.registry());
    assert!(GetCallback::native(&requester, "eventFromCpp").is_err());
    assert!(GetCallback::native(&requester, "nothing").is_err());
}

#[test]
fn failed_get_skips_the_callback() {
    let mut h = Harness::new();
    h.gateway.fail_requests(true);
    let (calls, callback) = recording_callback();

    h.bridge.get_with("k", callback);
    h.settle();

    assert!(calls.lock().is_empty());
    assert_eq!(h.bridge.pending_requests(), 0);
}

#[test]
fn concurrent_callbacks_complete_independently() {
    let mut h = Harness::new();
    h.gateway.store_value("a", json!(1));
    h.gateway.store_value("b", json!(2));
    h.gateway.hold_replies(true);

    let (calls_a, callback_a) = recording_callback();
    let (calls_b, callback_b) = recording_callback();
    h.bridge.get_with("a", callback_a);
    h.bridge.get_with("b", callback_b);
    assert_eq!(h.bridge.pending_requests(), 2);

    h.gateway.release_replies();
    h.settle();

    assert_eq!(*calls_a.lock(), vec![("a".to_string(), json!(1))]);
    assert_eq!(*calls_b.lock(), vec![("b".to_string(), json!(2))]);
}

#[test]
fn callback_is_dropped_with_the_engine() {
    let Harness {
        mut bridge,
        gateway,
        ..
    } = Harness::new();
    gateway.hold_replies(true);
    let (calls, callback) = recording_callback();

    bridge.get_with("k", callback);
    drop(bridge);
    gateway.release_replies();

    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn get_returns_the_stored_value() {
    let mut h = Harness::new();
    h.bridge.set("k", json!("v"));
    assert_eq!(h.bridge.get("k").await.unwrap(), json!("v"));

    h.gateway.store_value("n", json!(5));
    assert_eq!(h.bridge.get("n").await.unwrap(), json!(5));
    assert_eq!(h.bridge.get("missing").await.unwrap(), Value::Null);
    assert_eq!(h.bridge.pending_requests(), 0);
}

#[tokio::test]
async fn get_reports_transport_failures() {
    let mut h = Harness::new();
    h.gateway.fail_requests(true);
    let err = h.bridge.get("k").await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Transport(TransportError::Connection(_))
    ));
    assert_eq!(h.bridge.pending_requests(), 0);
}

#[tokio::test]
async fn get_times_out_and_drops_the_late_reply() {
    let mut h = Harness::with_config(short_get_timeout());
    h.gateway.hold_replies(true);

    let err = h.bridge.get("k").await.unwrap_err();
    match err {
        BridgeError::Timeout { key, elapsed } => {
            assert_eq!(key, "k");
            assert_eq!(elapsed, Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(h.bridge.pending_requests(), 0);

    h.gateway.release_replies();
    assert_eq!(h.settle(), 1);
    assert_eq!(h.bridge.pending_requests(), 0);
}

#[tokio::test]
async fn get_keeps_dispatching_while_waiting() {
    let mut h = Harness::new();
    h.bridge
        .subscribe_to_event("event:from:redis", "eventFromRedis")
        .unwrap();
    h.settle();

    h.gateway.store_value("k", json!("late"));
    h.gateway.hold_replies(true);
    h.gateway.publish_external("event:from:redis", "during");

    let gateway = h.gateway.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        gateway.release_replies();
    });

    assert_eq!(h.bridge.get("k").await.unwrap(), json!("late"));
    assert_eq!(h.host.count("eventFromRedis"), 1);
}
