//! Integration tests for common apnkit workflows.
//!
//! These drive whole runs through the in-memory store and mock transport.

use apnkit::prelude::*;
use apnkit::{Frame, MockConnector, NotificationRef, Scope};
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

fn token(byte: u8) -> DeviceToken {
    DeviceToken::from_bytes(&[byte; 32])
}

fn feedback_record(seconds: u32, byte: u8) -> Vec<u8> {
    let mut record = seconds.to_be_bytes().to_vec();
    record.extend_from_slice(&32u16.to_be_bytes());
    record.extend_from_slice(&[byte; 32]);
    record
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn test_missing_credential_does_not_block_other_apps() {
    let store = Arc::new(MemoryStore::new());
    store.insert_app(App::new(1, "First").prod_cert(Credential::from_pem("first")));
    store.insert_app(App::new(2, "Uncertified"));
    store.insert_app(App::new(3, "Third").prod_cert(Credential::from_pem("third")));

    let mut queued = Vec::new();
    for app_id in 1..=3u64 {
        store.insert_device(Device::new(app_id, Some(app_id), token(app_id as u8)));
        queued.push(store.queue_notification(app_id, Notification::new().alert(format!("app {}", app_id))));
    }

    let connector = MockConnector::new();
    let runner = PushRunner::new(store.clone(), Arc::new(connector.clone()), Environment::Production);
    let report = runner.send_notifications().await.unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.total_sent(), 2);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Scope::App(2));
    assert!(matches!(failures[0].1, PushError::MissingCredential(_)));

    assert!(store.sent_at(NotificationRef::Device(queued[0])).is_some());
    assert!(store.sent_at(NotificationRef::Device(queued[1])).is_none());
    assert!(store.sent_at(NotificationRef::Device(queued[2])).is_some());

    assert_eq!(
        connector.credentials(),
        vec![Credential::from_pem("first"), Credential::from_pem("third")]
    );
    assert!(connector.all_closed());
}

#[tokio::test]
async fn test_sent_at_is_never_reset() {
    let store = Arc::new(MemoryStore::new());
    store.insert_app(App::new(1, "App").prod_cert(Credential::from_pem("cert")));
    store.insert_device(Device::new(1, Some(1), token(1)));
    let id = store.queue_notification(1, Notification::new().badge(3));

    let connector = MockConnector::new();
    let runner = PushRunner::new(store.clone(), Arc::new(connector.clone()), Environment::Production);

    runner.send_notifications().await.unwrap();
    let first = store.sent_at(NotificationRef::Device(id)).unwrap();

    let report = runner.send_notifications().await.unwrap();
    assert_eq!(report.total_sent(), 0);
    assert_eq!(store.sent_at(NotificationRef::Device(id)), Some(first));
    // nothing pending, so no second session
    assert_eq!(connector.connection_count(), 1);
}

#[tokio::test]
async fn test_long_alert_is_truncated_on_the_wire() {
    let store = Arc::new(MemoryStore::new());
    store.insert_app(App::new(1, "App").prod_cert(Credential::from_pem("cert")));
    store.insert_device(Device::new(1, Some(1), token(1)));
    store.queue_notification(1, Notification::new().alert("a".repeat(200)));

    let connector = MockConnector::new();
    PushRunner::new(store, Arc::new(connector.clone()), Environment::Production)
        .send_notifications()
        .await
        .unwrap();

    let frames = Frame::decode_all(&connector.written()).unwrap();
    let expected_alert = format!("{}...", "a".repeat(147));
    assert_eq!(
        frames[0].payload,
        format!(r#"{{"aps":{{"alert":"{}"}}}}"#, expected_alert)
    );
}

#[tokio::test]
async fn test_group_notifications_with_legacy_policy() {
    let store = Arc::new(MemoryStore::new());
    store.insert_app(App::new(1, "App").prod_cert(Credential::from_pem("cert")));
    let group = store.insert_group(1, 1, "testers").unwrap();
    store.insert_device(Device::new(1, Some(1), token(1)));
    store.insert_device(Device::new(2, Some(1), "not a token"));
    store.add_to_group(group.id, 1).unwrap();
    store.add_to_group(group.id, 2).unwrap();
    let id = store.queue_group_notification(group.id, Notification::new().alert("release 2.0"));

    let connector = MockConnector::new();
    let report = PushRunner::new(store.clone(), Arc::new(connector.clone()), Environment::Production)
        .with_policy(DeliveryPolicy::legacy())
        .send_group_notifications()
        .await
        .unwrap();

    let outcome = report.outcome(Scope::App(1)).unwrap().as_ref().unwrap();
    assert_eq!((outcome.sent, outcome.frames, outcome.skipped), (1, 1, 1));
    assert!(store.sent_at(NotificationRef::Group(id)).is_some());
    assert_eq!(Frame::decode_all(&connector.written()).unwrap().len(), 1);
}

// =============================================================================
// Feedback
// =============================================================================

#[tokio::test]
async fn test_feedback_removes_stale_and_keeps_reregistered() {
    let feedback_at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();

    let store = Arc::new(MemoryStore::new());
    store.insert_app(App::new(1, "App").prod_cert(Credential::from_pem("cert")));
    store.insert_device(Device::new(1, Some(1), token(1)).registered_at(feedback_at - Duration::hours(1)));
    store.insert_device(Device::new(2, Some(1), token(2)).registered_at(feedback_at + Duration::hours(1)));
    store.insert_device(Device::new(3, None, token(3)).registered_at(feedback_at - Duration::days(7)));

    let mut bytes = feedback_record(1_700_000_000, 1);
    bytes.extend(feedback_record(1_700_000_000, 2));
    bytes.extend(feedback_record(1_700_000_000, 3));
    bytes.extend(feedback_record(1_700_000_000, 9));
    let connector = MockConnector::new().with_feedback(bytes);

    let report = PushRunner::new(store.clone(), Arc::new(connector.clone()), Environment::Production)
        .with_global_credential(Credential::from_pem("global"))
        .process_devices()
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.total_removed(), 2);
    assert!(store.device(1).is_none());
    assert!(store.device(2).is_some());
    assert!(store.device(3).is_none());
    assert_eq!(connector.connection_count(), 2);
}

#[tokio::test]
async fn test_truncated_feedback_fails_only_that_scope() {
    let store = Arc::new(MemoryStore::new());
    store.insert_app(App::new(1, "App").prod_cert(Credential::from_pem("cert")));
    store.insert_device(Device::new(1, Some(1), token(1)).registered_at(Utc::now() - Duration::days(1)));

    let mut bytes = feedback_record(2_000_000_000, 1);
    bytes.truncate(20);
    let connector = MockConnector::new().with_feedback(bytes);

    let report = PushRunner::new(store.clone(), Arc::new(connector.clone()), Environment::Production)
        .process_devices()
        .await
        .unwrap();

    assert!(matches!(
        report.outcome(Scope::App(1)),
        Some(Err(PushError::TruncatedFeedback { got: 20, expected: 38 }))
    ));
    assert!(store.device(1).is_some());
    assert!(connector.all_closed());
}
