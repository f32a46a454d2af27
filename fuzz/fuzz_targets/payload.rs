//! Fuzz target for payload building.
//!
//! Builds payloads from arbitrary notification fields and checks the
//! output is valid JSON with `aps` first and the alert truncated.

#![no_main]

use apnkit_push::{build_payload, Notification, MAX_ALERT_CHARS};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct FuzzNotification {
    alert: Option<String>,
    badge: Option<u32>,
    sound: Option<Option<String>>,
    custom: Vec<(String, String)>,
}

fuzz_target!(|data: FuzzNotification| {
    let mut notification = Notification::new();
    if let Some(alert) = data.alert {
        notification = notification.alert(alert);
    }
    if let Some(badge) = data.badge {
        notification = notification.badge(badge);
    }
    match data.sound {
        Some(Some(name)) => notification = notification.sound(name),
        Some(None) => notification = notification.default_sound(),
        None => {}
    }
    for (key, value) in data.custom {
        notification = notification.custom(key, value);
    }

    if let Some(alert) = notification.alert_text() {
        assert!(alert.chars().count() <= MAX_ALERT_CHARS);
    }

    let payload = build_payload(&notification).expect("payload");
    assert!(payload.starts_with(r#"{"aps":"#));
    let value: serde_json::Value = serde_json::from_str(&payload).expect("valid json");
    assert!(value["aps"].is_object());
});
