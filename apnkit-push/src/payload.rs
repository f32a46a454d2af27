//! JSON payload construction.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tracing::warn;

use crate::{Notification, Result};

/// Key of the Apple dictionary in the payload.
const APS_KEY: &str = "aps";

/// Build the JSON payload for a notification.
///
/// Only present fields appear in the `aps` dictionary; custom properties
/// become top-level string siblings of `aps`. Size is not checked here,
/// the framer enforces the gateway limit.
pub fn build_payload(notification: &Notification) -> Result<String> {
    Ok(serde_json::to_string(&ApnsPayload::from(notification))?)
}

struct ApnsPayload<'a> {
    aps: ApnsAps<'a>,
    custom: &'a [(String, String)],
}

#[derive(Serialize)]
struct ApnsAps<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
}

impl<'a> From<&'a Notification> for ApnsPayload<'a> {
    fn from(notification: &'a Notification) -> Self {
        Self {
            aps: ApnsAps {
                alert: notification.alert_text(),
                badge: notification.badge,
                sound: notification.sound.as_ref().map(|s| s.file_name()),
            },
            custom: &notification.custom_properties,
        }
    }
}

impl Serialize for ApnsPayload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(APS_KEY, &self.aps)?;
        for (key, value) in self.custom {
            if key == APS_KEY {
                warn!("Custom property `aps` dropped from payload");
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
