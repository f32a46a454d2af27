//! Notification content types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Longest alert kept, truncation marker included.
pub const MAX_ALERT_CHARS: usize = 150;

/// Appended to alerts cut at [`MAX_ALERT_CHARS`].
pub const TRUNCATION_MARKER: &str = "...";

/// Sound file the device plays when the sound flag is set without a name.
pub const DEFAULT_SOUND: &str = "1.aiff";

/// Sound to play on delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sound {
    /// The default sound file.
    Default,
    /// A named sound file bundled with the app.
    Named(String),
}

impl Sound {
    /// Sound file name sent to the device.
    pub fn file_name(&self) -> &str {
        match self {
            Self::Default => DEFAULT_SOUND,
            Self::Named(name) => name,
        }
    }
}

/// Stored as `true` for the default sound or the file name.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SoundValue {
    Flag(bool),
    Name(String),
}

impl Serialize for Sound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Default => SoundValue::Flag(true).serialize(serializer),
            Self::Named(name) => SoundValue::Name(name.clone()).serialize(serializer),
        }
    }
}

fn deserialize_sound<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Sound>, D::Error> {
    Ok(match Option::<SoundValue>::deserialize(deserializer)? {
        Some(SoundValue::Flag(true)) => Some(Sound::Default),
        Some(SoundValue::Name(name)) => Some(Sound::Named(name)),
        Some(SoundValue::Flag(false)) | None => None,
    })
}

fn deserialize_alert<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.map(truncate_alert))
}

/// Cut an alert to [`MAX_ALERT_CHARS`] characters, marker included.
pub fn truncate_alert(message: String) -> String {
    if message.chars().count() <= MAX_ALERT_CHARS {
        return message;
    }
    let keep = MAX_ALERT_CHARS - TRUNCATION_MARKER.chars().count();
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Content of a push notification.
///
/// The alert is truncated when assigned, so the stored value is always
/// the one that goes on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, deserialize_with = "deserialize_alert", skip_serializing_if = "Option::is_none")]
    alert: Option<String>,
    /// Badge count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    /// Sound to play.
    #[serde(default, deserialize_with = "deserialize_sound", skip_serializing_if = "Option::is_none")]
    pub sound: Option<Sound>,
    /// Custom properties, in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_properties: Vec<(String, String)>,
}

impl Notification {
    /// Create an empty notification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the alert text.
    pub fn alert(mut self, message: impl Into<String>) -> Self {
        self.set_alert(message);
        self
    }

    /// Set the alert text in place.
    pub fn set_alert(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.alert = if message.is_empty() {
            None
        } else {
            Some(truncate_alert(message))
        };
    }

    /// Stored alert text.
    pub fn alert_text(&self) -> Option<&str> {
        self.alert.as_deref()
    }

    /// Set the badge count.
    pub fn badge(mut self, count: u32) -> Self {
        self.badge = Some(count);
        self
    }

    /// Play a named sound file.
    pub fn sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = Some(Sound::Named(sound.into()));
        self
    }

    /// Play the default sound file.
    pub fn default_sound(mut self) -> Self {
        self.sound = Some(Sound::Default);
        self
    }

    /// Add a custom property. The value is stored in its string form.
    pub fn custom(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.custom_properties.push((key.into(), value.to_string()));
        self
    }
}
