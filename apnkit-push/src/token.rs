//! Device token normalization and encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PushError, Result};

/// Raw length of an APNs device token.
pub const TOKEN_LEN: usize = 32;

/// Hex characters per group in the canonical storage form.
const GROUP_WIDTH: usize = 8;

/// Device token as registered by the device.
///
/// The stored form is whatever the device reported, commonly
/// `<abcd1234 ...>` as printed by `NSData`. Comparisons and encoding
/// go through [`DeviceToken::hex`], which strips whitespace and angle
/// brackets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceToken(String);

impl DeviceToken {
    /// Create a device token from its registered form.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Build the canonical grouped form from raw token bytes.
    ///
    /// Produces lowercase hex in space separated groups of eight
    /// characters, e.g. `"abcd1234 00ff00ff ..."`.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let hex = hex::encode(raw);
        let grouped = hex
            .as_bytes()
            .chunks(GROUP_WIDTH)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ");
        Self(grouped)
    }

    /// The token as registered.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Normalized lowercase hex with whitespace and angle brackets removed.
    pub fn hex(&self) -> String {
        self.0
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '<' && *c != '>')
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    /// Decode the normalized hex into raw bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(self.hex())
            .map_err(|e| PushError::InvalidToken(format!("{}: {}", self.0, e)))
    }

    /// Decode into the fixed-size form the gateway expects.
    pub fn to_wire(&self) -> Result<[u8; TOKEN_LEN]> {
        let bytes = self.to_bytes()?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            PushError::InvalidToken(format!(
                "{}: expected {} bytes, got {}",
                self.0,
                TOKEN_LEN,
                bytes.len()
            ))
        })
    }

    /// Canonical grouped storage form of this token.
    pub fn canonical(&self) -> Result<Self> {
        Ok(Self::from_bytes(&self.to_bytes()?))
    }
}

impl PartialEq for DeviceToken {
    fn eq(&self, other: &Self) -> bool {
        self.hex() == other.hex()
    }
}

impl Eq for DeviceToken {}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for DeviceToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}
