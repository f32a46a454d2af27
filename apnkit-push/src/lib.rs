//! # apnkit Push
//!
//! Delivery of Apple push notifications over the legacy binary gateway
//! protocol, and pruning of stale devices from the feedback service.
//!
//! ## Features
//!
//! - **Payloads**: `aps` dictionary plus custom properties, alert truncation
//! - **Framing**: 256-byte payload limit, 32-byte device tokens
//! - **Batches**: one TLS session per credential scope, notifications marked
//!   sent as their frames are written
//! - **Groups**: one payload fanned out to every device of a group
//! - **Feedback**: fixed-size records resolved to devices and removed when
//!   the device has not registered since
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use apnkit_push::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = PushSettings::load(None)?;
//!     let store = Arc::new(MemoryStore::new());
//!
//!     store.insert_app(App::new(1, "My App").prod_cert(Credential::from_file("prod.pem")?));
//!     store.insert_device(Device::new(1, Some(1), "<740f4707 bebcf74f 9b7c25d4 8e335894 5f6aa01d a5ddb387 462c7eaf 61bb78ad>"));
//!     store.queue_notification(1, Notification::new().alert("Hello!").badge(5).sound("my_sound.aiff"));
//!
//!     let runner = PushRunner::from_settings(store, &settings)?;
//!     let report = runner.send_notifications().await?;
//!     println!("sent {}", report.total_sent());
//!
//!     runner.process_devices().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Single Notification
//!
//! ```
//! use apnkit_push::{build_payload, encode_frame, DeviceToken, Notification};
//!
//! let notification = Notification::new().alert("Hello!").badge(5).sound("my_sound.aiff");
//! let payload = build_payload(&notification).unwrap();
//! assert_eq!(payload, r#"{"aps":{"alert":"Hello!","badge":5,"sound":"my_sound.aiff"}}"#);
//!
//! let token = DeviceToken::from_bytes(&[0xab; 32]);
//! let frame = encode_frame(&token, &payload).unwrap();
//! assert_eq!(frame.len(), 37 + payload.len());
//! ```

mod connection;
mod credential;
mod delivery;
mod error;
mod feedback;
mod frame;
mod mock;
mod notification;
mod payload;
mod runner;
mod settings;
mod store;
mod token;

pub use connection::{
    with_connection, Connector, Endpoint, Environment, Gateway, Session, SessionStream, Timeouts,
    TlsConnector,
};
pub use credential::{require_credential, Credential};
pub use delivery::{
    encode_notification, DeliveryEngine, DeliveryPolicy, DeliveryReport, OversizePolicy, Scope,
};
pub use error::{PushError, Result};
pub use feedback::{
    is_removable, read_feedback, FeedbackProcessor, FeedbackRecord, FeedbackReport,
    FeedbackStream, RECORD_LEN,
};
pub use frame::{encode_frame, Frame, COMMAND_SIMPLE, HEADER_LEN, MAX_PAYLOAD_BYTES};
pub use mock::MockConnector;
pub use notification::{
    truncate_alert, Notification, Sound, DEFAULT_SOUND, MAX_ALERT_CHARS, TRUNCATION_MARKER,
};
pub use payload::build_payload;
pub use runner::{PushRunner, RunReport, ScopeOutcome};
pub use settings::{PushSettings, ENV_PREFIX};
pub use store::{
    App, AppId, DataStore, Device, DeviceId, DeviceNotification, Group, GroupId,
    GroupNotification, MemoryStore, NotificationId, NotificationRef,
};
pub use token::{DeviceToken, TOKEN_LEN};

/// Prelude for common imports.
///
/// ```
/// use apnkit_push::prelude::*;
/// ```
pub mod prelude {
    pub use crate::connection::{Connector, Environment, TlsConnector};
    pub use crate::credential::Credential;
    pub use crate::delivery::{DeliveryEngine, DeliveryPolicy, OversizePolicy, Scope};
    pub use crate::error::{PushError, Result};
    pub use crate::feedback::FeedbackProcessor;
    pub use crate::notification::{Notification, Sound};
    pub use crate::runner::{PushRunner, RunReport};
    pub use crate::settings::PushSettings;
    pub use crate::store::{App, DataStore, Device, Group, MemoryStore};
    pub use crate::token::DeviceToken;
}
