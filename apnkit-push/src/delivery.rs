//! Batch delivery of pending notifications.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::connection::{with_connection, Connector, Gateway, Session};
use crate::credential::require_credential;
use crate::frame::encode_frame;
use crate::payload::build_payload;
use crate::store::{AppId, DataStore, Device, DeviceNotification, GroupNotification, NotificationRef};
use crate::{Credential, DeviceToken, Notification, PushError, Result};

/// What to do when a single notification cannot be framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Stop the batch and return the error.
    #[default]
    Abort,
    /// Log, leave the notification pending and continue.
    Skip,
}

impl FromStr for OversizePolicy {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" | "continue" => Ok(Self::Skip),
            other => Err(PushError::Config(format!("unknown oversize policy: {}", other))),
        }
    }
}

/// Framing failure policy per notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryPolicy {
    /// Per-device notifications.
    pub device: OversizePolicy,
    /// Group notifications.
    pub group: OversizePolicy,
}

impl DeliveryPolicy {
    /// Abort device batches, skip within group batches.
    pub fn legacy() -> Self {
        Self {
            device: OversizePolicy::Abort,
            group: OversizePolicy::Skip,
        }
    }
}

/// Credential scope of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// An application's own certificate.
    App(AppId),
    /// The global fallback certificate.
    Global,
}

impl Scope {
    /// App filter for device queries.
    pub fn app_id(self) -> Option<AppId> {
        match self {
            Self::App(id) => Some(id),
            Self::Global => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::App(id) => write!(f, "app {}", id),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Counters for one delivery batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Notifications marked sent.
    pub sent: usize,
    /// Frames written to the gateway.
    pub frames: usize,
    /// Frames skipped under [`OversizePolicy::Skip`].
    pub skipped: usize,
}

/// Build the payload and wire frame for one device.
pub fn encode_notification(token: &DeviceToken, notification: &Notification) -> Result<Bytes> {
    encode_frame(token, &build_payload(notification)?)
}

/// Writes pending notifications over one session per batch.
pub struct DeliveryEngine<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    connector: Arc<C>,
    policy: DeliveryPolicy,
}

impl<S, C> DeliveryEngine<S, C>
where
    S: DataStore + ?Sized,
    C: Connector + ?Sized,
{
    /// Create an engine with the default (abort) policy.
    pub fn new(store: Arc<S>, connector: Arc<C>) -> Self {
        Self {
            store,
            connector,
            policy: DeliveryPolicy::default(),
        }
    }

    /// Set the framing failure policy.
    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current policy.
    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Deliver pending per-device notifications of `scope`.
    ///
    /// Each notification is marked sent right after its frame is written.
    /// An error ends the batch; notifications already marked stay sent.
    pub async fn deliver(&self, credential: Option<&Credential>, scope: Scope) -> Result<DeliveryReport> {
        let credential = require_credential(credential, &scope.to_string())?;

        let batch = match self.pending_device_notifications(scope).await {
            Ok(batch) => batch,
            Err(e) => return log_batch(scope, "notifications", Err(e)),
        };
        if batch.is_empty() {
            debug!(%scope, "No pending notifications");
            return Ok(DeliveryReport::default());
        }

        let policy = self.policy.device;
        let result = with_connection(
            &*self.connector,
            Some(credential),
            Gateway::Delivery,
            async |session: &mut Session| {
                let mut report = DeliveryReport::default();
                for (device, pending) in &batch {
                    let frame = match encode_notification(&device.token, &pending.notification) {
                        Ok(frame) => frame,
                        Err(e) if e.is_framing_error() && policy == OversizePolicy::Skip => {
                            warn!(
                                %scope,
                                device_id = device.id,
                                notification_id = pending.id,
                                error = %e,
                                "Skipping notification"
                            );
                            report.skipped += 1;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    session.write_all(&frame).await?;
                    report.frames += 1;
                    self.store
                        .mark_sent(NotificationRef::Device(pending.id), Utc::now())
                        .await?;
                    report.sent += 1;
                    debug!(%scope, device_id = device.id, notification_id = pending.id, "Notification sent");
                }
                Ok(report)
            },
        )
        .await;

        log_batch(scope, "notifications", result)
    }

    /// Deliver every pending group notification of an app.
    pub async fn deliver_group_notifications(
        &self,
        credential: Option<&Credential>,
        app_id: AppId,
    ) -> Result<DeliveryReport> {
        let scope = Scope::App(app_id);
        let credential = require_credential(credential, &scope.to_string())?;

        let batch = match self.pending_group_notifications(app_id).await {
            Ok(batch) => batch,
            Err(e) => return log_batch(scope, "group notifications", Err(e)),
        };
        if batch.is_empty() {
            debug!(%scope, "No pending group notifications");
            return Ok(DeliveryReport::default());
        }

        let result = self.write_group_batch(credential, scope, &batch).await;
        log_batch(scope, "group notifications", result)
    }

    /// Deliver one group notification for an app, whether or not it was sent before.
    pub async fn deliver_group_notification(
        &self,
        credential: Option<&Credential>,
        app_id: AppId,
        notification: &GroupNotification,
    ) -> Result<DeliveryReport> {
        let scope = Scope::App(app_id);
        let credential = require_credential(credential, &scope.to_string())?;

        let devices = match self.group_members(app_id, notification).await {
            Ok(devices) => devices,
            Err(e) => return log_batch(scope, "group notification", Err(e)),
        };
        if devices.is_empty() {
            debug!(%scope, group_id = notification.group_id, "Group has no devices");
            return Ok(DeliveryReport::default());
        }

        let batch = [(notification.clone(), devices)];
        let result = self.write_group_batch(credential, scope, &batch).await;
        log_batch(scope, "group notification", result)
    }

    async fn pending_device_notifications(&self, scope: Scope) -> Result<Vec<(Device, DeviceNotification)>> {
        let mut batch = Vec::new();
        for device in self.store.devices_for_application(scope.app_id()).await? {
            for pending in self.store.unsent_notifications_for_device(&device).await? {
                batch.push((device.clone(), pending));
            }
        }
        Ok(batch)
    }

    // Groups without devices are left out, so their notifications stay pending.
    async fn pending_group_notifications(&self, app_id: AppId) -> Result<Vec<(GroupNotification, Vec<Device>)>> {
        let mut batch = Vec::new();
        for group in self.store.groups_for_application(app_id).await? {
            let pending = self.store.unsent_group_notifications_for_group(&group).await?;
            if pending.is_empty() {
                continue;
            }
            let devices = self.store.devices_for_group(&group).await?;
            if devices.is_empty() {
                debug!(app_id, group_id = group.id, pending = pending.len(), "Group has no devices");
                continue;
            }
            for notification in pending {
                batch.push((notification, devices.clone()));
            }
        }
        Ok(batch)
    }

    async fn group_members(&self, app_id: AppId, notification: &GroupNotification) -> Result<Vec<Device>> {
        let group = self
            .store
            .groups_for_application(app_id)
            .await?
            .into_iter()
            .find(|g| g.id == notification.group_id)
            .ok_or_else(|| {
                PushError::Store(format!(
                    "group {} does not belong to app {}",
                    notification.group_id, app_id
                ))
            })?;
        self.store.devices_for_group(&group).await
    }

    async fn write_group_batch(
        &self,
        credential: &Credential,
        scope: Scope,
        batch: &[(GroupNotification, Vec<Device>)],
    ) -> Result<DeliveryReport> {
        let policy = self.policy.group;
        with_connection(
            &*self.connector,
            Some(credential),
            Gateway::Delivery,
            async |session: &mut Session| {
                let mut report = DeliveryReport::default();
                for (group_notification, devices) in batch {
                    let payload = build_payload(&group_notification.notification)?;
                    let mut written = 0;
                    let mut failed = 0;

                    for device in devices {
                        let frame = match encode_frame(&device.token, &payload) {
                            Ok(frame) => frame,
                            Err(e) if e.is_framing_error() && policy == OversizePolicy::Skip => {
                                warn!(
                                    %scope,
                                    device_id = device.id,
                                    notification_id = group_notification.id,
                                    error = %e,
                                    "Skipping group notification for device"
                                );
                                failed += 1;
                                continue;
                            }
                            Err(e) => return Err(e),
                        };
                        session.write_all(&frame).await?;
                        written += 1;
                    }

                    report.frames += written;
                    report.skipped += failed;

                    if written == 0 {
                        warn!(
                            %scope,
                            notification_id = group_notification.id,
                            "No frame written, group notification left pending"
                        );
                        continue;
                    }
                    self.store
                        .mark_sent(NotificationRef::Group(group_notification.id), Utc::now())
                        .await?;
                    report.sent += 1;
                }
                Ok(report)
            },
        )
        .await
    }
}

fn log_batch(scope: Scope, kind: &str, result: Result<DeliveryReport>) -> Result<DeliveryReport> {
    match &result {
        Ok(report) => info!(
            %scope,
            sent = report.sent,
            frames = report.frames,
            skipped = report.skipped,
            "Delivered {}",
            kind
        ),
        Err(e) => error!(%scope, error = %e, "Delivery of {} failed", kind),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::mock::MockConnector;
    use crate::store::{App, Group, MemoryStore};
    use async_trait::async_trait;
    use chrono::DateTime;
    use parking_lot::Mutex;
    use std::io;

    fn token(byte: u8) -> String {
        format!("<{}>", hex_byte(byte).repeat(32))
    }

    fn hex_byte(byte: u8) -> String {
        format!("{:02x}", byte)
    }

    fn credential() -> Credential {
        Credential::from_pem("cert")
    }

    /// Store whose queries all fail.
    struct UnavailableStore;

    fn unavailable<T>() -> Result<T> {
        Err(PushError::Store("database unavailable".to_string()))
    }

    #[async_trait]
    impl DataStore for UnavailableStore {
        async fn list_applications(&self) -> Result<Vec<App>> {
            unavailable()
        }
        async fn devices_for_application(&self, _app_id: Option<AppId>) -> Result<Vec<Device>> {
            unavailable()
        }
        async fn unsent_notifications_for_device(&self, _device: &Device) -> Result<Vec<DeviceNotification>> {
            unavailable()
        }
        async fn groups_for_application(&self, _app_id: AppId) -> Result<Vec<Group>> {
            unavailable()
        }
        async fn unsent_group_notifications_for_group(&self, _group: &Group) -> Result<Vec<GroupNotification>> {
            unavailable()
        }
        async fn devices_for_group(&self, _group: &Group) -> Result<Vec<Device>> {
            unavailable()
        }
        async fn find_device_by_token(&self, _token: &DeviceToken) -> Result<Option<Device>> {
            unavailable()
        }
        async fn mark_sent(&self, _notification: NotificationRef, _at: DateTime<Utc>) -> Result<()> {
            unavailable()
        }
        async fn delete_device(&self, _device: &Device) -> Result<()> {
            unavailable()
        }
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    fn engine(store: &Arc<MemoryStore>, connector: &MockConnector) -> DeliveryEngine<MemoryStore, MockConnector> {
        DeliveryEngine::new(store.clone(), Arc::new(connector.clone()))
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("skip".parse::<OversizePolicy>().unwrap(), OversizePolicy::Skip);
        assert_eq!("ABORT".parse::<OversizePolicy>().unwrap(), OversizePolicy::Abort);
        assert!("retry".parse::<OversizePolicy>().is_err());
        assert_eq!(DeliveryPolicy::default().group, OversizePolicy::Abort);
        assert_eq!(DeliveryPolicy::legacy().group, OversizePolicy::Skip);
    }

    #[tokio::test]
    async fn test_deliver_marks_each_notification() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_app(App::new(1, "demo"));
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        store.insert_device(Device::new(2, Some(1), token(0x22)));
        let first = store.queue_notification(1, Notification::new().alert("one"));
        let second = store.queue_notification(2, Notification::new().badge(2));

        let report = engine(&store, &connector)
            .deliver(Some(&credential()), Scope::App(1))
            .await
            .unwrap();

        assert_eq!(report.sent, 2);
        assert_eq!(connector.connection_count(), 1);
        assert!(connector.all_closed());
        assert!(store.sent_at(NotificationRef::Device(first)).is_some());
        assert!(store.sent_at(NotificationRef::Device(second)).is_some());

        let frames = Frame::decode_all(&connector.written()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].token, vec![0x11; 32]);
        assert_eq!(frames[0].payload, r#"{"aps":{"alert":"one"}}"#);
        assert_eq!(frames[1].payload, r#"{"aps":{"badge":2}}"#);
    }

    #[tokio::test]
    async fn test_second_run_sends_nothing() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        store.queue_notification(1, Notification::new().badge(1));

        let engine = engine(&store, &connector);
        engine.deliver(Some(&credential()), Scope::App(1)).await.unwrap();
        let report = engine.deliver(Some(&credential()), Scope::App(1)).await.unwrap();

        assert_eq!(report, DeliveryReport::default());
        assert_eq!(connector.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_before_io() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        let id = store.queue_notification(1, Notification::new().badge(1));

        let err = engine(&store, &connector)
            .deliver(None, Scope::App(1))
            .await
            .unwrap_err();

        assert!(matches!(err, PushError::MissingCredential(_)));
        assert_eq!(connector.connection_count(), 0);
        assert!(store.sent_at(NotificationRef::Device(id)).is_none());
    }

    #[tokio::test]
    async fn test_oversize_aborts_device_batch() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        let ok = store.queue_notification(1, Notification::new().badge(1));
        let big = store.queue_notification(1, Notification::new().custom("blob", "x".repeat(300)));
        let after = store.queue_notification(1, Notification::new().badge(3));

        let err = engine(&store, &connector)
            .deliver(Some(&credential()), Scope::App(1))
            .await
            .unwrap_err();

        assert!(matches!(err, PushError::PayloadTooLarge { .. }));
        assert!(store.sent_at(NotificationRef::Device(ok)).is_some());
        assert!(store.sent_at(NotificationRef::Device(big)).is_none());
        assert!(store.sent_at(NotificationRef::Device(after)).is_none());
        assert_eq!(Frame::decode_all(&connector.written()).unwrap().len(), 1);
        assert!(connector.all_closed());
    }

    #[tokio::test]
    async fn test_oversize_skipped_under_skip_policy() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        let big = store.queue_notification(1, Notification::new().custom("blob", "x".repeat(300)));
        let after = store.queue_notification(1, Notification::new().badge(3));

        let report = engine(&store, &connector)
            .with_policy(DeliveryPolicy {
                device: OversizePolicy::Skip,
                group: OversizePolicy::Skip,
            })
            .deliver(Some(&credential()), Scope::App(1))
            .await
            .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.skipped, 1);
        assert!(store.sent_at(NotificationRef::Device(big)).is_none());
        assert!(store.sent_at(NotificationRef::Device(after)).is_some());
    }

    #[tokio::test]
    async fn test_write_failure_leaves_rest_pending() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new().fail_after_writes(1);
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        let first = store.queue_notification(1, Notification::new().badge(1));
        let second = store.queue_notification(1, Notification::new().badge(2));

        let err = engine(&store, &connector)
            .deliver(Some(&credential()), Scope::App(1))
            .await
            .unwrap_err();

        assert!(err.is_connection_error());
        assert!(store.sent_at(NotificationRef::Device(first)).is_some());
        assert!(store.sent_at(NotificationRef::Device(second)).is_none());
        assert!(connector.all_closed());
    }

    #[tokio::test]
    async fn test_global_scope_serves_devices_without_app() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        store.insert_device(Device::new(2, None, token(0x22)));
        let app_owned = store.queue_notification(1, Notification::new().badge(1));
        let global = store.queue_notification(2, Notification::new().badge(2));

        engine(&store, &connector)
            .deliver(Some(&credential()), Scope::Global)
            .await
            .unwrap();

        assert!(store.sent_at(NotificationRef::Device(app_owned)).is_none());
        assert!(store.sent_at(NotificationRef::Device(global)).is_some());
    }

    #[tokio::test]
    async fn test_group_notification_written_per_device() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        store.insert_device(Device::new(2, Some(1), token(0x22)));
        store.insert_group(10, 1, "beta").unwrap();
        store.add_to_group(10, 1).unwrap();
        store.add_to_group(10, 2).unwrap();
        let id = store.queue_group_notification(10, Notification::new().alert("hi"));

        let report = engine(&store, &connector)
            .deliver_group_notifications(Some(&credential()), 1)
            .await
            .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.frames, 2);
        assert!(store.sent_at(NotificationRef::Group(id)).is_some());

        let frames = Frame::decode_all(&connector.written()).unwrap();
        assert_eq!(frames[0].token, vec![0x11; 32]);
        assert_eq!(frames[1].token, vec![0x22; 32]);
    }

    #[tokio::test]
    async fn test_group_skip_continues_past_bad_device() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), "<not hex>"));
        store.insert_device(Device::new(2, Some(1), token(0x22)));
        store.insert_group(10, 1, "beta").unwrap();
        store.add_to_group(10, 1).unwrap();
        store.add_to_group(10, 2).unwrap();
        let id = store.queue_group_notification(10, Notification::new().badge(1));

        let report = engine(&store, &connector)
            .with_policy(DeliveryPolicy::legacy())
            .deliver_group_notifications(Some(&credential()), 1)
            .await
            .unwrap();

        assert_eq!(report.frames, 1);
        assert_eq!(report.skipped, 1);
        assert!(store.sent_at(NotificationRef::Group(id)).is_some());
    }

    #[tokio::test]
    async fn test_group_oversize_never_marked() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        store.insert_group(10, 1, "beta").unwrap();
        store.add_to_group(10, 1).unwrap();
        let id = store.queue_group_notification(
            10,
            Notification::new().custom("blob", "y".repeat(300)),
        );

        let report = engine(&store, &connector)
            .with_policy(DeliveryPolicy::legacy())
            .deliver_group_notifications(Some(&credential()), 1)
            .await
            .unwrap();

        assert_eq!(report.sent, 0);
        assert!(store.sent_at(NotificationRef::Group(id)).is_none());
        assert!(connector.written().is_empty());
    }

    #[tokio::test]
    async fn test_single_group_notification() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_device(Device::new(1, Some(1), token(0x11)));
        store.insert_group(10, 1, "beta").unwrap();
        store.add_to_group(10, 1).unwrap();
        let id = store.queue_group_notification(10, Notification::new().badge(9));
        let notification = store.group_notification(id).unwrap();

        let engine = engine(&store, &connector);
        let report = engine
            .deliver_group_notification(Some(&credential()), 1, &notification)
            .await
            .unwrap();
        assert_eq!(report.frames, 1);
        assert!(store.sent_at(NotificationRef::Group(id)).is_some());

        let err = engine
            .deliver_group_notification(Some(&credential()), 2, &notification)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Store(_)));
    }

    #[tokio::test]
    async fn test_empty_group_stays_pending_without_session() {
        let store = Arc::new(MemoryStore::new());
        let connector = MockConnector::new();
        store.insert_group(10, 1, "empty").unwrap();
        let id = store.queue_group_notification(10, Notification::new().alert("anyone?"));
        let notification = store.group_notification(id).unwrap();

        let engine = engine(&store, &connector);
        let report = engine
            .deliver_group_notifications(Some(&credential()), 1)
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::default());

        let report = engine
            .deliver_group_notification(Some(&credential()), 1, &notification)
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::default());

        assert!(store.sent_at(NotificationRef::Group(id)).is_none());
        assert_eq!(connector.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_logged_as_batch_failure() {
        let (logs, _guard) = capture_logs();
        let connector = MockConnector::new();
        let engine = DeliveryEngine::new(Arc::new(UnavailableStore), Arc::new(connector.clone()));

        let err = engine.deliver(Some(&credential()), Scope::App(1)).await.unwrap_err();
        assert!(matches!(err, PushError::Store(_)));
        let err = engine
            .deliver_group_notifications(Some(&credential()), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Store(_)));

        assert_eq!(connector.connection_count(), 0);
        let output = logs.contents();
        assert!(output.contains("Delivery of notifications failed"));
        assert!(output.contains("Delivery of group notifications failed"));
        assert!(output.contains("database unavailable"));
    }
}
