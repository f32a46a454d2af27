//! Data store contract and an in-memory implementation.
//!
//! Persistence of apps, devices, groups and notifications lives outside
//! this crate. Delivery and feedback only go through [`DataStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::{Credential, DeviceToken, Environment, Notification, PushError, Result};

/// Application identifier.
pub type AppId = u64;
/// Device identifier.
pub type DeviceId = u64;
/// Group identifier.
pub type GroupId = u64;
/// Notification identifier.
pub type NotificationId = u64;

/// An application with its push certificates.
#[derive(Debug, Clone)]
pub struct App {
    /// Identifier.
    pub id: AppId,
    /// Display name.
    pub name: String,
    /// Certificate for the sandbox environment.
    pub dev_cert: Option<Credential>,
    /// Certificate for the production environment.
    pub prod_cert: Option<Credential>,
}

impl App {
    /// Create an app without certificates.
    pub fn new(id: AppId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            dev_cert: None,
            prod_cert: None,
        }
    }

    /// Set the sandbox certificate.
    pub fn dev_cert(mut self, credential: Credential) -> Self {
        self.dev_cert = Some(credential);
        self
    }

    /// Set the production certificate.
    pub fn prod_cert(mut self, credential: Credential) -> Self {
        self.prod_cert = Some(credential);
        self
    }

    /// Certificate for `environment`, if configured.
    pub fn credential(&self, environment: Environment) -> Option<&Credential> {
        match environment {
            Environment::Sandbox => self.dev_cert.as_ref(),
            Environment::Production => self.prod_cert.as_ref(),
        }
        .filter(|c| !c.is_empty())
    }
}

/// A registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Identifier.
    pub id: DeviceId,
    /// Owning app, `None` for devices served by the global certificate.
    pub app_id: Option<AppId>,
    /// Token as registered.
    pub token: DeviceToken,
    /// Last time the device registered its token.
    pub last_registered_at: DateTime<Utc>,
    /// When Apple reported the token as inactive, set by feedback resolution.
    pub feedback_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Create a device registered now.
    pub fn new(id: DeviceId, app_id: Option<AppId>, token: impl Into<DeviceToken>) -> Self {
        Self {
            id,
            app_id,
            token: token.into(),
            last_registered_at: Utc::now(),
            feedback_at: None,
        }
    }

    /// Set the registration time.
    pub fn registered_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_registered_at = at;
        self
    }
}

/// A named set of devices within one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Identifier.
    pub id: GroupId,
    /// Owning app.
    pub app_id: AppId,
    /// Name, unique within the app.
    pub name: String,
}

/// A notification addressed to one device.
#[derive(Debug, Clone)]
pub struct DeviceNotification {
    /// Identifier.
    pub id: NotificationId,
    /// Target device.
    pub device_id: DeviceId,
    /// Content.
    pub notification: Notification,
    /// When the frame was written, `None` while pending.
    pub sent_at: Option<DateTime<Utc>>,
}

/// A notification addressed to every device of a group.
#[derive(Debug, Clone)]
pub struct GroupNotification {
    /// Identifier.
    pub id: NotificationId,
    /// Target group.
    pub group_id: GroupId,
    /// Content.
    pub notification: Notification,
    /// When the frames were written, `None` while pending.
    pub sent_at: Option<DateTime<Utc>>,
}

/// Reference to a stored notification of either kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationRef {
    /// Per-device notification.
    Device(NotificationId),
    /// Group notification.
    Group(NotificationId),
}

/// Repository operations used by delivery and feedback.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// All applications.
    async fn list_applications(&self) -> Result<Vec<App>>;

    /// Devices owned by `app_id`; `None` selects devices without an app.
    async fn devices_for_application(&self, app_id: Option<AppId>) -> Result<Vec<Device>>;

    /// Pending notifications for a device, oldest first.
    async fn unsent_notifications_for_device(&self, device: &Device) -> Result<Vec<DeviceNotification>>;

    /// Groups owned by an app.
    async fn groups_for_application(&self, app_id: AppId) -> Result<Vec<Group>>;

    /// Pending group notifications, oldest first.
    async fn unsent_group_notifications_for_group(&self, group: &Group) -> Result<Vec<GroupNotification>>;

    /// Member devices of a group.
    async fn devices_for_group(&self, group: &Group) -> Result<Vec<Device>>;

    /// Look a device up by token.
    async fn find_device_by_token(&self, token: &DeviceToken) -> Result<Option<Device>>;

    /// Record that a notification was written. Never clears an existing timestamp.
    async fn mark_sent(&self, notification: NotificationRef, at: DateTime<Utc>) -> Result<()>;

    /// Remove a device.
    async fn delete_device(&self, device: &Device) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    apps: BTreeMap<AppId, App>,
    devices: BTreeMap<DeviceId, Device>,
    groups: BTreeMap<GroupId, Group>,
    memberships: Vec<(GroupId, DeviceId)>,
    notifications: BTreeMap<NotificationId, DeviceNotification>,
    group_notifications: BTreeMap<NotificationId, GroupNotification>,
    next_notification_id: NotificationId,
}

/// In-memory [`DataStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an app.
    pub fn insert_app(&self, app: App) {
        self.tables.write().apps.insert(app.id, app);
    }

    /// Insert or replace a device.
    pub fn insert_device(&self, device: Device) {
        self.tables.write().devices.insert(device.id, device);
    }

    /// Insert a group.
    pub fn insert_group(&self, id: GroupId, app_id: AppId, name: impl Into<String>) -> Result<Group> {
        let name = name.into();
        let mut tables = self.tables.write();
        if tables
            .groups
            .values()
            .any(|g| g.app_id == app_id && g.name == name)
        {
            return Err(PushError::Store(format!(
                "group {} already exists for app {}",
                name, app_id
            )));
        }
        let group = Group { id, app_id, name };
        tables.groups.insert(id, group.clone());
        Ok(group)
    }

    /// Add a device to a group. Both must belong to the same app.
    pub fn add_to_group(&self, group_id: GroupId, device_id: DeviceId) -> Result<()> {
        let mut tables = self.tables.write();
        let group = tables
            .groups
            .get(&group_id)
            .ok_or_else(|| PushError::Store(format!("unknown group {}", group_id)))?;
        let device = tables
            .devices
            .get(&device_id)
            .ok_or_else(|| PushError::Store(format!("unknown device {}", device_id)))?;
        if device.app_id != Some(group.app_id) {
            return Err(PushError::Store(
                "device and group must belong to the same app".into(),
            ));
        }
        if !tables.memberships.contains(&(group_id, device_id)) {
            tables.memberships.push((group_id, device_id));
        }
        Ok(())
    }

    /// Queue a notification for a device.
    pub fn queue_notification(&self, device_id: DeviceId, notification: Notification) -> NotificationId {
        let mut tables = self.tables.write();
        tables.next_notification_id += 1;
        let id = tables.next_notification_id;
        tables.notifications.insert(
            id,
            DeviceNotification {
                id,
                device_id,
                notification,
                sent_at: None,
            },
        );
        id
    }

    /// Queue a notification for a group.
    pub fn queue_group_notification(&self, group_id: GroupId, notification: Notification) -> NotificationId {
        let mut tables = self.tables.write();
        tables.next_notification_id += 1;
        let id = tables.next_notification_id;
        tables.group_notifications.insert(
            id,
            GroupNotification {
                id,
                group_id,
                notification,
                sent_at: None,
            },
        );
        id
    }

    /// Sent timestamp of a notification of either kind.
    pub fn sent_at(&self, notification: NotificationRef) -> Option<DateTime<Utc>> {
        let tables = self.tables.read();
        match notification {
            NotificationRef::Device(id) => tables.notifications.get(&id).and_then(|n| n.sent_at),
            NotificationRef::Group(id) => {
                tables.group_notifications.get(&id).and_then(|n| n.sent_at)
            }
        }
    }

    /// Fetch a device by id.
    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.tables.read().devices.get(&id).cloned()
    }

    /// Fetch a group notification by id.
    pub fn group_notification(&self, id: NotificationId) -> Option<GroupNotification> {
        self.tables.read().group_notifications.get(&id).cloned()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn list_applications(&self) -> Result<Vec<App>> {
        Ok(self.tables.read().apps.values().cloned().collect())
    }

    async fn devices_for_application(&self, app_id: Option<AppId>) -> Result<Vec<Device>> {
        Ok(self
            .tables
            .read()
            .devices
            .values()
            .filter(|d| d.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn unsent_notifications_for_device(&self, device: &Device) -> Result<Vec<DeviceNotification>> {
        Ok(self
            .tables
            .read()
            .notifications
            .values()
            .filter(|n| n.device_id == device.id && n.sent_at.is_none())
            .cloned()
            .collect())
    }

    async fn groups_for_application(&self, app_id: AppId) -> Result<Vec<Group>> {
        Ok(self
            .tables
            .read()
            .groups
            .values()
            .filter(|g| g.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn unsent_group_notifications_for_group(&self, group: &Group) -> Result<Vec<GroupNotification>> {
        Ok(self
            .tables
            .read()
            .group_notifications
            .values()
            .filter(|n| n.group_id == group.id && n.sent_at.is_none())
            .cloned()
            .collect())
    }

    async fn devices_for_group(&self, group: &Group) -> Result<Vec<Device>> {
        let tables = self.tables.read();
        Ok(tables
            .memberships
            .iter()
            .filter(|(g, _)| *g == group.id)
            .filter_map(|(_, d)| tables.devices.get(d).cloned())
            .collect())
    }

    async fn find_device_by_token(&self, token: &DeviceToken) -> Result<Option<Device>> {
        Ok(self
            .tables
            .read()
            .devices
            .values()
            .find(|d| &d.token == token)
            .cloned())
    }

    async fn mark_sent(&self, notification: NotificationRef, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write();
        let sent_at = match notification {
            NotificationRef::Device(id) => tables.notifications.get_mut(&id).map(|n| &mut n.sent_at),
            NotificationRef::Group(id) => {
                tables.group_notifications.get_mut(&id).map(|n| &mut n.sent_at)
            }
        }
        .ok_or_else(|| PushError::Store(format!("unknown notification {:?}", notification)))?;

        if sent_at.is_none() {
            *sent_at = Some(at);
        }
        Ok(())
    }

    async fn delete_device(&self, device: &Device) -> Result<()> {
        let mut tables = self.tables.write();
        tables.devices.remove(&device.id);
        tables.memberships.retain(|(_, d)| *d != device.id);
        tables.notifications.retain(|_, n| n.device_id != device.id);
        Ok(())
    }
}
