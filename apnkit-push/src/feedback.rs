//! Feedback service reader.
//!
//! Apple reports tokens that stopped accepting notifications as a stream
//! of fixed-size records, then closes the connection:
//!
//! ```text
//! +-------------------+------------------+----------+
//! | timestamp         | token length     | token    |
//! | 4 bytes BE (secs) | 2 bytes BE (=32) | 32 bytes |
//! +-------------------+------------------+----------+
//! ```

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::{Connector, Gateway, Session};
use crate::credential::require_credential;
use crate::delivery::Scope;
use crate::store::{DataStore, Device};
use crate::token::TOKEN_LEN;
use crate::{Credential, DeviceToken, PushError, Result};

/// Size of one feedback record.
pub const RECORD_LEN: usize = 4 + 2 + TOKEN_LEN;

/// A token Apple reported as inactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackRecord {
    /// When the token stopped accepting notifications.
    pub timestamp: DateTime<Utc>,
    /// Token in canonical grouped form.
    pub token: DeviceToken,
}

impl FeedbackRecord {
    /// Decode one record.
    ///
    /// The length field is not checked; the token is always the trailing
    /// 32 bytes.
    pub fn decode(record: &[u8; RECORD_LEN]) -> Self {
        let seconds = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let timestamp = Utc
            .timestamp_opt(i64::from(seconds), 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            timestamp,
            token: DeviceToken::from_bytes(&record[6..]),
        }
    }

    /// Encode in the service's wire format.
    pub fn encode(&self) -> Result<[u8; RECORD_LEN]> {
        let seconds = u32::try_from(self.timestamp.timestamp())
            .map_err(|_| PushError::Serialization("feedback timestamp out of range".into()))?;
        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(&seconds.to_be_bytes());
        record[4..6].copy_from_slice(&(TOKEN_LEN as u16).to_be_bytes());
        record[6..].copy_from_slice(&self.token.to_wire()?);
        Ok(record)
    }
}

/// Records from one feedback session, read on demand.
///
/// The stream is finite and cannot be restarted; reading again needs a
/// new session, which only returns feedback gathered since this one.
pub struct FeedbackStream {
    session: Option<Session>,
}

impl FeedbackStream {
    /// A stream that yields nothing.
    pub fn empty() -> Self {
        Self { session: None }
    }

    /// Read records from an open feedback session.
    pub fn new(session: Session) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Next record, or `None` once the service closed the stream.
    ///
    /// The session is closed as soon as the stream ends or fails. A stream
    /// ending inside a record is an error.
    pub async fn next(&mut self) -> Result<Option<FeedbackRecord>> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        let mut record = [0u8; RECORD_LEN];
        let mut filled = 0;
        while filled < RECORD_LEN {
            let n = match session.read(&mut record[filled..]).await {
                Ok(n) => n,
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            };
            if n == 0 {
                self.close().await;
                if filled == 0 {
                    return Ok(None);
                }
                return Err(PushError::TruncatedFeedback {
                    got: filled,
                    expected: RECORD_LEN,
                });
            }
            filled += n;
        }

        Ok(Some(FeedbackRecord::decode(&record)))
    }

    /// Drain the remaining records.
    pub async fn collect(mut self) -> Result<Vec<FeedbackRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Open a feedback session for `credential`.
///
/// Without a credential the stream is empty and nothing is connected.
pub async fn read_feedback<C>(connector: &C, credential: Option<&Credential>) -> Result<FeedbackStream>
where
    C: Connector + ?Sized,
{
    match credential.filter(|c| !c.is_empty()) {
        Some(credential) => {
            let session = connector.connect(credential, Gateway::Feedback).await?;
            Ok(FeedbackStream::new(session))
        }
        None => {
            debug!("No credential, skipping feedback read");
            Ok(FeedbackStream::empty())
        }
    }
}

/// Whether a device reported in feedback should be removed.
///
/// A device that registered again after the feedback time is kept.
pub fn is_removable(device: &Device, feedback_at: DateTime<Utc>) -> bool {
    device.last_registered_at < feedback_at
}

/// Counters for one feedback run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackReport {
    /// Records read from the service.
    pub records: usize,
    /// Records matching a known device.
    pub matched: usize,
    /// Devices deleted.
    pub removed: usize,
    /// Devices kept because they registered after the feedback time.
    pub retained: usize,
}

/// Resolves feedback records to devices and prunes stale ones.
pub struct FeedbackProcessor<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    connector: Arc<C>,
}

impl<S, C> FeedbackProcessor<S, C>
where
    S: DataStore + ?Sized,
    C: Connector + ?Sized,
{
    /// Create a processor.
    pub fn new(store: Arc<S>, connector: Arc<C>) -> Self {
        Self { store, connector }
    }

    /// Known devices from the feedback stream, with `feedback_at` set.
    ///
    /// Records for unknown tokens are skipped.
    pub async fn devices(&self, credential: Option<&Credential>) -> Result<(usize, Vec<Device>)> {
        let mut stream = read_feedback(&*self.connector, credential).await?;
        let mut records = 0;
        let mut devices = Vec::new();

        while let Some(record) = stream.next().await? {
            records += 1;
            match self.store.find_device_by_token(&record.token).await? {
                Some(mut device) => {
                    device.feedback_at = Some(record.timestamp);
                    devices.push(device);
                }
                None => debug!(token = %record.token, "Feedback for unknown token"),
            }
        }

        Ok((records, devices))
    }

    /// Read feedback for a scope and delete devices that did not register since.
    pub async fn process(&self, credential: Option<&Credential>, scope: Scope) -> Result<FeedbackReport> {
        let credential = require_credential(credential, &scope.to_string())?;
        let (records, devices) = self.devices(Some(credential)).await?;

        let mut report = FeedbackReport {
            records,
            matched: devices.len(),
            ..Default::default()
        };

        for device in devices {
            let Some(feedback_at) = device.feedback_at else {
                continue;
            };
            if is_removable(&device, feedback_at) {
                info!(
                    %scope,
                    device_id = device.id,
                    last_registered_at = %device.last_registered_at,
                    %feedback_at,
                    "Removing device"
                );
                self.store.delete_device(&device).await?;
                report.removed += 1;
            } else {
                info!(
                    %scope,
                    device_id = device.id,
                    last_registered_at = %device.last_registered_at,
                    %feedback_at,
                    "Keeping re-registered device"
                );
                report.retained += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn record(seconds: u32, byte: u8) -> Vec<u8> {
        let mut bytes = seconds.to_be_bytes().to_vec();
        bytes.extend_from_slice(&32u16.to_be_bytes());
        bytes.extend_from_slice(&[byte; 32]);
        bytes
    }

    #[test]
    fn test_decode_record() {
        let bytes: [u8; RECORD_LEN] = record(1_300_000_000, 0xab).try_into().unwrap();
        let decoded = FeedbackRecord::decode(&bytes);

        assert_eq!(decoded.timestamp.timestamp(), 1_300_000_000);
        assert_eq!(decoded.token.as_str(), vec!["abababab"; 8].join(" "));
        assert_eq!(FeedbackRecord::decode(&bytes), decoded);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn test_length_field_ignored() {
        let mut bytes: [u8; RECORD_LEN] = record(10, 0x01).try_into().unwrap();
        bytes[4] = 0xff;
        bytes[5] = 0xff;
        assert_eq!(FeedbackRecord::decode(&bytes).token.to_bytes().unwrap(), vec![0x01; 32]);
    }

    #[tokio::test]
    async fn test_stream_reads_until_end() {
        let mut bytes = record(100, 0x01);
        bytes.extend(record(200, 0x02));
        let connector = MockConnector::new().with_feedback(bytes).read_chunk(5);

        let stream = read_feedback(&connector, Some(&Credential::from_pem("cert")))
            .await
            .unwrap();
        let records = stream.collect().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp.timestamp(), 100);
        assert_eq!(records[1].token.to_bytes().unwrap(), vec![0x02; 32]);
        assert_eq!(connector.gateways(), vec![Gateway::Feedback]);
        assert!(connector.all_closed());
    }

    #[tokio::test]
    async fn test_truncated_record_is_error() {
        let mut bytes = record(100, 0x01);
        bytes.extend_from_slice(&[0u8; 10]);
        let connector = MockConnector::new().with_feedback(bytes);

        let mut stream = read_feedback(&connector, Some(&Credential::from_pem("cert")))
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_some());
        let err = stream.next().await.unwrap_err();

        assert!(matches!(err, PushError::TruncatedFeedback { got: 10, .. }));
        assert!(connector.all_closed());
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_credential_no_connection() {
        let connector = MockConnector::new().with_feedback(record(1, 1));
        let records = read_feedback(&connector, None).await.unwrap().collect().await.unwrap();

        assert!(records.is_empty());
        assert_eq!(connector.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_process_removes_only_stale_devices() {
        let feedback_at = Utc.timestamp_opt(1_600_000_000, 0).single().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_device(
            Device::new(1, Some(1), DeviceToken::from_bytes(&[0x01; 32]))
                .registered_at(feedback_at - Duration::days(1)),
        );
        store.insert_device(
            Device::new(2, Some(1), format!("<{}>", "02".repeat(32)))
                .registered_at(feedback_at),
        );

        let mut bytes = record(1_600_000_000, 0x01);
        bytes.extend(record(1_600_000_000, 0x02));
        bytes.extend(record(1_600_000_000, 0x03));
        let connector = Arc::new(MockConnector::new().with_feedback(bytes));

        let report = FeedbackProcessor::new(store.clone(), connector)
            .process(Some(&Credential::from_pem("cert")), Scope::App(1))
            .await
            .unwrap();

        assert_eq!(
            report,
            FeedbackReport {
                records: 3,
                matched: 2,
                removed: 1,
                retained: 1,
            }
        );
        assert!(store.device(1).is_none());
        assert!(store.device(2).is_some());
    }

    #[tokio::test]
    async fn test_devices_carry_feedback_time() {
        let store = Arc::new(MemoryStore::new());
        store.insert_device(Device::new(1, None, DeviceToken::from_bytes(&[0x05; 32])));
        let connector = Arc::new(MockConnector::new().with_feedback(record(42, 0x05)));

        let (records, devices) = FeedbackProcessor::new(store, connector)
            .devices(Some(&Credential::from_pem("cert")))
            .await
            .unwrap();

        assert_eq!(records, 1);
        assert_eq!(devices[0].feedback_at.unwrap().timestamp(), 42);
    }

    #[tokio::test]
    async fn test_process_requires_credential() {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(MockConnector::new());
        let err = FeedbackProcessor::new(store, connector.clone())
            .process(None, Scope::Global)
            .await
            .unwrap_err();

        assert!(matches!(err, PushError::MissingCredential(_)));
        assert_eq!(connector.connection_count(), 0);
    }
}
