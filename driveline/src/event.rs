use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Local, Offset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Attachments above this size are refused at attach time.
pub const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;

/// A structured, timestamped record produced on-device.
///
/// The serialized JSON form is the canonical representation; field names
/// follow the wire format understood by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "EventID")]
    pub event_id: String,
    #[serde(rename = "Version")]
    pub version: String,
    /// Milliseconds since epoch, producer clock.
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    /// Minutes east of UTC.
    #[serde(rename = "Timezone", default)]
    pub timezone_offset_minutes: i32,
    #[serde(rename = "Data", default)]
    pub data: serde_json::Map<String, Value>,
    /// Attachment filenames in the staging area, in attach order.
    #[serde(rename = "UploadId", default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
    #[serde(
        rename = "BizTransactionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub biz_transaction_id: Option<String>,
    #[serde(rename = "MessageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(
        rename = "CorrelationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(rename = "pii", default, skip_serializing_if = "Option::is_none")]
    pub pii: Option<Value>,
}

impl Event {
    pub fn new(version: &str, event_id: &str) -> Self {
        Event {
            event_id: event_id.to_owned(),
            version: version.to_owned(),
            timestamp: Utc::now().timestamp_millis(),
            timezone_offset_minutes: Local::now().offset().fix().local_minus_utc() / 60,
            data: serde_json::Map::new(),
            attachments: None,
            biz_transaction_id: None,
            message_id: None,
            correlation_id: None,
            pii: None,
        }
    }

    pub fn add_field(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.data.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_message_id(mut self) -> Self {
        self.message_id = Some(Uuid::new_v4().to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("event serialization cannot fail")
    }

    pub fn from_json(serialized: &str) -> Result<Event, serde_json::Error> {
        serde_json::from_str(serialized)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Stages a file for upload alongside this event.
    ///
    /// The file is copied into `staging_dir` under a unique name which is
    /// recorded in the attachment list. On a validation failure the
    /// deterministic error code is recorded in the filename slot instead, so
    /// the backend can correlate the failure; the event itself stays valid.
    pub fn attach(&mut self, source: &Path, staging_dir: &Path) -> Result<String, AttachError> {
        let entry = match validate_attachment(source) {
            Ok(file_name) => {
                let staged = format!("{}_{}", Uuid::new_v4(), file_name);
                let target: PathBuf = staging_dir.join(&staged);
                if let Err(e) = std::fs::copy(source, &target) {
                    log::error!("Unable to stage attachment {source:?}: {e}");
                    return self.record_attachment(Err(AttachError::Unreadable));
                }
                return self.record_attachment(Ok(staged));
            }
            Err(e) => Err(e),
        };
        self.record_attachment(entry)
    }

    fn record_attachment(
        &mut self,
        entry: Result<String, AttachError>,
    ) -> Result<String, AttachError> {
        let slot = match &entry {
            Ok(name) => name.clone(),
            Err(e) => e.filename_slot(),
        };
        self.attachments.get_or_insert_with(Vec::new).push(slot);
        entry
    }
}

fn validate_attachment(source: &Path) -> Result<String, AttachError> {
    let meta = std::fs::metadata(source).map_err(|_| AttachError::NotFound)?;
    if !meta.is_file() {
        return Err(AttachError::NotFound);
    }
    if meta.len() > MAX_ATTACHMENT_BYTES {
        return Err(AttachError::TooLarge);
    }
    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(AttachError::BadName)?;
    if file_name.is_empty()
        || !file_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(AttachError::BadName);
    }
    Ok(file_name.to_owned())
}

/// Deterministic attachment failures surfaced at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("attachment file not found")]
    NotFound,
    #[error("attachment exceeds the size limit")]
    TooLarge,
    #[error("attachment file name contains unsupported characters")]
    BadName,
    #[error("attachment file could not be read")]
    Unreadable,
}

impl AttachError {
    pub fn code(&self) -> u8 {
        match self {
            AttachError::NotFound => 1,
            AttachError::TooLarge => 2,
            AttachError::BadName => 3,
            AttachError::Unreadable => 4,
        }
    }

    fn filename_slot(&self) -> String {
        format!("attach-error-{}", self.code())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.event_id, self.timestamp)
    }
}
