use crate::core::{MessageRecord, format_timestamp, local_now};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// Identity of a notice: `address_keyTime_message`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NoticeKey(String);

impl NoticeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoticeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A notice waiting to be announced on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingNotice {
    pub address: String,
    pub message: String,
    pub parameter: String,
    /// Connect time of the record the notice was made from.
    pub key_time: NaiveDateTime,
    /// When the notice was created.
    pub send_time: NaiveDateTime,
}

impl PendingNotice {
    pub fn new(
        address: impl Into<String>,
        message: impl Into<String>,
        parameter: impl Into<String>,
        key_time: NaiveDateTime,
    ) -> Self {
        Self {
            address: address.into(),
            message: message.into(),
            parameter: parameter.into(),
            key_time,
            send_time: local_now(),
        }
    }

    pub fn for_record(address: &str, record: &MessageRecord) -> Self {
        Self::new(
            address,
            record.message.clone(),
            record.parameter.clone(),
            record.connect_time,
        )
    }

    pub fn key(&self) -> NoticeKey {
        NoticeKey(format!(
            "{}_{}_{}",
            self.address,
            format_timestamp(&self.key_time),
            self.message
        ))
    }
}

/// Delivery health of one device address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub address: String,
    pub last_failed_notice: PendingNotice,
    pub fail_count: u32,
}
