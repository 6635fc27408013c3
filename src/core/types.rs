use super::{Result, SignalError};
use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status carried by records the liveness monitor synthesizes.
pub const TIMEOUT_STATUS: &str = "Timeout";

/// Millisecond timestamp layout used in keys, wire lines and logs.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";

/// Renders a timestamp the way record keys and the listener stamp it.
pub fn format_timestamp(time: &NaiveDateTime) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local wall-clock time at millisecond resolution.
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(3)
}

/// Parses the timestamp column of an ingestion line.
///
/// Accepts the slash layout the listener emits, with or without
/// milliseconds, plus the ISO dash layouts.
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    const LAYOUTS: [&str; 4] = [
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M",
    ];

    let text = text.trim();
    LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(text, layout).ok())
        .map(|time| time.trunc_subsecs(3))
        .ok_or_else(|| SignalError::DecodeError(format!("unparsable timestamp '{}'", text)))
}

/// Whether a record is finalized after its first hand-off or stays eligible
/// for repeated re-dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CheckStyle {
    #[default]
    Once,
    Recurring,
}

impl CheckStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStyle::Once => "Once",
            CheckStyle::Recurring => "Recurring",
        }
    }
}

impl FromStr for CheckStyle {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Once" => Ok(CheckStyle::Once),
            // "Ever" is what older clients send for the recurring style.
            "Recurring" | "Ever" => Ok(CheckStyle::Recurring),
            other => Err(SignalError::DecodeError(format!(
                "unknown check style '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CheckStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a record: `clientName_yyyy/MM/dd HH:mm:ss.fff`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(client_name: &str, connect_time: &NaiveDateTime) -> Self {
        Self(format!("{}_{}", client_name, format_timestamp(connect_time)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub client_name: String,
    pub connect_time: NaiveDateTime,
    pub status: String,
    pub message: String,
    pub parameter: String,
    pub check_style: CheckStyle,
    pub acknowledged: bool,
}

impl MessageRecord {
    /// Creates an unacknowledged record; the time is truncated to milliseconds.
    pub fn new(
        connect_time: NaiveDateTime,
        client_name: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            connect_time: connect_time.trunc_subsecs(3),
            status: status.into(),
            message: message.into(),
            parameter: String::new(),
            check_style: CheckStyle::Once,
            acknowledged: false,
        }
    }

    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameter = parameter.into();
        self
    }

    pub fn with_check_style(mut self, check_style: CheckStyle) -> Self {
        self.check_style = check_style;
        self
    }

    pub fn acknowledged(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.client_name, &self.connect_time)
    }

    pub fn is_timeout(&self) -> bool {
        self.status == TIMEOUT_STATUS
    }

    /// Copies the mutable fields of `other` into this record, keeping identity.
    pub fn update_from(&mut self, other: &MessageRecord) {
        self.status.clone_from(&other.status);
        self.message.clone_from(&other.message);
        self.parameter.clone_from(&other.parameter);
        self.check_style = other.check_style;
        self.acknowledged = other.acknowledged;
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.client_name,
            self.connect_time.format("%Y/%m/%d %H:%M:%S"),
            self.status,
            self.message,
            self.acknowledged,
            self.check_style
        )
    }
}
