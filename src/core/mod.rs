pub mod error;
pub mod types;

pub use error::{Result, SignalError};
pub use types::{
    CheckStyle, MessageRecord, RecordKey, TIMEOUT_STATUS, TIMESTAMP_FORMAT, format_timestamp,
    local_now, parse_timestamp,
};
