use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Schedule error: {0}")]
    ScheduleError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Delivery error: {0}")]
    DeliveryError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, SignalError>;

impl From<std::io::Error> for SignalError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for SignalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::DeliveryError(err.to_string())
        }
    }
}
