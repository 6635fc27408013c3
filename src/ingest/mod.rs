//! Ingestion: decoding received lines and batching them into the store.

pub mod bridge;
pub mod decoder;

pub use bridge::{IngestBridge, IngestStats, STORAGE_UNAVAILABLE};
pub use decoder::decode_line;
