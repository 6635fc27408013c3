//! Socket front door for signal producers.

pub mod listener;

pub use listener::{SignalListener, decode_payload, response_frame, stamp_lines};
