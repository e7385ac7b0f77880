//! Core domain types for EventoDB.
//!
//! Everything in this crate is pure: stream name parsing, the stable 64-bit
//! hash used for consumer-group partitioning, position key encoding, message
//! records, read filters, and the error taxonomy shared by every layer.
//! Storage backends and the HTTP server live in their own crates.

mod error;
mod filter;
mod keys;
mod message;
mod stream_name;

pub use error::{Error, Result};
pub use filter::{CategoryFilter, ConsumerGroup};
pub use keys::{decode_position, encode_position, hash64, POSITION_DIGITS};
pub use message::{ExportedMessage, Message, WriteEvent};
pub use stream_name::{cardinal_id, category, InvalidStreamName, StreamName};
