//! Wire protocol for the Archivist ingestion pipeline.
//!
//! LastFile notifications arrive on the broker as two frames:
//! ```text
//! [SUBJECT][BODY]
//! ```
//!
//! - SUBJECT: UTF-8 subject name the publisher routed the message to
//! - BODY: JSON object `{id, file_path, success_rate, timestamp, metadata}`
//!
//! Decoding is strict: a body that fails to decode is reported as a
//! [`DecodeError`] and is never retried by the consumer.

pub mod defaults;
pub mod error;
pub mod notification;

pub use error::{DecodeError, Result};
pub use notification::{decode_frames, Notification};
