//! Input Validation
//!
//! Security-focused checks applied before anything enters the pipeline:
//! topic names double as file names on the collector, so they are restricted
//! to a conservative character set and may never contain traversal sequences.
//! Size limits bound memory under burst on both sides of the wire.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

/// Topics are at most this many characters.
pub const MAX_TOPIC_LEN: usize = 128;

/// Largest single canonical message accepted by the edge.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Largest joined batch accepted anywhere in the pipeline.
pub const MAX_BATCH_BYTES: usize = 100 * 1024 * 1024;

/// `dict_id` must be below 2^31; the value 0 means "no dictionary".
pub const DICT_ID_LIMIT: u32 = 1 << 31;

lazy_static! {
    static ref TOPIC_RE: Regex = Regex::new(r"^[A-Za-z0-9._-]{1,128}$").unwrap();
}

/// Validate a topic name.
///
/// Accepts `[A-Za-z0-9._-]{1,128}`, rejecting anything containing `..`
/// (topics become `<topic>.jsonl` paths on the collector).
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::BadMessage("topic is empty".into()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::BadMessage(format!(
            "topic exceeds {} characters",
            MAX_TOPIC_LEN
        )));
    }
    if topic.contains("..") {
        return Err(Error::BadMessage(format!(
            "topic '{}' contains a traversal sequence",
            topic
        )));
    }
    if !TOPIC_RE.is_match(topic) {
        return Err(Error::BadMessage(format!(
            "topic '{}' contains invalid characters",
            topic
        )));
    }
    Ok(())
}

/// Cheap boolean form for use inside header validation.
pub fn is_valid_topic(topic: &str) -> bool {
    validate_topic(topic).is_ok()
}

/// Reject a single message longer than `max` bytes.
pub fn validate_message_len(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::BadMessage(format!(
            "message of {} bytes exceeds limit of {} bytes",
            len, max
        )));
    }
    Ok(())
}

/// Reject a joined batch longer than `max` bytes.
pub fn validate_batch_len(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::BadMessage(format!(
            "batch of {} bytes exceeds limit of {} bytes",
            len, max
        )));
    }
    Ok(())
}

/// Reject a dictionary id outside `[0, 2^31)`.
pub fn validate_dict_id(dict_id: u32) -> Result<()> {
    if dict_id >= DICT_ID_LIMIT {
        return Err(Error::BadMessage(format!(
            "dict_id {} out of range",
            dict_id
        )));
    }
    Ok(())
}
