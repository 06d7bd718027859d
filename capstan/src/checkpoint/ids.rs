//! Time-ordered checkpoint ids.
//!
//! Checkpoint ids sort lexicographically in creation order: a zero-padded
//! hex millisecond timestamp prefix followed by a random suffix for
//! uniqueness within the same millisecond.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Returns a new id of the form `{unix_ms:012x}-{random}`.
pub fn ordered_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{millis:012x}-{}", &suffix[..12])
}
