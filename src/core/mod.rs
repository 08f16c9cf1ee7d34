//! Deterministic primitives: canonical encoding, hashing, identity.

pub mod canonical;
pub mod hash;
pub mod identity;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in integer milliseconds since the Unix epoch.
///
/// All protocol timestamps are integer milliseconds; floats never appear in
/// canonical encodings.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
