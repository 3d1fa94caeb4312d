//! Milliseconds-since-epoch helper, shared by every module that stamps or
//! checks record timestamps (cache, registry, engine, resolver).

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
