use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, per the host clock.
pub fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
