use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use ferrite_support::time::wall_millis;

/// Learned-offset clock. `now()` returns the host wall clock
/// plus the offset learned from the most recent improving `sync`. The
/// initial offset is zero; servers never call `sync` on themselves.
pub struct Clock {
    offset_millis: AtomicI64,
    best_rtt_millis: AtomicU64,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            offset_millis: AtomicI64::new(0),
            best_rtt_millis: AtomicU64::new(u64::max_value()),
        }
    }

    pub fn now(&self) -> u64 {
        let offset = self.offset_millis.load(Ordering::Relaxed);
        (wall_millis() as i64 + offset).max(0) as u64
    }

    /// `local_send`/`local_recv` are this node's clock readings around the
    /// round trip; `remote_start`/`remote_end` are the peer's readings
    /// carried in its response. Keeps the new offset only if the observed
    /// round trip improves on the best one seen so far.
    pub fn sync(&self, local_send: u64, remote_start: u64, remote_end: u64, local_recv: u64) {
        let _ = remote_start;
        let rtt = local_recv.saturating_sub(local_send);

        let best = self.best_rtt_millis.load(Ordering::Relaxed);
        if rtt >= best {
            return;
        }

        let offset = remote_end as i64 + (rtt as i64 / 2) - local_recv as i64;
        self.offset_millis.store(offset, Ordering::Relaxed);
        self.best_rtt_millis.store(rtt, Ordering::Relaxed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_offset_is_zero() {
        let clock = Clock::new();
        let before = wall_millis();
        let now = clock.now();
        assert!(now >= before);
    }

    #[test]
    fn sync_applies_offset() {
        let clock = Clock::new();
        // local clock is 1000ms behind the peer; round trip is 100ms.
        clock.sync(1000, 2050, 2100, 1100);
        // offset = remote_end + rtt/2 - local_recv = 2100 + 50 - 1100 = 1050
        assert_eq!(clock.offset_millis.load(Ordering::Relaxed), 1050);
    }

    #[test]
    fn worse_rtt_does_not_override() {
        let clock = Clock::new();
        clock.sync(1000, 2050, 2100, 1100); // rtt 100
        clock.sync(1000, 2050, 2500, 1500); // rtt 500, worse
        assert_eq!(clock.offset_millis.load(Ordering::Relaxed), 1050);
    }
}
