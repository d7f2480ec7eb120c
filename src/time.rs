use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Anchor for all profile timestamps. Captured once at `init` and kept for
/// the lifetime of the process; every timestamp in the profile is expressed
/// as milliseconds since `reference_instant`.
#[derive(Debug, Clone, Copy)]
pub struct ProcessStartTime {
    reference_instant: Instant,
    reference_system_time: SystemTime,
}

impl ProcessStartTime {
    pub fn now() -> Self {
        Self {
            reference_instant: Instant::now(),
            reference_system_time: SystemTime::now(),
        }
    }

    /// Milliseconds elapsed since process start.
    pub fn elapsed_ms(&self) -> f64 {
        self.reference_instant.elapsed().as_secs_f64() * 1000.0
    }

    pub fn instant_to_ms(&self, instant: Instant) -> f64 {
        instant
            .saturating_duration_since(self.reference_instant)
            .as_secs_f64()
            * 1000.0
    }

    /// Milliseconds between the unix epoch and process start, for `meta.startTime`.
    pub fn system_ms_since_epoch(&self) -> f64 {
        self.reference_system_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
            * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_monotonic() {
        let start = ProcessStartTime::now();
        let a = start.elapsed_ms();
        let b = start.elapsed_ms();
        assert!(b >= a);
        assert!(a >= 0.0);
    }
}
