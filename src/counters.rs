//! Externally owned counters sampled once per sampler tick.

use std::sync::Arc;

/// A named integer quantity polled by the sampler thread. The implementation
/// is owned by the embedder; the profiler only keeps a reference while the
/// counter is registered.
pub trait CounterSource: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> &str;
    fn description(&self) -> &str;
    /// Returns the accumulated count delta and, optionally, a number of
    /// operations (zero suppresses the number entry).
    fn sample(&self) -> (i64, u64);
}

/// Counters are identified in the buffer by the address of their data, which
/// stays stable for the lifetime of the `Arc`.
pub(crate) fn counter_id(counter: &Arc<dyn CounterSource>) -> u64 {
    Arc::as_ptr(counter) as *const () as u64
}

pub(crate) fn same_counter(a: &Arc<dyn CounterSource>, b: &Arc<dyn CounterSource>) -> bool {
    counter_id(a) == counter_id(b)
}
