//! Per-thread registration records.
//!
//! A thread registers itself and gets a `RegisteredThread` that lives in the
//! registry and in the thread's TLS slot. The TLS slot is what makes the hot
//! instrumentation paths (label push/pop, sleep/wake) reachable without the
//! profiler lock. The record itself is destroyed only once the thread has
//! unregistered and nothing in the profile buffer refers to it anymore,
//! which the registry tracks through `ProfiledThreadData`.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::platform;
use crate::profiling_stack::ProfilingStack;

#[derive(Debug)]
pub struct ThreadInfo {
    pub thread_id: u32,
    pub name: String,
    pub is_main_thread: bool,
    pub register_time_ms: f64,
}

const IS_BEING_PROFILED: u32 = 1 << 0;
const IS_SLEEPING: u32 = 1 << 1;
const SAMPLED_DURING_SLEEP: u32 = 1 << 2;

/// A single atomic word of per-thread state, readable and writable without
/// the profiler lock.
#[derive(Debug, Default)]
pub(crate) struct RacyThreadFlags(AtomicU32);

impl RacyThreadFlags {
    pub fn set_is_being_profiled(&self, profiled: bool) {
        if profiled {
            self.0.fetch_or(IS_BEING_PROFILED, Ordering::Relaxed);
        } else {
            self.0.fetch_and(!IS_BEING_PROFILED, Ordering::Relaxed);
        }
    }

    pub fn is_being_profiled(&self) -> bool {
        self.0.load(Ordering::Relaxed) & IS_BEING_PROFILED != 0
    }

    /// Entering sleep starts a new sleep episode.
    pub fn set_sleeping(&self) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (current | IS_SLEEPING) & !SAMPLED_DURING_SLEEP;
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn set_awake(&self) {
        self.0
            .fetch_and(!(IS_SLEEPING | SAMPLED_DURING_SLEEP), Ordering::Relaxed);
    }

    pub fn is_sleeping(&self) -> bool {
        self.0.load(Ordering::Relaxed) & IS_SLEEPING != 0
    }

    /// True if the thread is asleep and was already sampled in this sleep
    /// episode, in which case the previous sample can be copied instead of
    /// unwinding again. The first call in an episode claims the episode and
    /// returns false.
    pub fn can_duplicate_last_sample_due_to_sleep(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current & IS_SLEEPING == 0 {
                return false;
            }
            if current & SAMPLED_DURING_SLEEP != 0 {
                return true;
            }
            match self.0.compare_exchange_weak(
                current,
                current | SAMPLED_DURING_SLEEP,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(observed) => current = observed,
            }
        }
    }
}

/// A live registered thread. Owned by the registry; also reachable from the
/// owning thread's TLS slot and, while profiling, from the active state's
/// live list.
pub struct RegisteredThread {
    pub info: Arc<ThreadInfo>,
    pub(crate) racy: RacyThreadFlags,
    pub(crate) profiling_stack: ProfilingStack,
    pub(crate) platform_handle: platform::ThreadHandle,
    /// Highest address of this thread's stack, bounding the unwinder's walk.
    pub(crate) stack_top: u64,
}

impl RegisteredThread {
    pub(crate) fn new(
        name: &str,
        is_main_thread: bool,
        register_time_ms: f64,
        stack_top: u64,
    ) -> Arc<RegisteredThread> {
        let stack_top = if stack_top != 0 {
            stack_top
        } else {
            platform::current_stack_top()
        };
        Arc::new(RegisteredThread {
            info: Arc::new(ThreadInfo {
                thread_id: platform::current_thread_id(),
                name: name.to_string(),
                is_main_thread,
                register_time_ms,
            }),
            racy: RacyThreadFlags::default(),
            profiling_stack: ProfilingStack::new(),
            platform_handle: platform::current_thread_handle(),
            stack_top,
        })
    }
}

thread_local! {
    static REGISTERED_THREAD: RefCell<Option<Arc<RegisteredThread>>> = const { RefCell::new(None) };
}

/// Installs the calling thread's record in its TLS slot. Panics if the
/// thread registered before; double registration is a programming error.
pub(crate) fn set_tls_registered_thread(thread: Arc<RegisteredThread>) {
    REGISTERED_THREAD.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(
            slot.is_none(),
            "thread \"{}\" is already registered with the profiler",
            thread.info.name
        );
        *slot = Some(thread);
    });
}

pub(crate) fn take_tls_registered_thread() -> Option<Arc<RegisteredThread>> {
    REGISTERED_THREAD.with(|slot| slot.borrow_mut().take())
}

/// Runs `f` against the calling thread's record, if registered. This is the
/// lock-free entry into the hot instrumentation paths.
pub(crate) fn with_tls_registered_thread<R>(
    f: impl FnOnce(&Arc<RegisteredThread>) -> R,
) -> Option<R> {
    REGISTERED_THREAD
        .try_with(|slot| slot.borrow().as_ref().map(f))
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_episode_protocol() {
        let flags = RacyThreadFlags::default();
        assert!(!flags.can_duplicate_last_sample_due_to_sleep());

        flags.set_sleeping();
        // First sample of the episode must unwind; later ones may duplicate.
        assert!(!flags.can_duplicate_last_sample_due_to_sleep());
        assert!(flags.can_duplicate_last_sample_due_to_sleep());
        assert!(flags.can_duplicate_last_sample_due_to_sleep());

        // Waking and sleeping again starts a fresh episode.
        flags.set_awake();
        flags.set_sleeping();
        assert!(!flags.can_duplicate_last_sample_due_to_sleep());
        assert!(flags.can_duplicate_last_sample_due_to_sleep());
    }

    #[test]
    fn profiled_flag_is_independent_of_sleep_state() {
        let flags = RacyThreadFlags::default();
        flags.set_is_being_profiled(true);
        flags.set_sleeping();
        assert!(flags.is_being_profiled());
        assert!(flags.is_sleeping());
        flags.set_awake();
        assert!(flags.is_being_profiled());
        flags.set_is_being_profiled(false);
        assert!(!flags.is_being_profiled());
    }
}
