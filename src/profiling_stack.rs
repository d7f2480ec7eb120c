//! The per-thread stack of label frames pushed by instrumented code.
//!
//! Only the owning thread pushes and pops. The sampler thread reads the
//! frames while the owning thread is suspended; the suspension itself (mach
//! suspend, or being parked in a signal handler on a semaphore) provides the
//! synchronization that makes those reads well defined. The top index is
//! additionally published with release ordering so that a reader can never
//! observe an index ahead of the frame data it covers: it may see one frame
//! fewer than the true depth, never one more.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::category::ProfilingCategory;

/// Number of label frames each thread can hold. Pushes beyond this still
/// advance the logical depth (so pops stay balanced) but record nothing.
pub const PROFILING_STACK_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A regular label frame, emitted into samples.
    Label,
    /// A pure stack-pointer annotation; consumed by the merge, never emitted.
    SpMarker,
    /// An on-stack-replacement duplicate of a following native frame;
    /// consumed by the merge without emission.
    JsOsr,
}

/// One frame of the profiling stack. `Copy` so the sampler can lift frames
/// out of the shared storage with a single read.
#[derive(Clone, Copy)]
pub struct ProfilingStackFrame {
    pub label: &'static str,
    dynamic_ptr: *const u8,
    dynamic_len: usize,
    pub category: ProfilingCategory,
    pub kind: FrameKind,
    /// Approximate stack pointer of the pushing frame. Monotonically
    /// decreasing from the bottom of the stack to the top.
    pub stack_address: usize,
}

impl ProfilingStackFrame {
    pub fn new(
        label: &'static str,
        dynamic: Option<&str>,
        category: ProfilingCategory,
        kind: FrameKind,
        stack_address: usize,
    ) -> Self {
        let (dynamic_ptr, dynamic_len) = match dynamic {
            Some(s) => (s.as_ptr(), s.len()),
            None => (std::ptr::null(), 0),
        };
        ProfilingStackFrame {
            label,
            dynamic_ptr,
            dynamic_len,
            category,
            kind,
            stack_address,
        }
    }

    /// The dynamic string, if any.
    ///
    /// # Safety
    ///
    /// Only valid while the frame is on its stack (the pusher keeps the
    /// string alive until it pops), or while the owning thread is suspended.
    pub(crate) unsafe fn dynamic_str(&self) -> Option<&str> {
        if self.dynamic_ptr.is_null() {
            return None;
        }
        let bytes = std::slice::from_raw_parts(self.dynamic_ptr, self.dynamic_len);
        std::str::from_utf8(bytes).ok()
    }
}

pub struct ProfilingStack {
    frames: Box<[UnsafeCell<MaybeUninit<ProfilingStackFrame>>]>,
    /// Logical depth, may exceed the stored capacity.
    top: AtomicUsize,
}

// The UnsafeCell slots are only written by the owning thread and only read by
// the sampler while the owner is suspended.
unsafe impl Sync for ProfilingStack {}
unsafe impl Send for ProfilingStack {}

impl ProfilingStack {
    pub fn new() -> Self {
        let frames = (0..PROFILING_STACK_CAPACITY)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        ProfilingStack {
            frames,
            top: AtomicUsize::new(0),
        }
    }

    /// Pushes a frame. The frame data is fully written before the new top is
    /// published. Owner thread only.
    pub fn push(&self, frame: ProfilingStackFrame) {
        let top = self.top.load(Ordering::Relaxed);
        if top < PROFILING_STACK_CAPACITY {
            unsafe { (*self.frames[top].get()).write(frame) };
        }
        self.top.store(top + 1, Ordering::Release);
    }

    /// Pops the most recent frame. The top is withdrawn before the slot is
    /// considered dead. Owner thread only.
    pub fn pop(&self) {
        let top = self.top.load(Ordering::Relaxed);
        debug_assert!(top > 0, "popping an empty profiling stack");
        self.top.store(top.saturating_sub(1), Ordering::Release);
    }

    /// Number of frames a reader may inspect.
    pub fn depth(&self) -> usize {
        self.top.load(Ordering::Acquire).min(PROFILING_STACK_CAPACITY)
    }

    /// Reads the frame at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be below a `depth()` value observed on the calling
    /// thread, and the owning thread must either be the caller or be
    /// suspended for the duration of the read.
    pub(crate) unsafe fn frame(&self, index: usize) -> ProfilingStackFrame {
        (*self.frames[index].get()).assume_init()
    }
}

impl Default for ProfilingStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_frame(label: &'static str, sp: usize) -> ProfilingStackFrame {
        ProfilingStackFrame::new(label, None, ProfilingCategory::Other, FrameKind::Label, sp)
    }

    #[test]
    fn push_pop_updates_depth() {
        let stack = ProfilingStack::new();
        assert_eq!(stack.depth(), 0);
        stack.push(label_frame("a", 0x2000));
        stack.push(label_frame("b", 0x1000));
        assert_eq!(stack.depth(), 2);
        assert_eq!(unsafe { stack.frame(0) }.label, "a");
        assert_eq!(unsafe { stack.frame(1) }.label, "b");
        stack.pop();
        assert_eq!(stack.depth(), 1);
        stack.pop();
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn overflow_pushes_keep_pops_balanced() {
        let stack = ProfilingStack::new();
        for _ in 0..PROFILING_STACK_CAPACITY + 10 {
            stack.push(label_frame("deep", 0x1000));
        }
        assert_eq!(stack.depth(), PROFILING_STACK_CAPACITY);
        for _ in 0..10 {
            stack.pop();
        }
        assert_eq!(stack.depth(), PROFILING_STACK_CAPACITY);
        for _ in 0..PROFILING_STACK_CAPACITY {
            stack.pop();
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn dynamic_string_is_readable_while_on_stack() {
        let stack = ProfilingStack::new();
        let url = String::from("https://example.com/");
        stack.push(ProfilingStackFrame::new(
            "Load",
            Some(&url),
            ProfilingCategory::Network,
            FrameKind::Label,
            0x3000,
        ));
        let frame = unsafe { stack.frame(0) };
        assert_eq!(unsafe { frame.dynamic_str() }, Some("https://example.com/"));
        stack.pop();
    }
}
