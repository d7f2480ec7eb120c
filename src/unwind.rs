//! Native stack unwinding behind a single façade.
//!
//! Implementations must uphold the critical-section contract: no heap
//! allocation and no lock acquisition, because the thread being unwound may
//! be suspended while holding the allocator's or any other lock. Frames are
//! produced innermost first, capped at [`MAX_NATIVE_FRAMES`].

use crate::platform::Registers;

/// Upper bound on collected native frames. Higher values make the unwinder
/// waste time on threads with pathologically deep or corrupt stacks.
pub const MAX_NATIVE_FRAMES: usize = 1024;

/// Fixed-size frame storage, preallocated outside the suspension window.
pub struct NativeStack {
    pcs: [u64; MAX_NATIVE_FRAMES],
    sps: [u64; MAX_NATIVE_FRAMES],
    count: usize,
}

impl NativeStack {
    pub fn new() -> Box<NativeStack> {
        Box::new(NativeStack {
            pcs: [0; MAX_NATIVE_FRAMES],
            sps: [0; MAX_NATIVE_FRAMES],
            count: 0,
        })
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    pub fn push(&mut self, pc: u64, sp: u64) -> bool {
        if self.count == MAX_NATIVE_FRAMES {
            return false;
        }
        self.pcs[self.count] = pc;
        self.sps[self.count] = sp;
        self.count += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn pc_at(&self, index: usize) -> u64 {
        self.pcs[index]
    }

    pub fn sp_at(&self, index: usize) -> u64 {
        self.sps[index]
    }
}

/// Unified unwinding entry point over the per-platform backends.
///
/// `unwind` may only be called while the thread owning `regs` is suspended,
/// or by that thread itself. An unwinder that fails partway leaves whatever
/// frames it did collect; the sample is still emitted with those.
pub trait Unwinder: Send + Sync {
    fn unwind(&self, regs: &Registers, stack_top: u64, native: &mut NativeStack);
}

/// Walks the frame-pointer chain between the suspended thread's stack
/// pointer and its stack top. Requires no per-module setup, which also makes
/// it the unwinder for one-off `suspend_and_sample_thread` calls.
///
/// Code compiled without frame pointers terminates the walk early; the
/// resulting partial stack is acceptable per the façade contract.
pub struct FramePointerUnwinder;

impl Unwinder for FramePointerUnwinder {
    fn unwind(&self, regs: &Registers, stack_top: u64, native: &mut NativeStack) {
        native.push(regs.pc, regs.sp);

        let word = std::mem::size_of::<u64>() as u64;
        let mut sp = regs.sp;
        let mut fp = regs.fp;
        loop {
            // A valid frame record lies within the stack, above the current
            // position, and is pointer aligned.
            if fp == 0
                || fp < sp
                || fp.checked_add(2 * word).map_or(true, |end| end > stack_top)
                || fp % word != 0
            {
                break;
            }
            // Safety: fp and fp+8 were bounds checked against the suspended
            // thread's live stack range, so both reads hit mapped memory.
            let (next_fp, return_address) =
                unsafe { ((fp as *const u64).read(), ((fp + word) as *const u64).read()) };
            if return_address == 0 {
                break;
            }
            if !native.push(return_address, fp) {
                break;
            }
            if next_fp <= fp {
                break;
            }
            sp = fp;
            fp = next_fp;
        }
        let _ = sp;
    }
}

/// Synchronous self-unwind for backtraces taken on the current thread. Not
/// bound by the critical-section contract (nothing is suspended), so it can
/// use the system unwinder, which handles frames without frame pointers.
pub fn unwind_current_thread(native: &mut NativeStack) {
    // Safety: only walks the calling thread's own stack.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let pc = frame.ip() as u64;
            let sp = frame.sp() as u64;
            native.push(pc, sp)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_pointer_walk_follows_a_synthetic_chain() {
        // Lay out two frame records in a local buffer acting as the stack.
        let mut fake_stack = [0u64; 8];
        let base = fake_stack.as_ptr() as u64;
        // Frame record at slot 2: next fp at slot 5, return address 0x111.
        fake_stack[2] = base + 5 * 8;
        fake_stack[3] = 0x111;
        // Frame record at slot 5: next fp of zero ends the walk.
        fake_stack[5] = 0;
        fake_stack[6] = 0x222;

        let regs = Registers {
            pc: 0xaaa,
            sp: base,
            fp: base + 2 * 8,
            lr: 0,
        };
        let mut native = NativeStack::new();
        FramePointerUnwinder.unwind(&regs, base + 8 * 8, &mut native);

        assert_eq!(native.len(), 3);
        assert_eq!(native.pc_at(0), 0xaaa);
        assert_eq!(native.pc_at(1), 0x111);
        assert_eq!(native.pc_at(2), 0x222);
        // Stack pointers are innermost first, increasing toward the root.
        assert!(native.sp_at(1) < native.sp_at(2));
    }

    #[test]
    fn self_unwind_produces_at_least_one_frame() {
        let mut native = NativeStack::new();
        unwind_current_thread(&mut native);
        assert!(!native.is_empty());
    }
}
