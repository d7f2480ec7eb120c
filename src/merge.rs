//! Interleaving of native frames with label frames.
//!
//! The profiling stack is ordered oldest to newest and the native stack
//! newest to oldest, so the merge walks them from opposite ends and emits a
//! single oldest-to-newest sequence. Stacks grow downward: at each step the
//! candidate with the higher stack-pointer address is the older frame and is
//! emitted first. A native frame whose stack pointer equals a label frame's
//! is the same call site seen twice; the label frame wins and the native
//! frame is dropped.
//!
//! Runs within the sampler's critical section and must not allocate.

use crate::buffer::LocalProfileBuffer;
use crate::category::ProfilingCategory;
use crate::entry::BufferEntry;
use crate::profiling_stack::{FrameKind, ProfilingStack};
use crate::unwind::NativeStack;

/// Receives the merged frame sequence, oldest frame first.
pub trait StackCollector {
    fn collect_native_leaf_addr(&mut self, address: u64);
    fn collect_label_frame(
        &mut self,
        label: &'static str,
        dynamic: Option<&str>,
        category: ProfilingCategory,
    );
}

/// Merges `profiling_stack` and `native` into `collector`.
///
/// The thread owning `profiling_stack` must be the calling thread or be
/// suspended for the duration of the call.
pub(crate) fn merge_stacks(
    profiling_stack: &ProfilingStack,
    native: &NativeStack,
    collector: &mut dyn StackCollector,
) {
    let label_count = profiling_stack.depth();
    let mut label_index = 0usize;
    let mut native_index = native.len() as isize - 1;
    let mut last_label_sp = 0usize;

    while label_index != label_count || native_index >= 0 {
        let mut label_sp = 0usize;
        if label_index != label_count {
            // Safety: label_index < depth() and the owner is suspended or is
            // the current thread, per this function's contract.
            let frame = unsafe { profiling_stack.frame(label_index) };

            if matches!(frame.kind, FrameKind::Label | FrameKind::SpMarker) {
                last_label_sp = frame.stack_address;
            }

            // On-stack-replacement frames duplicate a following native frame
            // and are consumed without emission.
            if frame.kind == FrameKind::JsOsr {
                label_index += 1;
                continue;
            }

            label_sp = last_label_sp;
        }

        // Same address on both sides: the label frame trumps the native one.
        if native_index >= 0 && label_sp != 0 && label_sp == native.sp_at(native_index as usize) as usize
        {
            native_index -= 1;
        }

        let native_sp = if native_index >= 0 {
            native.sp_at(native_index as usize) as usize
        } else {
            0
        };

        if label_index != label_count && (native_index < 0 || label_sp > native_sp) {
            // Safety: as above.
            let frame = unsafe { profiling_stack.frame(label_index) };
            if frame.kind != FrameKind::SpMarker {
                // Safety: the frame is still on the stack, so its dynamic
                // string is alive.
                let dynamic = unsafe { frame.dynamic_str() };
                collector.collect_label_frame(frame.label, dynamic, frame.category);
            }
            label_index += 1;
            continue;
        }

        if native_index >= 0 {
            collector.collect_native_leaf_addr(native.pc_at(native_index as usize));
            native_index -= 1;
        }
    }
}

/// Collector that encodes frames straight into a scratch buffer. Per label
/// frame it appends a `Label` block, the dynamic string in fragments, and the
/// closing `CategoryPair`; native frames become single `NativeLeafAddr`
/// blocks. None of this allocates.
pub(crate) struct LocalBufferCollector<'a> {
    buffer: &'a mut LocalProfileBuffer,
}

impl<'a> LocalBufferCollector<'a> {
    pub fn new(buffer: &'a mut LocalProfileBuffer) -> Self {
        LocalBufferCollector { buffer }
    }
}

impl<'a> StackCollector for LocalBufferCollector<'a> {
    fn collect_native_leaf_addr(&mut self, address: u64) {
        let _ = self.buffer.append(&BufferEntry::NativeLeafAddr(address));
    }

    fn collect_label_frame(
        &mut self,
        label: &'static str,
        dynamic: Option<&str>,
        category: ProfilingCategory,
    ) {
        let _ = self.buffer.append(&BufferEntry::Label(label));
        if let Some(dynamic) = dynamic {
            for fragment in BufferEntry::dynamic_string_fragments(dynamic) {
                let _ = self
                    .buffer
                    .append(&BufferEntry::DynamicStringFragment(fragment));
            }
        }
        let _ = self.buffer.append(&BufferEntry::CategoryPair(category as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiling_stack::ProfilingStackFrame;

    #[derive(Debug, PartialEq)]
    enum Collected {
        Native(u64),
        Label(&'static str),
    }

    struct VecCollector(Vec<Collected>);

    impl StackCollector for VecCollector {
        fn collect_native_leaf_addr(&mut self, address: u64) {
            self.0.push(Collected::Native(address));
        }

        fn collect_label_frame(
            &mut self,
            label: &'static str,
            _dynamic: Option<&str>,
            _category: ProfilingCategory,
        ) {
            self.0.push(Collected::Label(label));
        }
    }

    fn push_frame(stack: &ProfilingStack, label: &'static str, kind: FrameKind, sp: usize) {
        stack.push(ProfilingStackFrame::new(
            label,
            None,
            ProfilingCategory::Other,
            kind,
            sp,
        ));
    }

    #[test]
    fn orders_by_stack_pointer_and_suppresses_ties() {
        // Native stack innermost first: newest at 0x1000, oldest at 0x1100.
        let mut native = NativeStack::new();
        native.push(0xaa, 0x1000);
        native.push(0xbb, 0x1100);

        // Label stack oldest first with decreasing stack pointers.
        let stack = ProfilingStack::new();
        push_frame(&stack, "outer", FrameKind::Label, 0x1100);
        push_frame(&stack, "inner", FrameKind::Label, 0x1050);

        let mut collector = VecCollector(Vec::new());
        merge_stacks(&stack, &native, &mut collector);

        // The native frame at 0x1100 is the same call site as "outer" and is
        // dropped; everything else comes out oldest to newest.
        assert_eq!(
            collector.0,
            vec![
                Collected::Label("outer"),
                Collected::Label("inner"),
                Collected::Native(0xaa),
            ]
        );
    }

    #[test]
    fn sp_markers_annotate_but_are_not_emitted() {
        let mut native = NativeStack::new();
        native.push(0xaa, 0x1000);

        let stack = ProfilingStack::new();
        push_frame(&stack, "marker", FrameKind::SpMarker, 0x1000);

        let mut collector = VecCollector(Vec::new());
        merge_stacks(&stack, &native, &mut collector);

        // The marker suppressed the tied native frame and emitted nothing.
        assert_eq!(collector.0, vec![]);
    }

    #[test]
    fn osr_frames_are_consumed_silently() {
        let mut native = NativeStack::new();
        native.push(0xaa, 0x1000);

        let stack = ProfilingStack::new();
        push_frame(&stack, "interp", FrameKind::Label, 0x2000);
        push_frame(&stack, "osr", FrameKind::JsOsr, 0x1800);

        let mut collector = VecCollector(Vec::new());
        merge_stacks(&stack, &native, &mut collector);

        assert_eq!(
            collector.0,
            vec![Collected::Label("interp"), Collected::Native(0xaa)]
        );
    }

    #[test]
    fn label_only_and_native_only_stacks_work() {
        let stack = ProfilingStack::new();
        push_frame(&stack, "only", FrameKind::Label, 0x500);
        let native = NativeStack::new();
        let mut collector = VecCollector(Vec::new());
        merge_stacks(&stack, &native, &mut collector);
        assert_eq!(collector.0, vec![Collected::Label("only")]);

        let empty_stack = ProfilingStack::new();
        let mut native = NativeStack::new();
        native.push(0x1, 0x100);
        native.push(0x2, 0x200);
        let mut collector = VecCollector(Vec::new());
        merge_stacks(&empty_stack, &native, &mut collector);
        assert_eq!(
            collector.0,
            vec![Collected::Native(0x2), Collected::Native(0x1)]
        );
    }
}
