//! The dedicated thread that drives periodic sampling.
//!
//! Each iteration takes the profiler lock, checks that the active state it
//! was spawned for still exists (by generation), sweeps expired exit
//! profiles, samples counters, and then samples every live profiled thread.
//! Per-thread samples are unwound into a local scratch buffer while the
//! target is suspended, because the shared buffer's mutex must never be
//! taken inside the suspension window, and are copied into the shared
//! buffer afterwards.
//!
//! Stop is cooperative: tearing down the active state (or starting a new
//! one, which bumps the generation) makes the next iteration return. The
//! handle join must happen with the lock released, since that final
//! iteration needs the lock to observe its own termination.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::buffer::{LocalProfileBuffer, ProfileBuffer, SCRATCH_BUFFER_BYTES};
use crate::counters::counter_id;
use crate::entry::BufferEntry;
use crate::features::Features;
use crate::merge::{merge_stacks, LocalBufferCollector};
use crate::platform::{Sampler, SamplingError};
use crate::state;
use crate::time::ProcessStartTime;
use crate::unwind::{FramePointerUnwinder, NativeStack, Unwinder};

pub(crate) struct SamplerThreadHandle {
    thread: JoinHandle<()>,
}

impl SamplerThreadHandle {
    /// Blocks until the sampler thread has observed its termination. Must be
    /// called with the profiler lock released.
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

pub(crate) fn spawn(
    generation: u32,
    interval_ms: f64,
    buffer: Arc<ProfileBuffer>,
    process_start: ProcessStartTime,
) -> SamplerThreadHandle {
    let thread = thread::Builder::new()
        .name("SamplerThread".to_string())
        .spawn(move || run(generation, interval_ms, buffer, process_start))
        .expect("failed to spawn the sampler thread");
    SamplerThreadHandle { thread }
}

fn run(generation: u32, interval_ms: f64, buffer: Arc<ProfileBuffer>, start: ProcessStartTime) {
    info!("sampler thread running (generation {generation}, interval {interval_ms}ms)");

    let mut sampler = Sampler::new();
    let unwinder = FramePointerUnwinder;
    let mut native_stack = NativeStack::new();
    let mut scratch = LocalProfileBuffer::new(SCRATCH_BUFFER_BYTES);

    let interval = Duration::from_secs_f64(interval_ms / 1000.0);
    // Positive when running behind schedule, to shorten the next sleep.
    let mut last_sleep_overshoot = Duration::ZERO;
    let mut sample_start = Instant::now();

    loop {
        // This scope is for the lock guard. It ends before the sleep below.
        {
            let mut state = state::lock();
            let lock_acquired = Instant::now();

            let Some(core) = state.core.as_mut() else {
                break;
            };
            let state::CoreState {
                active, counters, ..
            } = core;
            // A stop may have raced a new start; the generation tells a
            // stale sampler apart from the one the new session spawned.
            let Some(active) = active.as_mut() else {
                break;
            };
            if active.generation != generation {
                break;
            }

            active.clear_expired_exit_profiles(&buffer);
            let cleaning_done = Instant::now();

            if !active.paused {
                let now_ms = start.elapsed_ms();

                if let Some(duration_s) = active.duration_s {
                    buffer.discard_before(now_ms - duration_s * 1000.0);
                }

                for counter in counters.iter() {
                    let (count, number) = counter.sample();
                    let _ = buffer.append(&BufferEntry::CounterId(counter_id(counter)));
                    let _ = buffer.append(&BufferEntry::Time(now_ms));
                    let _ = buffer.append(&BufferEntry::CounterKey(0));
                    let _ = buffer.append(&BufferEntry::Count(count));
                    if number != 0 {
                        let _ = buffer.append(&BufferEntry::Number(number));
                    }
                }
                let counters_done = Instant::now();

                if !active.features.contains(Features::NO_STACK_SAMPLING) {
                    for index in 0..active.live.len() {
                        let live = &mut active.live[index];
                        let thread = live.thread.clone();
                        let tid = thread.info.thread_id;

                        // A thread asleep since its last sample cannot have
                        // changed its stack; copying the previous sample is
                        // much cheaper than suspending and unwinding.
                        if thread.racy.can_duplicate_last_sample_due_to_sleep() {
                            if let Some(last_pos) = live.data.last_sample_pos {
                                let now_ms = start.elapsed_ms();
                                if let Some(new_pos) =
                                    buffer.duplicate_last_sample(tid, last_pos, now_ms)
                                {
                                    live.data.last_sample_pos = Some(new_pos);
                                    continue;
                                }
                            }
                        }

                        let now_ms = start.elapsed_ms();

                        // The sample header goes into the shared buffer first
                        // so the sample's position there is known; the frames
                        // only exist in the scratch buffer for now.
                        let Ok(sample_pos) = buffer.append_thread_id_and_time(tid, now_ms) else {
                            continue;
                        };
                        live.data.last_sample_pos = Some(sample_pos);

                        let pre_state = scratch.state();
                        native_stack.clear();
                        let result = sampler.suspend_and_sample_resume(
                            thread.platform_handle,
                            |regs| {
                                // Critical section: no allocation, no locks.
                                unwinder.unwind(regs, thread.stack_top, &mut native_stack);
                                let mut collector = LocalBufferCollector::new(&mut scratch);
                                merge_stacks(
                                    &thread.profiling_stack,
                                    &native_stack,
                                    &mut collector,
                                );
                            },
                        );
                        match result {
                            Ok(()) => {}
                            Err(SamplingError::SelfSample) => {
                                warn!("skipping sample of the sampler's own thread");
                            }
                            Err(err) => {
                                // The thread is likely gone; it will be
                                // swept from the registry by its own exit.
                                info!("sample of thread {tid} failed: {err}");
                            }
                        }

                        let post_state = scratch.state();
                        let sample_bytes = post_state.range_end - pre_state.range_end;
                        if post_state.cleared_block_count != pre_state.cleared_block_count {
                            warn!("stack sample too big for local storage, needed {sample_bytes} bytes");
                        } else if sample_bytes >= buffer.capacity() as u64 {
                            warn!("stack sample too big for profiler storage, needed {sample_bytes} bytes");
                        } else {
                            let _ = buffer.append_contents(&scratch);
                        }
                        scratch.clear();
                    }
                }
                let threads_done = Instant::now();

                let _ = buffer.append(&BufferEntry::ProfilerOverheadTime(
                    start.instant_to_ms(sample_start),
                ));
                for duration in [
                    lock_acquired - sample_start,
                    cleaning_done - lock_acquired,
                    counters_done - cleaning_done,
                    threads_done - counters_done,
                ] {
                    let _ = buffer.append(&BufferEntry::ProfilerOverheadDuration(
                        duration.as_secs_f64() * 1000.0,
                    ));
                }
            }
        }
        // The lock is not held after this point.

        // Sleep for the remainder of the interval, adjusted by how much the
        // previous sleep overshot, to stay on schedule in the presence of
        // imprecise sleeps.
        let intended_wakeup_time = sample_start + interval;
        let intended_wait_time = intended_wakeup_time.saturating_duration_since(Instant::now());
        let sleep_time = intended_wait_time.saturating_sub(last_sleep_overshoot);
        sleep_and_save_overshoot(sleep_time, &mut last_sleep_overshoot);
        sample_start = Instant::now();
    }

    sampler.disable();
    info!("sampler thread exiting (generation {generation})");
}

fn sleep_and_save_overshoot(duration: Duration, overshoot: &mut Duration) {
    let before_sleep = Instant::now();
    thread::sleep(duration);
    let after_sleep = Instant::now();
    *overshoot = after_sleep
        .duration_since(before_sleep)
        .checked_sub(duration)
        .unwrap_or(Duration::ZERO);
}
