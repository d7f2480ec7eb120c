//! An in-process sampling CPU profiler.
//!
//! A dedicated sampler thread periodically suspends each profiled thread,
//! reads its register file, unwinds its native stack, merges the result with
//! the thread's label stack, and appends the sample to a bounded ring
//! buffer. The buffer can be serialized at any time while profiling into a
//! gecko-format JSON profile.
//!
//! The intended call sequence from the embedding application:
//!
//! ```no_run
//! use inprocess_profiler as profiler;
//!
//! let stack_var = 0u8;
//! profiler::init(&stack_var as *const u8 as *const _);
//! profiler::start(
//!     1 << 20,
//!     1.0,
//!     profiler::Features::STACK_WALK | profiler::Features::THREADS,
//!     &["*"],
//!     None,
//! );
//! // ... run the workload ...
//! let mut out = Vec::new();
//! profiler::stream_json_for_this_process(&mut out, 0.0, false, None);
//! profiler::stop();
//! profiler::shutdown();
//! ```
//!
//! Worker threads call [`register_thread`] / [`unregister_thread`]
//! themselves, push label frames with [`push_label`], and report idle phases
//! with [`thread_sleep`] / [`thread_wake`] so the sampler can reuse their
//! previous sample instead of unwinding again.

use std::ffi::c_void;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use log::warn;
use serde_json::Value;

mod buffer;
mod category;
mod counters;
mod entry;
mod features;
mod markers;
mod merge;
mod pages;
mod platform;
mod profiling_stack;
mod sampler_thread;
mod shared_libraries;
mod startup;
mod state;
mod stream;
mod thread_info;
mod time;
mod unwind;

pub use buffer::{BufferError, BufferState, MIN_BUFFER_ENTRIES, SCRATCH_BUFFER_BYTES};
pub use category::ProfilingCategory;
pub use counters::CounterSource;
pub use features::Features;
pub use markers::{MarkerTiming, ProfilerMarker, TextMarker, TracingKind, TracingMarker};
pub use merge::StackCollector;
pub use pages::PageInfo;
pub use platform::SamplingError;
pub use profiling_stack::{FrameKind, ProfilingStackFrame, PROFILING_STACK_CAPACITY};
pub use shared_libraries::SharedLibrary;
pub use state::{DEFAULT_BUFFER_ENTRIES, DEFAULT_INTERVAL_MS};
pub use unwind::MAX_NATIVE_FRAMES;

use buffer::LocalProfileBuffer;
use entry::BufferEntry;
use features::RacyFeatures;
use markers::{MarkerRecord, NoPayloadMarker};
use merge::{merge_stacks, LocalBufferCollector};
use state::{LiveProfiledThread, ProfiledThreadData, StartParams};
use thread_info::RegisteredThread;
use unwind::{unwind_current_thread, FramePointerUnwinder, NativeStack, Unwinder};

/// Initializes the profiler and registers the calling thread as the main
/// thread. `stack_top` should point at a variable near the top of the
/// caller's stack; pass null to let the profiler derive the stack bounds
/// itself.
///
/// Recognized `BASE_PROFILER_*` environment variables are read here; with
/// `BASE_PROFILER_STARTUP` set, profiling starts immediately.
///
/// Panics if called twice without an intervening [`shutdown`].
pub fn init(stack_top: *const c_void) {
    let config = startup::read_startup_config();

    let start_params = config.start.then(|| StartParams {
        capacity_entries: config.capacity_entries,
        interval_ms: config.interval_ms,
        features: config.features,
        filters: config.filters.clone(),
        duration_s: config.duration_s,
    });

    let old_sampler = {
        let mut state = state::lock();
        assert!(state.core.is_none(), "the profiler is already initialized");

        let process_start = state::process_start_time();
        let main_thread = RegisteredThread::new(state::MAIN_THREAD_NAME, true, 0.0, stack_top as u64);
        let main_thread_id = main_thread.info.thread_id;
        thread_info::set_tls_registered_thread(main_thread.clone());

        let process_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown process".to_string());

        state.core = Some(state::CoreState {
            main_thread_id,
            process_start,
            process_name,
            shutdown_path: config.shutdown_path,
            threads: vec![main_thread],
            pages: Vec::new(),
            counters: Vec::new(),
            shared_libraries: Vec::new(),
            core_buffer: state::core_buffer(),
            active: None,
        });

        start_params.and_then(|params| state::locked_start(&mut state, params))
    };
    if let Some(old_sampler) = old_sampler {
        old_sampler.join();
    }
}

/// Stops profiling if needed and destroys the core state. With
/// `BASE_PROFILER_SHUTDOWN` set and a session active, the profile is
/// streamed to that file first.
pub fn shutdown() {
    let sampler = {
        let mut state = state::lock();
        let Some(core) = state.core.as_mut() else {
            return;
        };
        if core.active.is_some() {
            if let Some(path) = core.shutdown_path.clone() {
                match std::fs::File::create(&path) {
                    Ok(mut file) => {
                        let options = stream::StreamOptions {
                            since_time_ms: 0.0,
                            is_shutting_down: true,
                            only_threads: None,
                        };
                        stream::locked_stream_json(core, &options, &mut file);
                    }
                    Err(err) => warn!("failed to write the shutdown profile: {err}"),
                }
            }
        }
        let sampler = state::locked_stop(core);
        state.core = None;
        sampler
    };
    // The TLS slot of the thread driving the shutdown (normally the main
    // thread) is cleared so a later init can register it again.
    let _ = thread_info::take_tls_registered_thread();
    if let Some(sampler) = sampler {
        sampler.join();
    }
}

/// A per-thread token returned by [`register_thread`]. It is deliberately
/// not `Send`: label frames may only be pushed by the thread that owns the
/// profiling stack.
pub struct ProfilingStackHandle {
    thread: Arc<RegisteredThread>,
    _not_send: PhantomData<*const ()>,
}

impl ProfilingStackHandle {
    pub fn thread_id(&self) -> u32 {
        self.thread.info.thread_id
    }

    pub fn is_being_profiled(&self) -> bool {
        self.thread.racy.is_being_profiled()
    }
}

/// Registers the calling thread. If a session is active and the thread
/// matches its filters, sampling of the thread begins with the next tick.
///
/// Panics if the calling thread is already registered.
pub fn register_thread(name: &str, stack_top: *const c_void) -> ProfilingStackHandle {
    assert!(
        thread_info::with_tls_registered_thread(|_| ()).is_none(),
        "thread \"{name}\" is already registered with the profiler"
    );

    let thread = {
        let mut state = state::lock();
        let core = state
            .core
            .as_mut()
            .expect("register_thread called before init");
        let now_ms = core.process_start.elapsed_ms();
        let thread = RegisteredThread::new(name, false, now_ms, stack_top as u64);
        core.threads.push(thread.clone());
        if let Some(active) = core.active.as_mut() {
            if state::should_profile_thread(active.features, &active.filters, &thread.info) {
                thread.racy.set_is_being_profiled(true);
                active.live.push(LiveProfiledThread {
                    thread: thread.clone(),
                    data: ProfiledThreadData::new(thread.info.clone()),
                });
            }
        }
        thread
    };
    thread_info::set_tls_registered_thread(thread.clone());
    ProfilingStackHandle {
        thread,
        _not_send: PhantomData,
    }
}

/// Unregisters the calling thread. While a session is active, the thread's
/// samples stay in the profile until the buffer wraps past them.
pub fn unregister_thread() {
    let Some(thread) = thread_info::take_tls_registered_thread() else {
        return;
    };
    let mut state = state::lock();
    if let Some(core) = state.core.as_mut() {
        let now_ms = core.process_start.elapsed_ms();
        state::locked_unregister_thread(core, &thread, now_ms);
    }
}

/// Registers a document context. A prior registration with the same inner
/// window id is replaced if it was a transient `about:blank` document;
/// otherwise the call is a no-op.
pub fn register_page(
    browsing_context_id: u64,
    inner_window_id: u64,
    url: &str,
    embedder_inner_window_id: u64,
) {
    let mut state = state::lock();
    let Some(core) = state.core.as_mut() else {
        return;
    };
    if let Some(active) = core.active.as_mut() {
        active.discard_expired_pages(&core.core_buffer);
    }
    pages::register_page(
        &mut core.pages,
        PageInfo {
            browsing_context_id,
            inner_window_id,
            url: url.to_string(),
            embedder_inner_window_id,
        },
    );
}

/// Unregisters the page with the given inner window id. While a session is
/// active the page is kept, stamped with the current buffer position, until
/// no buffered data can refer to it anymore.
pub fn unregister_page(inner_window_id: u64) {
    let mut state = state::lock();
    let Some(core) = state.core.as_mut() else {
        return;
    };
    let mut removed = Vec::new();
    core.pages.retain(|page| {
        if page.inner_window_id == inner_window_id {
            removed.push(page.clone());
            false
        } else {
            true
        }
    });
    if let Some(active) = core.active.as_mut() {
        let position = core.core_buffer.state().range_end;
        for page in removed {
            active.dead_pages.push((page, position));
        }
    }
}

pub fn clear_all_pages() {
    let mut state = state::lock();
    if let Some(core) = state.core.as_mut() {
        core.pages.clear();
    }
}

/// Starts profiling. An already-running session is stopped first, with the
/// lock held across the switch, so no caller can observe a gap.
///
/// `capacity_entries` is clamped to a power of two of at least
/// [`MIN_BUFFER_ENTRIES`]; a non-positive `interval_ms` falls back to
/// [`DEFAULT_INTERVAL_MS`]; a non-positive duration means unlimited.
pub fn start(
    capacity_entries: u32,
    interval_ms: f64,
    features: Features,
    filters: &[&str],
    duration_s: Option<f64>,
) {
    let params = StartParams {
        capacity_entries,
        interval_ms,
        features,
        filters: filters.iter().map(|f| f.to_string()).collect(),
        duration_s,
    };
    let old_sampler = {
        let mut state = state::lock();
        state::locked_start(&mut state, params)
    };
    if let Some(old_sampler) = old_sampler {
        old_sampler.join();
    }
}

/// Starts profiling unless a session with exactly these parameters is
/// already running. Returns true when a new session was started.
pub fn ensure_started(
    capacity_entries: u32,
    interval_ms: f64,
    features: Features,
    filters: &[&str],
    duration_s: Option<f64>,
) -> bool {
    let params = StartParams {
        capacity_entries,
        interval_ms,
        features,
        filters: filters.iter().map(|f| f.to_string()).collect(),
        duration_s,
    };
    let old_sampler = {
        let mut state = state::lock();
        let equal = state
            .core
            .as_ref()
            .and_then(|core| core.active.as_ref())
            .is_some_and(|active| active.equals(&params));
        if equal {
            return false;
        }
        state::locked_start(&mut state, params)
    };
    if let Some(old_sampler) = old_sampler {
        old_sampler.join();
    }
    true
}

/// Stops profiling and discards the buffer. Returns false when no session
/// was active.
pub fn stop() -> bool {
    let sampler = {
        let mut state = state::lock();
        let Some(core) = state.core.as_mut() else {
            return false;
        };
        match state::locked_stop(core) {
            Some(sampler) => sampler,
            None => return false,
        }
    };
    // Joining must happen with the lock released; the sampler's final
    // iteration takes the lock to observe the teardown.
    sampler.join();
    true
}

/// Pauses periodic sampling. Markers keep being recorded while paused.
/// Returns false when no session is active.
pub fn pause() -> bool {
    let mut state = state::lock();
    let Some(core) = state.core.as_mut() else {
        return false;
    };
    let Some(active) = core.active.as_mut() else {
        return false;
    };
    if !active.paused {
        active.paused = true;
        RacyFeatures::set_paused();
        let now_ms = core.process_start.elapsed_ms();
        let _ = core.core_buffer.append(&BufferEntry::Pause(now_ms));
    }
    true
}

/// Resumes periodic sampling. Returns false when no session is active.
pub fn resume() -> bool {
    let mut state = state::lock();
    let Some(core) = state.core.as_mut() else {
        return false;
    };
    let Some(active) = core.active.as_mut() else {
        return false;
    };
    if active.paused {
        active.paused = false;
        let now_ms = core.process_start.elapsed_ms();
        let _ = core.core_buffer.append(&BufferEntry::Resume(now_ms));
        RacyFeatures::set_unpaused();
    }
    true
}

/// Lock-free activation check, suitable for hot paths.
pub fn is_active() -> bool {
    RacyFeatures::is_active()
}

/// The profiler's id for the calling thread.
pub fn current_thread_id() -> u32 {
    platform::current_thread_id()
}

/// Whether the calling thread currently has a registration.
pub fn is_thread_registered() -> bool {
    thread_info::with_tls_registered_thread(|_| ()).is_some()
}

pub fn is_paused() -> bool {
    RacyFeatures::is_paused()
}

pub fn is_active_with_feature(feature: Features) -> bool {
    RacyFeatures::is_active_with_feature(feature)
}

/// For gating work that must not run with the privacy feature on.
pub fn is_active_without_privacy() -> bool {
    RacyFeatures::is_active_without_privacy()
}

pub fn is_active_and_unpaused_without_privacy() -> bool {
    RacyFeatures::is_active_and_unpaused_without_privacy()
}

/// Whether the calling thread is the one that ran [`init`].
pub fn is_main_thread() -> bool {
    let state = state::lock();
    state
        .core
        .as_ref()
        .is_some_and(|core| core.main_thread_id == platform::current_thread_id())
}

/// Registers a counter to be sampled once per tick.
pub fn add_sampled_counter(counter: Arc<dyn CounterSource>) {
    let mut state = state::lock();
    if let Some(core) = state.core.as_mut() {
        core.counters.push(counter);
    }
}

pub fn remove_sampled_counter(counter: &Arc<dyn CounterSource>) {
    let mut state = state::lock();
    if let Some(core) = state.core.as_mut() {
        core.counters
            .retain(|registered| !counters::same_counter(registered, counter));
    }
}

/// An RAII guard for one label frame. Pops the frame when dropped. Not
/// `Send`; the frame must be popped by the thread that pushed it.
pub struct LabelGuard<'a> {
    pushed: bool,
    _dynamic: PhantomData<&'a str>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Drop for LabelGuard<'a> {
    fn drop(&mut self) {
        if self.pushed {
            thread_info::with_tls_registered_thread(|thread| thread.profiling_stack.pop());
        }
    }
}

fn push_label_impl<'a>(
    label: &'static str,
    dynamic: Option<&'a str>,
    category: ProfilingCategory,
    kind: FrameKind,
) -> LabelGuard<'a> {
    // Cheap short-circuit while inactive; no lock, no TLS access.
    if !RacyFeatures::is_active() {
        return LabelGuard {
            pushed: false,
            _dynamic: PhantomData,
            _not_send: PhantomData,
        };
    }
    // Address of a local as an approximation of the instrumented scope's
    // stack pointer. Deeper scopes get strictly lower addresses, which is
    // all the stack merge needs.
    let stack_marker = 0u32;
    let stack_address = &stack_marker as *const u32 as usize;
    let pushed = thread_info::with_tls_registered_thread(|thread| {
        thread.profiling_stack.push(ProfilingStackFrame::new(
            label,
            dynamic,
            category,
            kind,
            stack_address,
        ));
    })
    .is_some();
    LabelGuard {
        pushed,
        _dynamic: PhantomData,
        _not_send: PhantomData,
    }
}

/// Pushes a label frame onto the calling thread's profiling stack for the
/// lifetime of the returned guard.
pub fn push_label(label: &'static str, category: ProfilingCategory) -> LabelGuard<'static> {
    push_label_impl(label, None, category, FrameKind::Label)
}

/// Like [`push_label`], with an additional dynamic string (say, a URL or a
/// function argument). The string is borrowed for the guard's lifetime and
/// copied into the buffer only when a sample catches the frame.
pub fn push_label_dynamic<'a>(
    label: &'static str,
    dynamic: &'a str,
    category: ProfilingCategory,
) -> LabelGuard<'a> {
    push_label_impl(label, Some(dynamic), category, FrameKind::Label)
}

/// Tells the profiler the calling thread is about to block. While a thread
/// is marked asleep, the sampler copies its previous sample instead of
/// suspending and unwinding it.
pub fn thread_sleep() {
    thread_info::with_tls_registered_thread(|thread| thread.racy.set_sleeping());
}

pub fn thread_wake() {
    thread_info::with_tls_registered_thread(|thread| thread.racy.set_awake());
}

pub fn thread_is_sleeping() -> bool {
    thread_info::with_tls_registered_thread(|thread| thread.racy.is_sleeping()).unwrap_or(false)
}

fn insert_marker_record(record: MarkerRecord) {
    // The shared buffer has its own mutex and rejects the write cleanly if
    // profiling just stopped; the profiler lock is not needed here.
    let _ = state::core_buffer().append(&BufferEntry::MarkerData(record.to_blob()));
}

/// Adds an instant marker with no payload on the calling thread.
pub fn add_marker(name: &str, category: ProfilingCategory) {
    if !RacyFeatures::is_active_without_privacy() {
        return;
    }
    let now_ms = state::process_start_time().elapsed_ms();
    add_marker_for_thread(
        platform::current_thread_id(),
        name,
        category,
        MarkerTiming::Instant(now_ms),
        &NoPayloadMarker,
    );
}

/// Adds a marker with a typed payload on the calling thread.
pub fn add_marker_with<T: ProfilerMarker>(
    name: &str,
    category: ProfilingCategory,
    timing: MarkerTiming,
    payload: &T,
) {
    add_marker_for_thread(platform::current_thread_id(), name, category, timing, payload);
}

/// Adds a marker attributed to another thread, typically used by IO or IPC
/// layers reporting on behalf of a blocked thread.
pub fn add_marker_for_thread<T: ProfilerMarker>(
    tid: u32,
    name: &str,
    category: ProfilingCategory,
    timing: MarkerTiming,
    payload: &T,
) {
    if !RacyFeatures::is_active_without_privacy() {
        return;
    }
    insert_marker_record(MarkerRecord::new(
        tid,
        name,
        category,
        timing,
        payload.json_marker_data(),
    ));
}

/// Adds a tracing marker: an instant or one end of an interval, tagged with
/// a tracing category string.
pub fn tracing_marker(
    category_str: &str,
    name: &str,
    category: ProfilingCategory,
    kind: TracingKind,
    inner_window_id: Option<u64>,
    cause: Option<&Backtrace>,
) {
    if !RacyFeatures::is_active_without_privacy() {
        return;
    }
    let now_ms = state::process_start_time().elapsed_ms();
    let marker = TracingMarker {
        category: category_str,
        inner_window_id,
        cause: cause.map(Backtrace::frame_strings),
    };
    add_marker_for_thread(
        platform::current_thread_id(),
        name,
        category,
        kind.timing(now_ms),
        &marker,
    );
}

/// Adds a text marker covering the given time range.
pub fn text_marker(
    name: &str,
    text: &str,
    category: ProfilingCategory,
    start_ms: f64,
    end_ms: f64,
    inner_window_id: Option<u64>,
    cause: Option<&Backtrace>,
) {
    if !RacyFeatures::is_active_without_privacy() {
        return;
    }
    let marker = TextMarker {
        text,
        inner_window_id,
        cause: cause.map(Backtrace::frame_strings),
    };
    add_marker_for_thread(
        platform::current_thread_id(),
        name,
        category,
        MarkerTiming::Interval(start_ms, end_ms),
        &marker,
    );
}

/// A detached synchronous sample of the calling thread, usable as a marker
/// cause after profiling has moved on.
pub struct Backtrace {
    tid: u32,
    buffer: LocalProfileBuffer,
}

impl Backtrace {
    pub fn thread_id(&self) -> u32 {
        self.tid
    }

    /// Number of captured frames, native and label together.
    pub fn frame_count(&self) -> usize {
        self.buffer
            .collect_entries()
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry,
                    BufferEntry::NativeLeafAddr(_) | BufferEntry::Label(_)
                )
            })
            .count()
    }

    /// Frame descriptions, oldest frame first.
    pub fn frame_strings(&self) -> Vec<String> {
        let mut frames = Vec::new();
        let mut pending_label: Option<(String, String)> = None;
        for (_, entry) in self.buffer.collect_entries() {
            match entry {
                BufferEntry::NativeLeafAddr(address) => frames.push(format!("0x{address:x}")),
                BufferEntry::Label(label) => pending_label = Some((label.to_string(), String::new())),
                BufferEntry::DynamicStringFragment(fragment) => {
                    if let Some((_, dynamic)) = pending_label.as_mut() {
                        dynamic.push_str(BufferEntry::fragment_str(&fragment));
                    }
                }
                BufferEntry::CategoryPair(_) => {
                    if let Some((label, dynamic)) = pending_label.take() {
                        if dynamic.is_empty() {
                            frames.push(label);
                        } else {
                            frames.push(format!("{label} {dynamic}"));
                        }
                    }
                }
                _ => {}
            }
        }
        frames
    }
}

/// Synchronously samples the calling thread. Returns `None` when the
/// profiler is inactive or the thread is not registered.
pub fn get_backtrace() -> Option<Backtrace> {
    if !RacyFeatures::is_active() {
        return None;
    }
    let thread = thread_info::with_tls_registered_thread(Arc::clone)?;
    let tid = thread.info.thread_id;
    let now_ms = state::process_start_time().elapsed_ms();

    let mut buffer = LocalProfileBuffer::new(SCRATCH_BUFFER_BYTES);
    let _ = buffer.append(&BufferEntry::ThreadId(tid));
    let _ = buffer.append(&BufferEntry::Time(now_ms));

    let mut native = NativeStack::new();
    unwind_current_thread(&mut native);
    let mut collector = LocalBufferCollector::new(&mut buffer);
    // Reading our own profiling stack is always safe.
    merge_stacks(&thread.profiling_stack, &native, &mut collector);

    Some(Backtrace { tid, buffer })
}

/// One-off sample of another registered thread, without requiring an active
/// session. Uses the setup-free frame-pointer unwinder. Returns false when
/// the thread is unknown or is the calling thread.
///
/// The collector runs inside the suspension window and must follow its
/// rules: no allocation, no locks.
pub fn suspend_and_sample_thread(
    tid: u32,
    features: Features,
    collector: &mut dyn StackCollector,
) -> bool {
    if tid == platform::current_thread_id() {
        return false;
    }
    let state = state::lock();
    let Some(core) = state.core.as_ref() else {
        return false;
    };
    let Some(thread) = core.threads.iter().find(|t| t.info.thread_id == tid) else {
        return false;
    };

    let mut sampler = platform::Sampler::new();
    let mut native = NativeStack::new();
    let with_native_stack = features.contains(Features::STACK_WALK);
    let result = sampler.suspend_and_sample_resume(thread.platform_handle, |regs| {
        if with_native_stack {
            FramePointerUnwinder.unwind(regs, thread.stack_top, &mut native);
        }
        merge_stacks(&thread.profiling_stack, &native, collector);
    });
    sampler.disable();
    result.is_ok()
}

/// Stores a serialized profile received from an exiting child process. It is
/// spliced into this process's streamed profile for as long as the buffer
/// still covers the position at which it was gathered.
pub fn received_exit_profile(json: String) {
    let mut state = state::lock();
    let Some(core) = state.core.as_mut() else {
        return;
    };
    let position_at_gather = core.core_buffer.state().range_end;
    if let Some(active) = core.active.as_mut() {
        active.exit_profiles.push(state::ExitProfile {
            json,
            position_at_gather,
        });
    }
}

/// Supplies the shared-library list for the profile's `libs` section.
pub fn set_shared_libraries(mut libraries: Vec<SharedLibrary>) {
    libraries.sort_by_key(|lib| lib.start);
    let mut state = state::lock();
    if let Some(core) = state.core.as_mut() {
        core.shared_libraries = libraries;
    }
}

pub fn set_process_name(name: &str) {
    let mut state = state::lock();
    if let Some(core) = state.core.as_mut() {
        core.process_name = name.to_string();
    }
}

/// Streams the gecko-format JSON profile for this process into `writer`.
/// Samples and markers before `since_time_ms` are skipped; `only_threads`
/// restricts the output to the given thread ids. Returns false when no
/// session is active.
pub fn stream_json_for_this_process(
    writer: &mut dyn io::Write,
    since_time_ms: f64,
    is_shutting_down: bool,
    only_threads: Option<&[u32]>,
) -> bool {
    let mut state = state::lock();
    let Some(core) = state.core.as_mut() else {
        return false;
    };
    let options = stream::StreamOptions {
        since_time_ms,
        is_shutting_down,
        only_threads,
    };
    stream::locked_stream_json(core, &options, writer)
}

/// Convenience wrapper returning the profile as a parsed JSON value.
pub fn profile_json(since_time_ms: f64) -> Option<Value> {
    let mut out = Vec::new();
    if !stream_json_for_this_process(&mut out, since_time_ms, false, None) {
        return None;
    }
    serde_json::from_slice(&out).ok()
}
