//! The two-layered global state and its single serializing lock.
//!
//! Everything the profiler knows lives behind one mutex: the always-present
//! core state (thread, page and counter registries plus the shared buffer)
//! and, while profiling, the active state (configuration, the live and dead
//! profiled-thread lists, and the sampler thread handle). The state is
//! reachable only through [`lock`], so holding the returned guard is the
//! proof that the lock is held.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::buffer::{ProfileBuffer, BYTES_PER_ENTRY, MIN_BUFFER_ENTRIES};
use crate::counters::CounterSource;
use crate::features::{Features, RacyFeatures};
use crate::pages::PageInfo;
use crate::platform;
use crate::sampler_thread::{self, SamplerThreadHandle};
use crate::shared_libraries::SharedLibrary;
use crate::thread_info::{RegisteredThread, ThreadInfo};
use crate::time::ProcessStartTime;

/// Entry-count capacity used when none is specified.
pub const DEFAULT_BUFFER_ENTRIES: u32 = 1 << 20;

/// Entry-count capacity for startup profiling, which tends to run longer
/// before anyone looks at it.
pub const DEFAULT_STARTUP_ENTRIES: u32 = 1 << 22;

pub const DEFAULT_INTERVAL_MS: f64 = 1.0;

/// The main thread's fixed registry name.
pub(crate) const MAIN_THREAD_NAME: &str = "GeckoMain";

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// The timestamp anchor is reachable without the lock so marker producers
/// can stamp their records on the hot path. It survives shutdown; a profiler
/// reinitialized in the same process keeps the same anchor, which keeps all
/// timestamps monotonic.
static PROCESS_START: Lazy<ProcessStartTime> = Lazy::new(ProcessStartTime::now);

pub(crate) fn process_start_time() -> ProcessStartTime {
    *PROCESS_START
}

/// The shared core buffer is likewise a process-wide singleton so that
/// asynchronous producers racing a stop still find a buffer that can reject
/// them cleanly, without touching the lock.
static CORE_BUFFER: Lazy<Arc<ProfileBuffer>> =
    Lazy::new(|| Arc::new(ProfileBuffer::new_closed()));

pub(crate) fn core_buffer() -> Arc<ProfileBuffer> {
    CORE_BUFFER.clone()
}

pub(crate) struct GlobalState {
    pub core: Option<CoreState>,
}

static GLOBAL: Lazy<Mutex<GlobalState>> = Lazy::new(|| Mutex::new(GlobalState { core: None }));

/// Acquires the profiler lock. All mutation of [`GlobalState`] happens
/// through the guard this returns; the lock is not reentrant, so callees
/// must never call back into a public entry point.
pub(crate) fn lock() -> MutexGuard<'static, GlobalState> {
    GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State that exists from `init` to `shutdown`.
pub(crate) struct CoreState {
    pub main_thread_id: u32,
    pub process_start: ProcessStartTime,
    pub process_name: String,
    pub shutdown_path: Option<PathBuf>,
    pub threads: Vec<Arc<RegisteredThread>>,
    pub pages: Vec<Arc<PageInfo>>,
    pub counters: Vec<Arc<dyn CounterSource>>,
    pub shared_libraries: Vec<SharedLibrary>,
    /// Shared with marker producers and the sampler thread. Closed (empty,
    /// rejecting writes) whenever `active` is `None`, but kept here so that
    /// producers racing a stop still find a buffer to be rejected by.
    pub core_buffer: Arc<ProfileBuffer>,
    pub active: Option<ActiveState>,
}

/// Ancillary per-thread state owned by the active state. Lives on after its
/// thread unregisters, until the buffer no longer holds data for it.
pub(crate) struct ProfiledThreadData {
    pub info: Arc<ThreadInfo>,
    pub last_sample_pos: Option<u64>,
    pub buffer_position_when_unregistered: Option<u64>,
    pub unregister_time_ms: Option<f64>,
}

impl ProfiledThreadData {
    pub fn new(info: Arc<ThreadInfo>) -> Self {
        ProfiledThreadData {
            info,
            last_sample_pos: None,
            buffer_position_when_unregistered: None,
            unregister_time_ms: None,
        }
    }
}

pub(crate) struct LiveProfiledThread {
    pub thread: Arc<RegisteredThread>,
    pub data: ProfiledThreadData,
}

/// A profile blob from another process, retained until the buffer position
/// recorded at the time it was gathered has been overwritten.
pub(crate) struct ExitProfile {
    pub json: String,
    pub position_at_gather: u64,
}

pub(crate) struct ActiveState {
    pub generation: u32,
    pub capacity_entries: u32,
    pub duration_s: Option<f64>,
    pub interval_ms: f64,
    pub features: Features,
    pub filters: Vec<String>,
    pub live: Vec<LiveProfiledThread>,
    pub dead: Vec<ProfiledThreadData>,
    pub dead_pages: Vec<(Arc<PageInfo>, u64)>,
    pub exit_profiles: Vec<ExitProfile>,
    pub paused: bool,
    pub sampler_thread: Option<SamplerThreadHandle>,
}

impl ActiveState {
    pub fn equals(&self, params: &StartParams) -> bool {
        self.capacity_entries == clamp_capacity(params.capacity_entries)
            && self.duration_s == clamp_duration(params.duration_s)
            && self.interval_ms == clamp_interval(params.interval_ms)
            && self.features == adjust_features(params.features, &params.filters)
            && self.filters == params.filters
    }

    pub fn clear_expired_exit_profiles(&mut self, buffer: &ProfileBuffer) {
        let range_start = buffer.state().range_start;
        self.exit_profiles
            .retain(|profile| profile.position_at_gather >= range_start);
    }

    pub fn discard_expired_dead_threads(&mut self, buffer: &ProfileBuffer) {
        let range_start = buffer.state().range_start;
        self.dead.retain(|data| {
            data.buffer_position_when_unregistered
                .map_or(true, |pos| pos >= range_start)
        });
    }

    pub fn discard_expired_pages(&mut self, buffer: &ProfileBuffer) {
        let range_start = buffer.state().range_start;
        self.dead_pages.retain(|(_, pos)| *pos >= range_start);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StartParams {
    pub capacity_entries: u32,
    pub interval_ms: f64,
    pub features: Features,
    pub filters: Vec<String>,
    pub duration_s: Option<f64>,
}

fn clamp_capacity(capacity_entries: u32) -> u32 {
    capacity_entries
        .max(MIN_BUFFER_ENTRIES)
        .checked_next_power_of_two()
        .unwrap_or(1 << 31)
}

fn clamp_interval(interval_ms: f64) -> f64 {
    if interval_ms > 0.0 {
        interval_ms
    } else {
        DEFAULT_INTERVAL_MS
    }
}

fn clamp_duration(duration_s: Option<f64>) -> Option<f64> {
    duration_s.filter(|d| *d > 0.0)
}

/// Users who pass thread filters usually mean to profile those threads even
/// when they forget to also ask for the threads feature.
pub(crate) fn adjust_features(features: Features, filters: &[String]) -> Features {
    if filters.is_empty() {
        features
    } else {
        features | Features::THREADS
    }
}

/// Case-insensitive filter match. A thread is selected by an empty filter
/// list, a `"*"` entry, a substring of its name, or a `pid:<N>` entry naming
/// the current process.
pub(crate) fn thread_selected(filters: &[String], thread_name: &str) -> bool {
    if filters.is_empty() {
        return true;
    }
    let name = thread_name.to_lowercase();
    for filter in filters {
        if filter == "*" {
            return true;
        }
        if name.contains(&filter.to_lowercase()) {
            return true;
        }
        if let Some(pid) = filter.strip_prefix("pid:") {
            if pid == platform::current_process_id().to_string() {
                return true;
            }
        }
    }
    false
}

pub(crate) fn should_profile_thread(
    features: Features,
    filters: &[String],
    info: &ThreadInfo,
) -> bool {
    (info.is_main_thread || features.contains(Features::THREADS))
        && thread_selected(filters, &info.name)
}

/// Creates the active state and spawns its sampler thread. If a previous
/// session is running it is stopped first, with the lock held throughout so
/// no third party can observe the gap. Returns the old session's sampler
/// handle; the caller must join it after releasing the lock.
pub(crate) fn locked_start(
    state: &mut GlobalState,
    params: StartParams,
) -> Option<SamplerThreadHandle> {
    let core = state
        .core
        .as_mut()
        .expect("profiler_start before profiler_init");

    let old_sampler = locked_stop(core);

    let capacity_entries = clamp_capacity(params.capacity_entries);
    let interval_ms = clamp_interval(params.interval_ms);
    let duration_s = clamp_duration(params.duration_s);
    let features = adjust_features(params.features, &params.filters);

    let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    core.core_buffer
        .open(capacity_entries as usize * BYTES_PER_ENTRY);

    let mut live = Vec::new();
    for thread in &core.threads {
        if should_profile_thread(features, &params.filters, &thread.info) {
            thread.racy.set_is_being_profiled(true);
            live.push(LiveProfiledThread {
                thread: thread.clone(),
                data: ProfiledThreadData::new(thread.info.clone()),
            });
        }
    }

    let sampler_thread = sampler_thread::spawn(
        generation,
        interval_ms,
        core.core_buffer.clone(),
        core.process_start,
    );

    core.active = Some(ActiveState {
        generation,
        capacity_entries,
        duration_s,
        interval_ms,
        features,
        filters: params.filters,
        live,
        dead: Vec::new(),
        dead_pages: Vec::new(),
        exit_profiles: Vec::new(),
        paused: false,
        sampler_thread: Some(sampler_thread),
    });

    // Set up the racy activation word at the very end, once everything the
    // hot paths might touch is in place.
    RacyFeatures::set_active(features);

    old_sampler
}

/// Tears down the active state. Returns the sampler thread handle; the
/// caller must join it only after releasing the lock, because the sampler's
/// final iteration reacquires the lock to observe its own termination.
pub(crate) fn locked_stop(core: &mut CoreState) -> Option<SamplerThreadHandle> {
    let mut active = core.active.take()?;
    RacyFeatures::set_inactive();
    for thread in &core.threads {
        thread.racy.set_is_being_profiled(false);
    }
    core.core_buffer.close();
    active.sampler_thread.take()
}

/// Removes the calling thread's record from the registries. While a session
/// is active the per-thread data moves to the dead list, stamped with the
/// current buffer position, so existing samples stay interpretable.
pub(crate) fn locked_unregister_thread(
    core: &mut CoreState,
    thread: &Arc<RegisteredThread>,
    now_ms: f64,
) {
    if let Some(active) = core.active.as_mut() {
        active.discard_expired_dead_threads(&core.core_buffer);
        if let Some(index) = active
            .live
            .iter()
            .position(|live| Arc::ptr_eq(&live.thread, thread))
        {
            let mut entry = active.live.remove(index);
            entry.data.buffer_position_when_unregistered =
                Some(core.core_buffer.state().range_end);
            entry.data.unregister_time_ms = Some(now_ms);
            active.dead.push(entry.data);
        }
    }
    thread.racy.set_is_being_profiled(false);
    core.threads.retain(|t| !Arc::ptr_eq(t, thread));
}
