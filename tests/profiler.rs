//! End-to-end scenarios against the public API.
//!
//! The profiler is process-global, so every test takes `setup()`'s lock and
//! leaves the profiler stopped. `init` happens once for the whole process,
//! on whichever test thread gets there first; tests that need the calling
//! thread to be registered use [`Registration`], which registers the thread
//! unless it already is (and unregisters on drop only what it registered).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread;
use std::time::Duration;

use inprocess_profiler as profiler;
use profiler::{Features, ProfilingCategory};
use serde_json::Value;

static TEST_LOCK: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();

fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    INIT.call_once(|| {
        profiler::init(std::ptr::null());
    });
    profiler::stop();
    guard
}

struct Registration {
    registered_here: bool,
}

impl Registration {
    fn ensure() -> Self {
        if profiler::is_thread_registered() {
            Registration {
                registered_here: false,
            }
        } else {
            profiler::register_thread("TestThread", std::ptr::null());
            Registration {
                registered_here: true,
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registered_here {
            profiler::unregister_thread();
        }
    }
}

fn thread_names(profile: &Value) -> Vec<String> {
    profile["threads"]
        .as_array()
        .unwrap()
        .iter()
        .map(|thread| thread["name"].as_str().unwrap().to_string())
        .collect()
}

fn thread_index_by_tid(profile: &Value, tid: u32) -> usize {
    profile["threads"]
        .as_array()
        .unwrap()
        .iter()
        .position(|thread| thread["tid"] == u64::from(tid))
        .unwrap_or_else(|| panic!("no thread with tid {tid} in the profile"))
}

fn sample_rows<'p>(profile: &'p Value, thread_index: usize) -> &'p Vec<Value> {
    profile["threads"][thread_index]["samples"]["data"]
        .as_array()
        .unwrap()
}

fn marker_rows<'p>(profile: &'p Value, thread_index: usize) -> &'p Vec<Value> {
    profile["threads"][thread_index]["markers"]["data"]
        .as_array()
        .unwrap()
}

fn marker_names(profile: &Value, thread_index: usize) -> Vec<String> {
    let strings = profile["threads"][thread_index]["stringTable"]
        .as_array()
        .unwrap();
    marker_rows(profile, thread_index)
        .iter()
        .map(|row| {
            let name_index = row[0].as_u64().unwrap() as usize;
            strings[name_index].as_str().unwrap().to_string()
        })
        .collect()
}

#[test]
fn periodic_sampling_produces_a_streamable_profile() {
    let _guard = setup();
    let _registration = Registration::ensure();
    profiler::start(
        8192,
        10.0,
        Features::STACK_WALK | Features::THREADS,
        &["*"],
        None,
    );
    assert!(profiler::is_active());
    assert!(profiler::is_active_with_feature(Features::STACK_WALK));
    assert!(!profiler::is_active_with_feature(Features::PRIVACY));

    thread::sleep(Duration::from_millis(100));

    let profile = profiler::profile_json(0.0).expect("profiler is active");
    assert!(profiler::stop());
    assert!(!profiler::is_active());

    let meta = &profile["meta"];
    assert_eq!(meta["version"], 19);
    assert_eq!(meta["interval"], 10.0);
    assert_eq!(meta["stackwalk"], 1);
    assert_eq!(meta["processType"], 0);

    // The main thread registered at init is always in the profile; the
    // calling thread was sampled while it slept.
    assert!(thread_names(&profile).contains(&"GeckoMain".to_string()));
    let own = thread_index_by_tid(&profile, profiler::current_thread_id());
    assert!(!sample_rows(&profile, own).is_empty());
}

#[test]
fn markers_carry_name_and_category() {
    let _guard = setup();
    let _registration = Registration::ensure();
    profiler::start(8192, 10.0, Features::STACK_WALK | Features::THREADS, &[], None);

    profiler::add_marker("M", ProfilingCategory::JavaScript);

    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());

    let own = thread_index_by_tid(&profile, profiler::current_thread_id());
    assert_eq!(marker_names(&profile, own), vec!["M"]);
    let row = marker_rows(&profile, own)[0].as_array().unwrap();
    assert_eq!(row[4], ProfilingCategory::JavaScript as u32 as i64);
}

#[test]
fn markers_are_recorded_while_paused() {
    let _guard = setup();
    let _registration = Registration::ensure();
    profiler::start(8192, 5.0, Features::STACK_WALK | Features::THREADS, &[], None);

    assert!(profiler::pause());
    assert!(profiler::is_paused());
    profiler::add_marker("paused-marker", ProfilingCategory::Other);
    assert!(profiler::resume());
    assert!(!profiler::is_paused());

    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());

    let paused_ranges = profile["pausedRanges"].as_array().unwrap();
    assert_eq!(paused_ranges.len(), 1);
    assert_eq!(paused_ranges[0]["reason"], "profiler-paused");
    assert!(paused_ranges[0]["endTime"].is_number());

    let own = thread_index_by_tid(&profile, profiler::current_thread_id());
    assert!(marker_names(&profile, own).contains(&"paused-marker".to_string()));
}

#[test]
fn thread_filters_exclude_nonmatching_workers() {
    let _guard = setup();
    profiler::start(8192, 10.0, Features::STACK_WALK, &["main"], None);

    let (registered_send, registered_recv) = mpsc::channel();
    let (done_send, done_recv) = mpsc::channel::<()>();
    let worker = thread::spawn(move || {
        let handle = profiler::register_thread("Worker1", std::ptr::null());
        assert!(!handle.is_being_profiled());
        registered_send.send(()).unwrap();
        let _ = done_recv.recv();
        profiler::unregister_thread();
    });
    registered_recv.recv().unwrap();

    let profile = profiler::profile_json(0.0).unwrap();
    let names = thread_names(&profile);
    assert!(names.contains(&"GeckoMain".to_string()));
    assert!(!names.contains(&"Worker1".to_string()));

    done_send.send(()).unwrap();
    worker.join().unwrap();
    assert!(profiler::stop());
}

#[test]
fn matching_workers_are_profiled_and_survive_unregistration() {
    let _guard = setup();
    profiler::start(
        8192,
        5.0,
        Features::STACK_WALK | Features::THREADS,
        &["*"],
        None,
    );

    let (registered_send, registered_recv) = mpsc::channel();
    let (done_send, done_recv) = mpsc::channel::<()>();
    let worker = thread::spawn(move || {
        let handle = profiler::register_thread("RenderWorker", std::ptr::null());
        assert!(handle.is_being_profiled());
        registered_send.send(()).unwrap();
        let _ = done_recv.recv();
        profiler::unregister_thread();
    });
    registered_recv.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    done_send.send(()).unwrap();
    worker.join().unwrap();

    // The worker is gone, but its samples are still in the buffer, so it
    // still appears in the profile with an unregister time.
    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());
    let names = thread_names(&profile);
    assert!(names.contains(&"RenderWorker".to_string()));
    let worker_index = names.iter().position(|n| n == "RenderWorker").unwrap();
    assert!(profile["threads"][worker_index]["unregisterTime"].is_number());
}

#[test]
fn buffer_wraps_without_unbounded_growth() {
    let _guard = setup();
    let _registration = Registration::ensure();
    profiler::start(8192, 50.0, Features::STACK_WALK | Features::THREADS, &[], None);

    let inserted = 5000;
    for _ in 0..inserted {
        profiler::add_marker("wrap", ProfilingCategory::Other);
    }

    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());

    let own = thread_index_by_tid(&profile, profiler::current_thread_id());
    let kept = marker_rows(&profile, own).len();
    assert!(kept > 0);
    // The buffer holds 8192 entries' worth of bytes; most of the markers
    // must have been overwritten.
    assert!(kept < inserted, "kept {kept} of {inserted} markers");
}

#[test]
fn backtrace_captures_label_and_native_frames() {
    let _guard = setup();
    let _registration = Registration::ensure();
    profiler::start(8192, 10.0, Features::STACK_WALK, &[], None);

    let url = String::from("https://example.com/page");
    let _outer = profiler::push_label("test-outer", ProfilingCategory::Layout);
    let _inner = profiler::push_label_dynamic("test-inner", &url, ProfilingCategory::Network);

    let backtrace = profiler::get_backtrace().expect("active and registered");

    assert_eq!(backtrace.thread_id(), profiler::current_thread_id());
    assert!(backtrace.frame_count() >= 1);
    let frames = backtrace.frame_strings();
    assert!(frames.iter().any(|f| f == "test-outer"));
    assert!(frames
        .iter()
        .any(|f| f == "test-inner https://example.com/page"));
    // Label frames keep their push order, outermost first.
    let outer_pos = frames.iter().position(|f| f == "test-outer").unwrap();
    let inner_pos = frames
        .iter()
        .position(|f| f == "test-inner https://example.com/page")
        .unwrap();
    assert!(outer_pos < inner_pos);

    assert!(profiler::stop());
}

#[test]
fn sleeping_threads_reuse_their_last_sample() {
    let _guard = setup();
    let _registration = Registration::ensure();
    profiler::start(8192, 5.0, Features::STACK_WALK | Features::THREADS, &[], None);

    profiler::thread_sleep();
    assert!(profiler::thread_is_sleeping());
    thread::sleep(Duration::from_millis(60));
    profiler::thread_wake();
    assert!(!profiler::thread_is_sleeping());

    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());

    // One unwound sample plus the duplicated ones taken during the sleep.
    let own = thread_index_by_tid(&profile, profiler::current_thread_id());
    assert!(sample_rows(&profile, own).len() >= 2);
}

#[test]
fn counters_are_sampled_every_tick() {
    let _guard = setup();

    struct TestCounter {
        total: AtomicI64,
    }
    impl profiler::CounterSource for TestCounter {
        fn name(&self) -> &str {
            "malloc"
        }
        fn category(&self) -> &str {
            "Memory"
        }
        fn description(&self) -> &str {
            "Amount of allocated memory"
        }
        fn sample(&self) -> (i64, u64) {
            (self.total.fetch_add(16, Ordering::Relaxed), 1)
        }
    }

    let counter: Arc<dyn profiler::CounterSource> = Arc::new(TestCounter {
        total: AtomicI64::new(16),
    });
    profiler::add_sampled_counter(counter.clone());
    profiler::start(8192, 5.0, Features::STACK_WALK, &[], None);
    thread::sleep(Duration::from_millis(60));

    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());
    profiler::remove_sampled_counter(&counter);

    let counters = profile["counters"].as_array().unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0]["name"], "malloc");
    assert_eq!(counters[0]["category"], "Memory");
    let rows = counters[0]["samples"]["data"].as_array().unwrap();
    assert!(!rows.is_empty());
    let first = rows[0].as_array().unwrap();
    assert_eq!(first[2], 1); // number of operations
}

#[test]
fn exit_profiles_are_spliced_into_processes() {
    let _guard = setup();
    profiler::start(8192, 10.0, Features::STACK_WALK, &[], None);

    profiler::received_exit_profile("{\"meta\":{\"version\":19}}".to_string());

    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());

    let processes = profile["processes"].as_array().unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0]["meta"]["version"], 19);
}

#[test]
fn ensure_started_is_idempotent_for_equal_parameters() {
    let _guard = setup();
    profiler::start(8192, 10.0, Features::STACK_WALK, &["*"], None);
    assert!(!profiler::ensure_started(
        8192,
        10.0,
        Features::STACK_WALK,
        &["*"],
        None
    ));
    // A different interval forces a restart.
    assert!(profiler::ensure_started(
        8192,
        20.0,
        Features::STACK_WALK,
        &["*"],
        None
    ));
    let profile = profiler::profile_json(0.0).unwrap();
    assert_eq!(profile["meta"]["interval"], 20.0);
    assert!(profiler::stop());
}

#[test]
fn inactive_profiler_rejects_everything_quietly() {
    let _guard = setup();
    let _registration = Registration::ensure();

    assert!(!profiler::is_active());
    assert!(!profiler::pause());
    assert!(!profiler::resume());
    assert!(!profiler::stop());
    assert!(profiler::get_backtrace().is_none());
    assert!(profiler::profile_json(0.0).is_none());

    // Markers inserted while inactive are dropped, not deferred.
    profiler::add_marker("dropped", ProfilingCategory::Other);
    profiler::start(8192, 10.0, Features::STACK_WALK | Features::THREADS, &[], None);
    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());
    for index in 0..profile["threads"].as_array().unwrap().len() {
        assert!(marker_names(&profile, index).is_empty());
    }
}

#[test]
fn pages_follow_the_thread_lifecycle() {
    let _guard = setup();
    profiler::start(8192, 10.0, Features::STACK_WALK, &[], None);

    profiler::register_page(1, 11, "about:blank", 0);
    profiler::register_page(1, 11, "https://example.com/", 0);
    profiler::register_page(2, 22, "https://example.com/iframe", 11);
    profiler::unregister_page(22);

    let profile = profiler::profile_json(0.0).unwrap();
    assert!(profiler::stop());
    profiler::clear_all_pages();

    let pages = profile["pages"].as_array().unwrap();
    let urls: Vec<&str> = pages
        .iter()
        .map(|page| page["url"].as_str().unwrap())
        .collect();
    // The about:blank document was replaced, and the unregistered iframe is
    // still present because the buffer has not wrapped past it.
    assert_eq!(
        urls,
        vec!["https://example.com/", "https://example.com/iframe"]
    );
    assert_eq!(pages[0]["innerWindowID"], 11);
}

#[test]
fn one_off_sampling_of_a_foreign_thread() {
    let _guard = setup();

    struct VecCollector {
        labels: Vec<String>,
        native_frames: usize,
    }
    impl profiler::StackCollector for VecCollector {
        fn collect_native_leaf_addr(&mut self, _address: u64) {
            self.native_frames += 1;
        }
        fn collect_label_frame(
            &mut self,
            label: &'static str,
            _dynamic: Option<&str>,
            _category: ProfilingCategory,
        ) {
            self.labels.push(label.to_string());
        }
    }

    let (tid_send, tid_recv) = mpsc::channel();
    let (done_send, done_recv) = mpsc::channel::<()>();
    let worker = thread::spawn(move || {
        let handle = profiler::register_thread("SampledWorker", std::ptr::null());
        tid_send.send(handle.thread_id()).unwrap();
        // Spin without allocating until the main thread has sampled us.
        while done_recv.try_recv().is_err() {
            std::hint::spin_loop();
        }
        profiler::unregister_thread();
    });
    let tid = tid_recv.recv().unwrap();

    let mut collector = VecCollector {
        labels: Vec::with_capacity(64),
        native_frames: 0,
    };
    assert!(profiler::suspend_and_sample_thread(
        tid,
        Features::STACK_WALK,
        &mut collector
    ));

    done_send.send(()).unwrap();
    worker.join().unwrap();

    // Whatever the unwinder managed to collect was delivered; at minimum
    // the suspended thread's leaf frame. The spinning worker had no label
    // frames pushed.
    assert!(collector.native_frames >= 1);
    assert!(collector.labels.is_empty());

    // Sampling the calling thread itself is refused.
    let mut self_collector = VecCollector {
        labels: Vec::new(),
        native_frames: 0,
    };
    assert!(!profiler::suspend_and_sample_thread(
        profiler::current_thread_id(),
        Features::STACK_WALK,
        &mut self_collector
    ));
}
