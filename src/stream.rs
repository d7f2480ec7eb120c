//! Serialization of the buffer contents into a gecko-format JSON profile.
//!
//! The buffer is scanned once under the profiler lock. Samples are rebuilt
//! from their entry sequences (`ThreadId`, `Time`, frames) and deduplicated
//! through interned string, frame and stack tables, so repeated stacks cost
//! one table row and samples reference them by index.

use std::collections::{BTreeMap, HashMap};
use std::io;

use log::warn;
use serde_json::{json, Value};

use crate::category::ProfilingCategory;
use crate::entry::BufferEntry;
use crate::features::Features;
use crate::markers::MarkerRecord;
use crate::state::CoreState;

pub(crate) struct StreamOptions<'a> {
    /// Samples and markers older than this are left out.
    pub since_time_ms: f64,
    pub is_shutting_down: bool,
    /// When present, only threads with these ids are streamed.
    pub only_threads: Option<&'a [u32]>,
}

const PROFILE_JSON_VERSION: u32 = 19;

#[derive(Debug, Default)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringTable {
    fn index_for_string(&mut self, s: &str) -> usize {
        if let Some(index) = self.index.get(s) {
            return *index;
        }
        let index = self.strings.len();
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), index);
        index
    }
}

/// Per-thread tables plus the rows that reference them.
struct ThreadProfileBuilder {
    name: String,
    tid: u32,
    register_time_ms: f64,
    unregister_time_ms: Option<f64>,
    string_table: StringTable,
    /// Rows of (location string index, category).
    frames: Vec<(usize, u32)>,
    frame_index: BTreeMap<(usize, u32), usize>,
    /// Rows of (prefix stack index, frame index).
    stacks: Vec<(Option<usize>, usize)>,
    stack_index: BTreeMap<(Option<usize>, usize), usize>,
    /// Rows of (stack index, time).
    samples: Vec<(Option<usize>, f64)>,
    /// Rows of (name string index, start, end, phase, category, data).
    markers: Vec<(usize, f64, f64, u8, u32, Value)>,
}

impl ThreadProfileBuilder {
    fn new(name: &str, tid: u32, register_time_ms: f64, unregister_time_ms: Option<f64>) -> Self {
        ThreadProfileBuilder {
            name: name.to_string(),
            tid,
            register_time_ms,
            unregister_time_ms,
            string_table: StringTable::default(),
            frames: Vec::new(),
            frame_index: BTreeMap::new(),
            stacks: Vec::new(),
            stack_index: BTreeMap::new(),
            samples: Vec::new(),
            markers: Vec::new(),
        }
    }

    fn frame_index_for_location(&mut self, location: &str, category: u32) -> usize {
        let location_index = self.string_table.index_for_string(location);
        match self.frame_index.get(&(location_index, category)) {
            Some(index) => *index,
            None => {
                let index = self.frames.len();
                self.frames.push((location_index, category));
                self.frame_index.insert((location_index, category), index);
                index
            }
        }
    }

    /// Frames come in oldest first, which is exactly the prefix order the
    /// stack table wants.
    fn add_sample(&mut self, time_ms: f64, frames: &[SampleFrame]) {
        let mut prefix = None;
        for frame in frames {
            let (location, category) = match frame {
                SampleFrame::Native(address) => {
                    (format!("0x{address:x}"), ProfilingCategory::Other as u32)
                }
                SampleFrame::Label {
                    label,
                    dynamic,
                    category,
                } => {
                    let location = if dynamic.is_empty() {
                        (*label).to_string()
                    } else {
                        format!("{label} {dynamic}")
                    };
                    (location, *category)
                }
            };
            let frame_index = self.frame_index_for_location(&location, category);
            prefix = Some(match self.stack_index.get(&(prefix, frame_index)) {
                Some(index) => *index,
                None => {
                    let index = self.stacks.len();
                    self.stacks.push((prefix, frame_index));
                    self.stack_index.insert((prefix, frame_index), index);
                    index
                }
            });
        }
        self.samples.push((prefix, time_ms));
    }

    fn add_marker(&mut self, record: &MarkerRecord) {
        let name_index = self.string_table.index_for_string(&record.name);
        self.markers.push((
            name_index,
            record.start,
            record.end,
            record.phase,
            record.category,
            record.data.clone(),
        ));
    }

    fn to_json(&self, process_name: &str, pid: u32) -> Value {
        let frame_rows: Vec<Value> = self
            .frames
            .iter()
            .map(|(location, category)| {
                json!([location, false, 0, null, null, null, null, category, 0])
            })
            .collect();
        let stack_rows: Vec<Value> = self
            .stacks
            .iter()
            .map(|(prefix, frame)| json!([prefix, frame]))
            .collect();
        let sample_rows: Vec<Value> = self
            .samples
            .iter()
            .map(|(stack, time)| json!([stack, time, 0.0]))
            .collect();
        let marker_rows: Vec<Value> = self
            .markers
            .iter()
            .map(|(name, start, end, phase, category, data)| {
                json!([name, start, end, phase, category, data])
            })
            .collect();

        json!({
            "name": self.name,
            "tid": self.tid,
            "pid": pid,
            "processType": "default",
            "processName": process_name,
            "registerTime": self.register_time_ms,
            "unregisterTime": self.unregister_time_ms,
            "frameTable": {
                "schema": {
                    "location": 0,
                    "relevantForJS": 1,
                    "innerWindowID": 2,
                    "implementation": 3,
                    "optimizations": 4,
                    "line": 5,
                    "column": 6,
                    "category": 7,
                    "subcategory": 8,
                },
                "data": frame_rows,
            },
            "stackTable": {
                "schema": { "prefix": 0, "frame": 1 },
                "data": stack_rows,
            },
            "samples": {
                "schema": { "stack": 0, "time": 1, "eventDelay": 2 },
                "data": sample_rows,
            },
            "markers": {
                "schema": {
                    "name": 0,
                    "startTime": 1,
                    "endTime": 2,
                    "phase": 3,
                    "category": 4,
                    "data": 5,
                },
                "data": marker_rows,
            },
            "stringTable": self.string_table.strings,
        })
    }
}

enum SampleFrame {
    Native(u64),
    Label {
        label: &'static str,
        dynamic: String,
        category: u32,
    },
}

fn dispatch_marker(
    blob: &[u8],
    since_time_ms: f64,
    builders: &mut [ThreadProfileBuilder],
    builder_by_tid: &HashMap<u32, usize>,
) {
    match MarkerRecord::from_blob(blob) {
        Some(record) => {
            if record.start.max(record.end) >= since_time_ms {
                if let Some(builder_index) = builder_by_tid.get(&record.tid) {
                    builders[*builder_index].add_marker(&record);
                }
            }
        }
        None => warn!("dropping unparsable marker record"),
    }
}

/// Streams the profile for this process. Returns false when no session is
/// active. Must be called with the profiler lock held.
pub(crate) fn locked_stream_json(
    core: &mut CoreState,
    options: &StreamOptions,
    writer: &mut dyn io::Write,
) -> bool {
    let now_ms = core.process_start.elapsed_ms();
    let buffer = core.core_buffer.clone();

    let Some(active) = core.active.as_mut() else {
        return false;
    };

    active.discard_expired_dead_threads(&buffer);
    active.discard_expired_pages(&buffer);
    let _ = buffer.append(&BufferEntry::CollectionStart(now_ms));

    let entries: Vec<(u64, BufferEntry)> = buffer.collect_entries();

    // One builder per profiled thread, live or recently dead.
    let mut builders: Vec<ThreadProfileBuilder> = Vec::new();
    let mut builder_by_tid: HashMap<u32, usize> = HashMap::new();
    let live_infos = active
        .live
        .iter()
        .map(|l| (l.data.info.clone(), l.data.unregister_time_ms));
    let dead_infos = active
        .dead
        .iter()
        .map(|d| (d.info.clone(), d.unregister_time_ms));
    for (info, unregister_time_ms) in live_infos.chain(dead_infos) {
        if let Some(only) = options.only_threads {
            if !only.contains(&info.thread_id) {
                continue;
            }
        }
        if builder_by_tid.contains_key(&info.thread_id) {
            continue;
        }
        builder_by_tid.insert(info.thread_id, builders.len());
        builders.push(ThreadProfileBuilder::new(
            &info.name,
            info.thread_id,
            info.register_time_ms,
            unregister_time_ms,
        ));
    }

    let mut counter_rows: HashMap<u64, Vec<Value>> = HashMap::new();
    let mut overhead_rows: Vec<Value> = Vec::new();
    let mut paused_ranges: Vec<Value> = Vec::new();
    let mut open_pause: Option<f64> = None;

    let mut index = 0;
    while index < entries.len() {
        match &entries[index].1 {
            BufferEntry::ThreadId(tid) => {
                index += 1;
                // The time entry is always present right after the thread id;
                // anything else means the sample header was cut off by a wrap.
                let time = match entries.get(index) {
                    Some((_, BufferEntry::Time(time))) => *time,
                    _ => continue,
                };
                index += 1;
                let mut frames: Vec<SampleFrame> = Vec::new();
                let mut pending_label: Option<(&'static str, String)> = None;
                while let Some((_, entry)) = entries.get(index) {
                    match entry {
                        BufferEntry::Label(label) => {
                            pending_label = Some((*label, String::new()));
                        }
                        BufferEntry::DynamicStringFragment(fragment) => {
                            if let Some((_, dynamic)) = pending_label.as_mut() {
                                dynamic.push_str(BufferEntry::fragment_str(fragment));
                            }
                        }
                        BufferEntry::CategoryPair(category) => {
                            if let Some((label, dynamic)) = pending_label.take() {
                                frames.push(SampleFrame::Label {
                                    label,
                                    dynamic,
                                    category: *category,
                                });
                            }
                        }
                        BufferEntry::NativeLeafAddr(address) => {
                            frames.push(SampleFrame::Native(*address));
                        }
                        // Markers take only the buffer mutex, not the
                        // profiler lock, so they can interleave with the
                        // entries of an in-progress sample.
                        BufferEntry::MarkerData(blob) => {
                            dispatch_marker(
                                blob,
                                options.since_time_ms,
                                &mut builders,
                                &builder_by_tid,
                            );
                        }
                        _ => break,
                    }
                    index += 1;
                }
                if time < options.since_time_ms {
                    continue;
                }
                if let Some(builder_index) = builder_by_tid.get(tid) {
                    builders[*builder_index].add_sample(time, &frames);
                }
            }
            BufferEntry::CounterId(id) => {
                // Counter groups are Time, CounterKey, Count, optional Number.
                index += 1;
                let mut time = None;
                let mut count = None;
                let mut number = 0u64;
                while let Some((_, entry)) = entries.get(index) {
                    match entry {
                        BufferEntry::Time(t) if time.is_none() => time = Some(*t),
                        BufferEntry::CounterKey(_) => {}
                        BufferEntry::Count(c) if count.is_none() => count = Some(*c),
                        BufferEntry::Number(n) => {
                            number = *n;
                            index += 1;
                            break;
                        }
                        _ => break,
                    }
                    index += 1;
                }
                if let (Some(time), Some(count)) = (time, count) {
                    if time >= options.since_time_ms {
                        counter_rows
                            .entry(*id)
                            .or_default()
                            .push(json!([time, count, number]));
                    }
                }
            }
            BufferEntry::ProfilerOverheadTime(time) => {
                index += 1;
                let mut durations = Vec::with_capacity(4);
                while durations.len() < 4 {
                    match entries.get(index) {
                        Some((_, BufferEntry::ProfilerOverheadDuration(d))) => {
                            durations.push(*d);
                            index += 1;
                        }
                        _ => break,
                    }
                }
                if durations.len() == 4 && *time >= options.since_time_ms {
                    overhead_rows.push(json!([
                        time,
                        durations[0],
                        durations[1],
                        durations[2],
                        durations[3]
                    ]));
                }
            }
            BufferEntry::MarkerData(blob) => {
                index += 1;
                dispatch_marker(
                    blob,
                    options.since_time_ms,
                    &mut builders,
                    &builder_by_tid,
                );
            }
            BufferEntry::Pause(time) => {
                index += 1;
                if open_pause.is_none() {
                    open_pause = Some(*time);
                }
            }
            BufferEntry::Resume(time) => {
                index += 1;
                if let Some(start) = open_pause.take() {
                    paused_ranges.push(json!({
                        "startTime": start,
                        "endTime": time,
                        "reason": "profiler-paused",
                    }));
                }
            }
            _ => index += 1,
        }
    }

    if let Some(start) = open_pause {
        paused_ranges.push(json!({
            "startTime": start,
            "endTime": null,
            "reason": "profiler-paused",
        }));
    }

    // Stable thread order: registration time, then name, then id.
    let mut thread_order: Vec<usize> = (0..builders.len()).collect();
    thread_order.sort_by(|a, b| {
        let a = &builders[*a];
        let b = &builders[*b];
        a.register_time_ms
            .partial_cmp(&b.register_time_ms)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.tid.cmp(&b.tid))
    });

    let pid = crate::platform::current_process_id();
    let threads: Vec<Value> = thread_order
        .iter()
        .map(|i| builders[*i].to_json(&core.process_name, pid))
        .collect();

    let counters: Vec<Value> = core
        .counters
        .iter()
        .map(|counter| {
            let rows = counter_rows
                .remove(&crate::counters::counter_id(counter))
                .unwrap_or_default();
            json!({
                "name": counter.name(),
                "category": counter.category(),
                "description": counter.description(),
                "samples": {
                    "schema": { "time": 0, "count": 1, "number": 2 },
                    "data": rows,
                },
            })
        })
        .collect();

    let mut pages: Vec<Value> = core
        .pages
        .iter()
        .map(|page| serde_json::to_value(page.as_ref()).unwrap_or(Value::Null))
        .collect();
    pages.extend(
        active
            .dead_pages
            .iter()
            .map(|(page, _)| serde_json::to_value(page.as_ref()).unwrap_or(Value::Null)),
    );

    // Exit profiles from other processes are spliced in verbatim.
    let processes: Vec<Value> = active
        .exit_profiles
        .iter()
        .filter_map(|profile| match serde_json::from_str(&profile.json) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("dropping unparsable exit profile");
                None
            }
        })
        .collect();

    let shutdown_time = options.is_shutting_down.then_some(now_ms);
    let meta = json!({
        "version": PROFILE_JSON_VERSION,
        "startTime": core.process_start.system_ms_since_epoch(),
        "shutdownTime": shutdown_time,
        "categories": ProfilingCategory::ALL,
        "interval": active.interval_ms,
        "stackwalk": i32::from(active.features.contains(Features::STACK_WALK)),
        "debug": cfg!(debug_assertions),
        "processType": 0,
        "product": core.process_name,
        "pid": pid,
    });

    let profile = json!({
        "libs": core.shared_libraries,
        "meta": meta,
        "pages": pages,
        "profilerOverhead": {
            "samples": {
                "schema": {
                    "time": 0,
                    "locking": 1,
                    "expiredMarkerCleaning": 2,
                    "counters": 3,
                    "threads": 4,
                },
                "data": overhead_rows,
            },
        },
        "counters": counters,
        "threads": threads,
        "pausedRanges": paused_ranges,
        "processes": processes,
    });

    let _ = buffer.append(&BufferEntry::CollectionEnd(core.process_start.elapsed_ms()));

    serde_json::to_writer(writer, &profile).is_ok()
}
