//! Environment-driven startup configuration.
//!
//! All recognized variables are read once, at `init`. A malformed value is
//! an operator error: the help text is printed and the process exits with
//! code 1. `BASE_PROFILER_HELP` prints the same text and exits 0.

use std::env;
use std::path::PathBuf;
use std::process;

use crate::features::Features;
use crate::state::{DEFAULT_INTERVAL_MS, DEFAULT_STARTUP_ENTRIES};

#[derive(Debug, Clone)]
pub(crate) struct StartupConfig {
    /// Start profiling immediately at init.
    pub start: bool,
    pub capacity_entries: u32,
    pub interval_ms: f64,
    pub duration_s: Option<f64>,
    pub features: Features,
    pub filters: Vec<String>,
    /// File to stream the profile to at shutdown.
    pub shutdown_path: Option<PathBuf>,
}

fn print_usage() {
    println!(
        "\n\
Profiler environment variables:\n\
\n\
  BASE_PROFILER_HELP\n\
  If set to any value, prints this message and exits.\n\
\n\
  BASE_PROFILER_LOGGING\n\
  BASE_PROFILER_DEBUG_LOGGING\n\
  BASE_PROFILER_VERBOSE_LOGGING\n\
  If set to any value, enables logging at increasing verbosity.\n\
\n\
  BASE_PROFILER_STARTUP\n\
  If set to any value other than '' or '0'/'N'/'n', starts the profiler\n\
  immediately on start-up. Useful to profile code that runs before the\n\
  regular profiling interface is reachable.\n\
\n\
  BASE_PROFILER_STARTUP_ENTRIES=<1..>\n\
  If the profiler is started on start-up, this specifies the number of\n\
  entries in the profiler's circular buffer.\n\
\n\
  BASE_PROFILER_STARTUP_INTERVAL=<1..1000>\n\
  If the profiler is started on start-up, this specifies the sample\n\
  interval, measured in milliseconds.\n\
\n\
  BASE_PROFILER_STARTUP_DURATION=<1..>\n\
  If the profiler is started on start-up, this limits the buffer to the\n\
  most recent number of seconds.\n\
\n\
  BASE_PROFILER_STARTUP_FEATURES_BITFIELD=<decimal number>\n\
  If the profiler is started on start-up, this specifies the profiling\n\
  features, as the integral value of a features bitfield.\n\
  If unset, the BASE_PROFILER_STARTUP_FEATURES variable is used instead.\n\
\n\
  BASE_PROFILER_STARTUP_FEATURES=<features>\n\
  If the profiler is started on start-up, this specifies the profiling\n\
  features, as a comma-separated list of strings.\n\
  Available features: {}\n\
\n\
  BASE_PROFILER_STARTUP_FILTERS=<filters>\n\
  If the profiler is started on start-up, this specifies the thread\n\
  filters, as a comma-separated list of strings.\n\
\n\
  BASE_PROFILER_SHUTDOWN=<path>\n\
  If set, the profile is streamed to this file at shutdown.\n",
        Features::NAMES
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn usage_exit(message: &str) -> ! {
    eprintln!("{message}");
    print_usage();
    process::exit(1)
}

fn nonempty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn configure_logging() {
    let level = if env::var_os("BASE_PROFILER_VERBOSE_LOGGING").is_some() {
        log::LevelFilter::Trace
    } else if env::var_os("BASE_PROFILER_DEBUG_LOGGING").is_some() {
        log::LevelFilter::Debug
    } else if env::var_os("BASE_PROFILER_LOGGING").is_some() {
        log::LevelFilter::Info
    } else {
        return;
    };
    log::set_max_level(level);
}

/// Reads every recognized variable. Exits on help or malformed input.
pub(crate) fn read_startup_config() -> StartupConfig {
    if env::var_os("BASE_PROFILER_HELP").is_some() {
        print_usage();
        process::exit(0);
    }

    configure_logging();

    let start = match nonempty_var("BASE_PROFILER_STARTUP") {
        None => false,
        Some(value) => !matches!(value.as_str(), "0" | "N" | "n"),
    };

    let mut capacity_entries = DEFAULT_STARTUP_ENTRIES;
    if let Some(value) = nonempty_var("BASE_PROFILER_STARTUP_ENTRIES") {
        match value.parse::<i64>() {
            Ok(entries) if entries > 0 && entries <= i32::MAX as i64 => {
                capacity_entries = entries as u32;
            }
            _ => usage_exit(&format!(
                "- Invalid BASE_PROFILER_STARTUP_ENTRIES = \"{value}\""
            )),
        }
    }

    let mut interval_ms = DEFAULT_INTERVAL_MS;
    if let Some(value) = nonempty_var("BASE_PROFILER_STARTUP_INTERVAL") {
        match value.parse::<f64>() {
            Ok(interval) if interval > 0.0 && interval <= 1000.0 => interval_ms = interval,
            _ => usage_exit(&format!(
                "- Invalid BASE_PROFILER_STARTUP_INTERVAL = \"{value}\""
            )),
        }
    }

    let mut duration_s = None;
    if let Some(value) = nonempty_var("BASE_PROFILER_STARTUP_DURATION") {
        match value.parse::<f64>() {
            Ok(duration) if duration > 0.0 => duration_s = Some(duration),
            _ => usage_exit(&format!(
                "- Invalid BASE_PROFILER_STARTUP_DURATION = \"{value}\""
            )),
        }
    }

    let mut features = Features::default_features() | Features::startup_extra_default_features();
    if let Some(value) = nonempty_var("BASE_PROFILER_STARTUP_FEATURES_BITFIELD") {
        match value.parse::<u32>() {
            Ok(bits) => features = Features::from_bits_truncate(bits),
            Err(_) => usage_exit(&format!(
                "- Invalid BASE_PROFILER_STARTUP_FEATURES_BITFIELD = \"{value}\""
            )),
        }
    } else if let Some(value) = nonempty_var("BASE_PROFILER_STARTUP_FEATURES") {
        features = Features::empty();
        for name in value.split(',').filter(|name| !name.is_empty()) {
            match Features::from_feature_name(name) {
                Some(feature) => features |= feature,
                None => usage_exit(&format!("- Unknown feature \"{name}\"")),
            }
        }
    }

    let filters = nonempty_var("BASE_PROFILER_STARTUP_FILTERS")
        .map(|value| {
            value
                .split(',')
                .filter(|filter| !filter.is_empty())
                .map(|filter| filter.to_string())
                .collect()
        })
        .unwrap_or_default();

    let shutdown_path = nonempty_var("BASE_PROFILER_SHUTDOWN").map(PathBuf::from);

    StartupConfig {
        start,
        capacity_entries,
        interval_ms,
        duration_s,
        features,
        filters,
        shutdown_path,
    }
}
