//! Marker payloads and their in-buffer representation.
//!
//! A marker is recorded as one `MarkerData` block containing a serialized
//! [`MarkerRecord`]. Serialization happens on the inserting thread, which may
//! allocate freely; only the final append takes the shared buffer's mutex.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::category::ProfilingCategory;

/// How a marker relates to time, in milliseconds since process start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkerTiming {
    Instant(f64),
    Interval(f64, f64),
    IntervalStart(f64),
    IntervalEnd(f64),
}

/// Phase values used by the serialized marker table.
const PHASE_INSTANT: u8 = 0;
const PHASE_INTERVAL: u8 = 1;
const PHASE_INTERVAL_START: u8 = 2;
const PHASE_INTERVAL_END: u8 = 3;

impl MarkerTiming {
    fn phase_start_end(self) -> (u8, f64, f64) {
        match self {
            MarkerTiming::Instant(at) => (PHASE_INSTANT, at, 0.0),
            MarkerTiming::Interval(start, end) => (PHASE_INTERVAL, start, end),
            MarkerTiming::IntervalStart(start) => (PHASE_INTERVAL_START, start, 0.0),
            MarkerTiming::IntervalEnd(end) => (PHASE_INTERVAL_END, 0.0, end),
        }
    }
}

/// A typed marker payload. The type name keys the marker's schema in the
/// front end; the data is free-form JSON.
pub trait ProfilerMarker {
    const MARKER_TYPE_NAME: &'static str;
    fn json_marker_data(&self) -> serde_json::Value;
}

/// The unit stored in `MarkerData` buffer blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MarkerRecord {
    pub tid: u32,
    pub name: String,
    pub category: u32,
    pub phase: u8,
    pub start: f64,
    pub end: f64,
    pub data: serde_json::Value,
}

impl MarkerRecord {
    pub fn new(
        tid: u32,
        name: &str,
        category: ProfilingCategory,
        timing: MarkerTiming,
        data: serde_json::Value,
    ) -> Self {
        let (phase, start, end) = timing.phase_start_end();
        MarkerRecord {
            tid,
            name: name.to_string(),
            category: category as u32,
            phase,
            start,
            end,
            data,
        }
    }

    pub fn to_blob(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("marker records always serialize")
    }

    pub fn from_blob(blob: &[u8]) -> Option<MarkerRecord> {
        serde_json::from_slice(blob).ok()
    }
}

/// A plain text marker.
pub struct TextMarker<'a> {
    pub text: &'a str,
    /// Document the marker belongs to, if any.
    pub inner_window_id: Option<u64>,
    /// Stack frames of the capture site, outermost first.
    pub cause: Option<Vec<String>>,
}

impl<'a> ProfilerMarker for TextMarker<'a> {
    const MARKER_TYPE_NAME: &'static str = "Text";

    fn json_marker_data(&self) -> serde_json::Value {
        let mut data = json!({
            "type": Self::MARKER_TYPE_NAME,
            "name": self.text,
        });
        if let Some(id) = self.inner_window_id {
            data["innerWindowID"] = json!(id);
        }
        if let Some(cause) = &self.cause {
            data["cause"] = json!({ "stack": cause });
        }
        data
    }
}

/// The kind argument of `tracing_marker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingKind {
    Instant,
    IntervalStart,
    IntervalEnd,
}

impl TracingKind {
    pub(crate) fn timing(self, now_ms: f64) -> MarkerTiming {
        match self {
            TracingKind::Instant => MarkerTiming::Instant(now_ms),
            TracingKind::IntervalStart => MarkerTiming::IntervalStart(now_ms),
            TracingKind::IntervalEnd => MarkerTiming::IntervalEnd(now_ms),
        }
    }
}

/// An interval marker tying a span to a tracing category string.
pub struct TracingMarker<'a> {
    pub category: &'a str,
    pub inner_window_id: Option<u64>,
    pub cause: Option<Vec<String>>,
}

impl<'a> ProfilerMarker for TracingMarker<'a> {
    const MARKER_TYPE_NAME: &'static str = "tracing";

    fn json_marker_data(&self) -> serde_json::Value {
        let mut data = json!({
            "type": Self::MARKER_TYPE_NAME,
            "category": self.category,
        });
        if let Some(id) = self.inner_window_id {
            data["innerWindowID"] = json!(id);
        }
        if let Some(cause) = &self.cause {
            data["cause"] = json!({ "stack": cause });
        }
        data
    }
}

/// A marker with no payload beyond its name and category.
pub(crate) struct NoPayloadMarker;

impl ProfilerMarker for NoPayloadMarker {
    const MARKER_TYPE_NAME: &'static str = "NoPayload";

    fn json_marker_data(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;

    #[test]
    fn marker_record_round_trips_through_blob() {
        let record = MarkerRecord::new(
            7,
            "DOMEvent",
            ProfilingCategory::Dom,
            MarkerTiming::Interval(1.0, 2.5),
            json!({ "type": "Text", "name": "click" }),
        );
        let blob = record.to_blob();
        let parsed = MarkerRecord::from_blob(&blob).unwrap();
        assert_eq!(parsed.tid, 7);
        assert_eq!(parsed.name, "DOMEvent");
        assert_eq!(parsed.category, ProfilingCategory::Dom as u32);
        assert_eq!(parsed.phase, 1);
        assert_eq!(parsed.start, 1.0);
        assert_eq!(parsed.end, 2.5);
        assert_json_eq!(parsed.data, json!({ "type": "Text", "name": "click" }));
    }

    #[test]
    fn text_marker_payload_shape() {
        let marker = TextMarker {
            text: "hello",
            inner_window_id: Some(12),
            cause: None,
        };
        assert_json_eq!(
            marker.json_marker_data(),
            json!({ "type": "Text", "name": "hello", "innerWindowID": 12 })
        );
    }
}
