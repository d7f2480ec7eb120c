//! Shared-library descriptions for the `libs` section of the profile.
//! Enumeration itself is the embedder's job; the profiler only stores the
//! sorted list and serializes it.

use debugid::DebugId;
use serde::ser::{Serialize, SerializeMap, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLibrary {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub name: String,
    pub path: String,
    pub debug_name: String,
    pub debug_path: String,
    pub breakpad_id: DebugId,
    pub arch: String,
}

impl Serialize for SharedLibrary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("start", &self.start)?;
        map.serialize_entry("end", &self.end)?;
        map.serialize_entry("offset", &self.offset)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("path", &self.path)?;
        map.serialize_entry("debugName", &self.debug_name)?;
        map.serialize_entry("debugPath", &self.debug_path)?;
        map.serialize_entry("breakpadId", &self.breakpad_id.breakpad().to_string())?;
        map.serialize_entry("arch", &self.arch)?;
        map.end()
    }
}
