use serde::ser::{Serialize, SerializeMap, Serializer};

/// The fixed set of categories frames and markers can be attributed to.
/// The numeric value of each variant is the category index used in the
/// serialized profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ProfilingCategory {
    Idle = 0,
    Other = 1,
    Layout = 2,
    JavaScript = 3,
    GcCc = 4,
    Network = 5,
    Graphics = 6,
    Dom = 7,
}

impl ProfilingCategory {
    pub const ALL: [ProfilingCategory; 8] = [
        ProfilingCategory::Idle,
        ProfilingCategory::Other,
        ProfilingCategory::Layout,
        ProfilingCategory::JavaScript,
        ProfilingCategory::GcCc,
        ProfilingCategory::Network,
        ProfilingCategory::Graphics,
        ProfilingCategory::Dom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProfilingCategory::Idle => "Idle",
            ProfilingCategory::Other => "Other",
            ProfilingCategory::Layout => "Layout",
            ProfilingCategory::JavaScript => "JavaScript",
            ProfilingCategory::GcCc => "GC / CC",
            ProfilingCategory::Network => "Network",
            ProfilingCategory::Graphics => "Graphics",
            ProfilingCategory::Dom => "DOM",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            ProfilingCategory::Idle => "transparent",
            ProfilingCategory::Other => "grey",
            ProfilingCategory::Layout => "purple",
            ProfilingCategory::JavaScript => "yellow",
            ProfilingCategory::GcCc => "orange",
            ProfilingCategory::Network => "lightblue",
            ProfilingCategory::Graphics => "green",
            ProfilingCategory::Dom => "blue",
        }
    }
}

impl Serialize for ProfilingCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", self.name())?;
        map.serialize_entry("color", self.color())?;
        map.serialize_entry("subcategories", &["Other"])?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn javascript_category_index_and_json() {
        assert_eq!(ProfilingCategory::JavaScript as u32, 3);
        assert_json_eq!(
            serde_json::to_value(ProfilingCategory::JavaScript).unwrap(),
            json!({ "name": "JavaScript", "color": "yellow", "subcategories": ["Other"] })
        );
    }
}
