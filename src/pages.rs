//! Registry records for document contexts ("pages"). Pages follow the same
//! live/dead lifecycle as threads: while the profiler is active, an
//! unregistered page is kept until the buffer position recorded at its death
//! falls out of the buffer's range.

use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub browsing_context_id: u64,
    pub inner_window_id: u64,
    pub url: String,
    pub embedder_inner_window_id: u64,
}

impl Serialize for PageInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("browsingContextID", &self.browsing_context_id)?;
        map.serialize_entry("innerWindowID", &self.inner_window_id)?;
        map.serialize_entry("url", &self.url)?;
        map.serialize_entry("embedderInnerWindowID", &self.embedder_inner_window_id)?;
        map.end()
    }
}

/// Applies the registration rule to a live page list: a prior record with
/// the same inner window id is replaced if it was a transient `about:blank`
/// document; any other duplicate makes the new registration a no-op.
pub(crate) fn register_page(pages: &mut Vec<Arc<PageInfo>>, page: PageInfo) {
    if let Some(index) = pages
        .iter()
        .position(|p| p.inner_window_id == page.inner_window_id)
    {
        if pages[index].url == "about:blank" {
            pages.remove(index);
        } else {
            return;
        }
    }
    pages.push(Arc::new(page));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(inner_window_id: u64, url: &str) -> PageInfo {
        PageInfo {
            browsing_context_id: 1,
            inner_window_id,
            url: url.to_string(),
            embedder_inner_window_id: 0,
        }
    }

    #[test]
    fn about_blank_is_replaced_by_the_real_document() {
        let mut pages = Vec::new();
        register_page(&mut pages, page(7, "about:blank"));
        register_page(&mut pages, page(7, "https://example.com/"));
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].url, "https://example.com/");
    }

    #[test]
    fn other_duplicates_are_ignored() {
        let mut pages = Vec::new();
        register_page(&mut pages, page(7, "https://example.com/"));
        register_page(&mut pages, page(7, "https://example.com/other"));
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].url, "https://example.com/");
    }

    #[test]
    fn distinct_inner_windows_coexist() {
        let mut pages = Vec::new();
        register_page(&mut pages, page(7, "https://example.com/"));
        register_page(&mut pages, page(8, "https://example.com/"));
        assert_eq!(pages.len(), 2);
    }
}
