//! The typed records stored in profile buffers.
//!
//! Every entry is stored as a length-prefixed block: a little-endian `u32`
//! byte length followed by a one-byte tag and a fixed-width payload. Marker
//! blobs are the only variable-length kind. The compact fixed-width layout is
//! what allows appending from inside the sampler's critical section without
//! allocating.

/// Maximum number of payload bytes carried by one `DynamicStringFragment`.
/// Longer dynamic strings are split across consecutive fragments.
pub const DYNAMIC_STRING_FRAGMENT_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum BufferEntry {
    /// Starts a sample. Everything up to the next non-frame entry belongs to
    /// the same sample.
    ThreadId(u32),
    /// Sample timestamp in milliseconds since process start. Always the
    /// second entry of a sample.
    Time(f64),
    /// One native frame's code address.
    NativeLeafAddr(u64),
    /// A label frame's static label. The string data is not copied; label
    /// strings are `'static` by contract, so the pointer stays valid for the
    /// lifetime of the buffer.
    Label(&'static str),
    /// A chunk of a label frame's dynamic string, copied by value. NUL-padded
    /// when shorter than the fragment size.
    DynamicStringFragment([u8; DYNAMIC_STRING_FRAGMENT_BYTES]),
    /// Closes the preceding label frame with its category.
    CategoryPair(u32),
    CounterId(u64),
    CounterKey(u64),
    Count(i64),
    Number(u64),
    Pause(f64),
    Resume(f64),
    CollectionStart(f64),
    CollectionEnd(f64),
    ProfilerOverheadTime(f64),
    ProfilerOverheadDuration(f64),
    /// A serialized marker record, written by marker producers under the
    /// buffer's own mutex.
    MarkerData(Vec<u8>),
}

const TAG_THREAD_ID: u8 = 1;
const TAG_TIME: u8 = 2;
const TAG_NATIVE_LEAF_ADDR: u8 = 3;
const TAG_LABEL: u8 = 4;
const TAG_DYNAMIC_STRING_FRAGMENT: u8 = 5;
const TAG_CATEGORY_PAIR: u8 = 6;
const TAG_COUNTER_ID: u8 = 7;
const TAG_COUNTER_KEY: u8 = 8;
const TAG_COUNT: u8 = 9;
const TAG_NUMBER: u8 = 10;
const TAG_PAUSE: u8 = 11;
const TAG_RESUME: u8 = 12;
const TAG_COLLECTION_START: u8 = 13;
const TAG_COLLECTION_END: u8 = 14;
const TAG_PROFILER_OVERHEAD_TIME: u8 = 15;
const TAG_PROFILER_OVERHEAD_DURATION: u8 = 16;
const TAG_MARKER_DATA: u8 = 17;

/// Fixed-width payloads are at most a pointer plus a length.
pub(crate) const MAX_FIXED_PAYLOAD: usize = 16;

pub(crate) enum EncodedBody<'a> {
    Fixed { len: usize, bytes: [u8; MAX_FIXED_PAYLOAD] },
    Blob(&'a [u8]),
}

impl<'a> EncodedBody<'a> {
    pub fn len(&self) -> usize {
        match self {
            EncodedBody::Fixed { len, .. } => *len,
            EncodedBody::Blob(b) => b.len(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            EncodedBody::Fixed { len, bytes } => &bytes[..*len],
            EncodedBody::Blob(b) => b,
        }
    }
}

fn fixed4(v: [u8; 4]) -> EncodedBody<'static> {
    let mut bytes = [0u8; MAX_FIXED_PAYLOAD];
    bytes[..4].copy_from_slice(&v);
    EncodedBody::Fixed { len: 4, bytes }
}

fn fixed8(v: [u8; 8]) -> EncodedBody<'static> {
    let mut bytes = [0u8; MAX_FIXED_PAYLOAD];
    bytes[..8].copy_from_slice(&v);
    EncodedBody::Fixed { len: 8, bytes }
}

fn fixed16(v: [u8; 16]) -> EncodedBody<'static> {
    EncodedBody::Fixed { len: 16, bytes: v }
}

impl BufferEntry {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            BufferEntry::ThreadId(_) => TAG_THREAD_ID,
            BufferEntry::Time(_) => TAG_TIME,
            BufferEntry::NativeLeafAddr(_) => TAG_NATIVE_LEAF_ADDR,
            BufferEntry::Label(_) => TAG_LABEL,
            BufferEntry::DynamicStringFragment(_) => TAG_DYNAMIC_STRING_FRAGMENT,
            BufferEntry::CategoryPair(_) => TAG_CATEGORY_PAIR,
            BufferEntry::CounterId(_) => TAG_COUNTER_ID,
            BufferEntry::CounterKey(_) => TAG_COUNTER_KEY,
            BufferEntry::Count(_) => TAG_COUNT,
            BufferEntry::Number(_) => TAG_NUMBER,
            BufferEntry::Pause(_) => TAG_PAUSE,
            BufferEntry::Resume(_) => TAG_RESUME,
            BufferEntry::CollectionStart(_) => TAG_COLLECTION_START,
            BufferEntry::CollectionEnd(_) => TAG_COLLECTION_END,
            BufferEntry::ProfilerOverheadTime(_) => TAG_PROFILER_OVERHEAD_TIME,
            BufferEntry::ProfilerOverheadDuration(_) => TAG_PROFILER_OVERHEAD_DURATION,
            BufferEntry::MarkerData(_) => TAG_MARKER_DATA,
        }
    }

    pub(crate) fn body(&self) -> EncodedBody<'_> {
        match self {
            BufferEntry::ThreadId(tid) => fixed4(tid.to_le_bytes()),
            BufferEntry::Time(t)
            | BufferEntry::Pause(t)
            | BufferEntry::Resume(t)
            | BufferEntry::CollectionStart(t)
            | BufferEntry::CollectionEnd(t)
            | BufferEntry::ProfilerOverheadTime(t)
            | BufferEntry::ProfilerOverheadDuration(t) => fixed8(t.to_le_bytes()),
            BufferEntry::NativeLeafAddr(a)
            | BufferEntry::CounterId(a)
            | BufferEntry::CounterKey(a)
            | BufferEntry::Number(a) => fixed8(a.to_le_bytes()),
            BufferEntry::Count(c) => fixed8(c.to_le_bytes()),
            BufferEntry::Label(label) => {
                let mut bytes = [0u8; MAX_FIXED_PAYLOAD];
                bytes[..8].copy_from_slice(&(label.as_ptr() as u64).to_le_bytes());
                bytes[8..16].copy_from_slice(&(label.len() as u64).to_le_bytes());
                EncodedBody::Fixed { len: 16, bytes }
            }
            BufferEntry::DynamicStringFragment(frag) => fixed16(*frag),
            BufferEntry::CategoryPair(c) => fixed4(c.to_le_bytes()),
            BufferEntry::MarkerData(blob) => EncodedBody::Blob(blob),
        }
    }

    /// Decodes one entry from a block payload (tag byte already split off).
    /// Returns `None` for truncated or unknown blocks, which only occur if the
    /// buffer was corrupted.
    pub(crate) fn decode(tag: u8, body: &[u8]) -> Option<BufferEntry> {
        fn u32_at(body: &[u8]) -> Option<u32> {
            Some(u32::from_le_bytes(body.get(..4)?.try_into().ok()?))
        }
        fn u64_at(body: &[u8], offset: usize) -> Option<u64> {
            Some(u64::from_le_bytes(
                body.get(offset..offset + 8)?.try_into().ok()?,
            ))
        }
        fn f64_at(body: &[u8]) -> Option<f64> {
            Some(f64::from_bits(u64_at(body, 0)?))
        }

        Some(match tag {
            TAG_THREAD_ID => BufferEntry::ThreadId(u32_at(body)?),
            TAG_TIME => BufferEntry::Time(f64_at(body)?),
            TAG_NATIVE_LEAF_ADDR => BufferEntry::NativeLeafAddr(u64_at(body, 0)?),
            TAG_LABEL => {
                let ptr = u64_at(body, 0)? as *const u8;
                let len = u64_at(body, 8)? as usize;
                // Safety: Label blocks are only ever encoded from `&'static str`
                // values, so the pointer and length describe live UTF-8 data.
                let label = unsafe {
                    std::str::from_utf8_unchecked(std::slice::from_raw_parts(ptr, len))
                };
                BufferEntry::Label(label)
            }
            TAG_DYNAMIC_STRING_FRAGMENT => {
                let mut frag = [0u8; DYNAMIC_STRING_FRAGMENT_BYTES];
                frag.copy_from_slice(body.get(..DYNAMIC_STRING_FRAGMENT_BYTES)?);
                BufferEntry::DynamicStringFragment(frag)
            }
            TAG_CATEGORY_PAIR => BufferEntry::CategoryPair(u32_at(body)?),
            TAG_COUNTER_ID => BufferEntry::CounterId(u64_at(body, 0)?),
            TAG_COUNTER_KEY => BufferEntry::CounterKey(u64_at(body, 0)?),
            TAG_COUNT => BufferEntry::Count(i64::from_le_bytes(body.get(..8)?.try_into().ok()?)),
            TAG_NUMBER => BufferEntry::Number(u64_at(body, 0)?),
            TAG_PAUSE => BufferEntry::Pause(f64_at(body)?),
            TAG_RESUME => BufferEntry::Resume(f64_at(body)?),
            TAG_COLLECTION_START => BufferEntry::CollectionStart(f64_at(body)?),
            TAG_COLLECTION_END => BufferEntry::CollectionEnd(f64_at(body)?),
            TAG_PROFILER_OVERHEAD_TIME => BufferEntry::ProfilerOverheadTime(f64_at(body)?),
            TAG_PROFILER_OVERHEAD_DURATION => {
                BufferEntry::ProfilerOverheadDuration(f64_at(body)?)
            }
            TAG_MARKER_DATA => BufferEntry::MarkerData(body.to_vec()),
            _ => return None,
        })
    }

    /// Fragments a dynamic string into `DynamicStringFragment` payloads.
    pub(crate) fn dynamic_string_fragments(
        s: &str,
    ) -> impl Iterator<Item = [u8; DYNAMIC_STRING_FRAGMENT_BYTES]> + '_ {
        s.as_bytes()
            .chunks(DYNAMIC_STRING_FRAGMENT_BYTES)
            .map(|chunk| {
                let mut frag = [0u8; DYNAMIC_STRING_FRAGMENT_BYTES];
                frag[..chunk.len()].copy_from_slice(chunk);
                frag
            })
    }

    /// Reassembles the string prefix stored in a fragment (up to the first
    /// NUL pad byte).
    pub(crate) fn fragment_str(frag: &[u8; DYNAMIC_STRING_FRAGMENT_BYTES]) -> &str {
        let len = frag.iter().position(|&b| b == 0).unwrap_or(frag.len());
        std::str::from_utf8(&frag[..len]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(entry: BufferEntry) {
        let tag = entry.tag();
        let body = entry.body();
        let bytes = body.bytes().to_vec();
        assert_eq!(BufferEntry::decode(tag, &bytes), Some(entry));
    }

    #[test]
    fn entries_round_trip() {
        round_trip(BufferEntry::ThreadId(42));
        round_trip(BufferEntry::Time(123.5));
        round_trip(BufferEntry::NativeLeafAddr(0xdead_beef));
        round_trip(BufferEntry::Label("requestAnimationFrame"));
        round_trip(BufferEntry::CategoryPair(3));
        round_trip(BufferEntry::Count(-7));
        round_trip(BufferEntry::MarkerData(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn dynamic_string_fragments_split_and_reassemble() {
        let s = "a-dynamic-string-longer-than-one-fragment";
        let frags: Vec<_> = BufferEntry::dynamic_string_fragments(s).collect();
        assert_eq!(frags.len(), 3);
        let reassembled: String = frags.iter().map(BufferEntry::fragment_str).collect();
        assert_eq!(reassembled, s);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(BufferEntry::decode(200, &[0; 8]), None);
    }
}
