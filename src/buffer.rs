//! Bounded, wrap-around storage for profile entries.
//!
//! Two flavors share the same core: [`ProfileBuffer`] has an internal mutex
//! and is shared between the sampler thread and marker producers;
//! [`LocalProfileBuffer`] has no mutex and is used as sampler-thread-local
//! scratch while a target thread is suspended, where no mutex may be taken.
//!
//! Positions (`range_start`, `range_end`) are monotonically increasing byte
//! indices into an infinite stream; only the last `capacity` bytes of the
//! stream are resident. Appending advances `range_start` just far enough to
//! make room, and every block discarded this way is counted in
//! `cleared_block_count` so producers can detect overflow after the fact.

use std::sync::Mutex;

use thiserror::Error;

use crate::entry::BufferEntry;

/// Byte size of the sampler thread's local scratch buffer. Empirically large
/// enough for one sample with maximally deep stacks.
pub const SCRATCH_BUFFER_BYTES: usize = 65536;

/// Average in-buffer footprint of one entry, used to convert an entry-count
/// capacity into a byte capacity.
pub const BYTES_PER_ENTRY: usize = 16;

/// Lower bound applied to the entry-count capacity requested at start.
pub const MIN_BUFFER_ENTRIES: u32 = 8192;

const BLOCK_HEADER_BYTES: usize = 4;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer currently has no storage and rejects writes. The shared
    /// core buffer is in this state whenever the profiler is not active.
    #[error("profile buffer is closed")]
    Closed,
}

/// Snapshot of a buffer's append state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferState {
    pub range_start: u64,
    pub range_end: u64,
    pub cleared_block_count: u64,
}

#[derive(Debug)]
pub(crate) struct BufferCore {
    /// `None` while closed. The byte length is a power of two.
    storage: Option<Box<[u8]>>,
    range_start: u64,
    range_end: u64,
    cleared_block_count: u64,
}

impl BufferCore {
    fn new_closed() -> Self {
        BufferCore {
            storage: None,
            range_start: 0,
            range_end: 0,
            cleared_block_count: 0,
        }
    }

    fn new_open(capacity_bytes: usize) -> Self {
        let mut core = Self::new_closed();
        core.open(capacity_bytes);
        core
    }

    fn open(&mut self, capacity_bytes: usize) {
        let capacity = capacity_bytes.next_power_of_two().max(256);
        self.storage = Some(vec![0u8; capacity].into_boxed_slice());
        self.range_start = self.range_end;
    }

    fn close(&mut self) {
        self.storage = None;
        self.range_start = self.range_end;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.len())
    }

    pub(crate) fn state(&self) -> BufferState {
        BufferState {
            range_start: self.range_start,
            range_end: self.range_end,
            cleared_block_count: self.cleared_block_count,
        }
    }

    fn write_bytes(&mut self, pos: u64, data: &[u8]) {
        let storage = self.storage.as_mut().unwrap();
        let mask = storage.len() as u64 - 1;
        let offset = (pos & mask) as usize;
        let first = data.len().min(storage.len() - offset);
        storage[offset..offset + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            storage[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    fn read_bytes(&self, pos: u64, out: &mut [u8]) {
        let storage = self.storage.as_ref().unwrap();
        let mask = storage.len() as u64 - 1;
        let offset = (pos & mask) as usize;
        let first = out.len().min(storage.len() - offset);
        out[..first].copy_from_slice(&storage[offset..offset + first]);
        if first < out.len() {
            let rest = out.len() - first;
            out[first..].copy_from_slice(&storage[..rest]);
        }
    }

    fn block_len_at(&self, pos: u64) -> usize {
        let mut header = [0u8; BLOCK_HEADER_BYTES];
        self.read_bytes(pos, &mut header);
        u32::from_le_bytes(header) as usize
    }

    /// Drops the oldest block. Returns the number of bytes released.
    fn drop_oldest_block(&mut self) -> u64 {
        debug_assert!(self.range_start < self.range_end);
        let released = (BLOCK_HEADER_BYTES + self.block_len_at(self.range_start)) as u64;
        self.range_start += released;
        self.cleared_block_count += 1;
        released
    }

    /// Reserves space for a block of `payload_len` bytes and returns the
    /// block's position, or `None` when the block can never fit (it is then
    /// accounted as cleared, and the buffer is left empty).
    fn reserve_block(&mut self, payload_len: usize) -> Option<u64> {
        let capacity = self.capacity() as u64;
        let block_len = (BLOCK_HEADER_BYTES + payload_len) as u64;
        if block_len > capacity {
            while self.range_start < self.range_end {
                self.drop_oldest_block();
            }
            self.cleared_block_count += 1;
            return None;
        }
        while self.range_end + block_len - self.range_start > capacity {
            self.drop_oldest_block();
        }
        let pos = self.range_end;
        self.write_bytes(pos, &(payload_len as u32).to_le_bytes());
        self.range_end += block_len;
        Some(pos)
    }

    /// Appends one entry, returning its block position.
    ///
    /// Does not allocate; safe to call from within the sampler's critical
    /// section on a buffer nobody else can touch.
    pub(crate) fn append(&mut self, entry: &BufferEntry) -> Result<u64, BufferError> {
        if self.storage.is_none() {
            return Err(BufferError::Closed);
        }
        let body = entry.body();
        let payload_len = 1 + body.len();
        let Some(pos) = self.reserve_block(payload_len) else {
            // Too large to ever fit; observable through cleared_block_count.
            return Ok(self.range_end);
        };
        self.write_bytes(pos + BLOCK_HEADER_BYTES as u64, &[entry.tag()]);
        self.write_bytes(pos + BLOCK_HEADER_BYTES as u64 + 1, body.bytes());
        Ok(pos)
    }

    /// Decodes the entry at `pos`. Returns the entry and the position of the
    /// following block.
    pub(crate) fn entry_at(&self, pos: u64) -> Option<(BufferEntry, u64)> {
        if pos < self.range_start || pos >= self.range_end {
            return None;
        }
        let payload_len = self.block_len_at(pos);
        if payload_len == 0 {
            return None;
        }
        let mut payload = vec![0u8; payload_len];
        self.read_bytes(pos + BLOCK_HEADER_BYTES as u64, &mut payload);
        let entry = BufferEntry::decode(payload[0], &payload[1..])?;
        Some((entry, pos + (BLOCK_HEADER_BYTES + payload_len) as u64))
    }

    /// Collects all resident entries with their positions, oldest first.
    pub(crate) fn collect_entries(&self) -> Vec<(u64, BufferEntry)> {
        let mut entries = Vec::new();
        let mut pos = self.range_start;
        while let Some((entry, next)) = self.entry_at(pos) {
            entries.push((pos, entry));
            pos = next;
        }
        entries
    }

    /// Copies every resident block of `other` into this buffer, in order.
    pub(crate) fn append_contents(&mut self, other: &BufferCore) -> Result<(), BufferError> {
        if self.storage.is_none() {
            return Err(BufferError::Closed);
        }
        let mut pos = other.range_start;
        while pos < other.range_end {
            let payload_len = other.block_len_at(pos);
            let mut payload = vec![0u8; payload_len];
            other.read_bytes(pos + BLOCK_HEADER_BYTES as u64, &mut payload);
            if let Some(dest) = self.reserve_block(payload_len) {
                self.write_bytes(dest + BLOCK_HEADER_BYTES as u64, &payload);
            }
            pos += (BLOCK_HEADER_BYTES + payload_len) as u64;
        }
        Ok(())
    }

    /// Advances `range_start` past every entry older than `cutoff_ms`.
    /// The scan stops at the first `Time` entry at or after the cutoff.
    pub(crate) fn discard_before(&mut self, cutoff_ms: f64) {
        while self.range_start < self.range_end {
            if let Some((BufferEntry::Time(t), _)) = self.entry_at(self.range_start) {
                if t >= cutoff_ms {
                    return;
                }
            }
            self.drop_oldest_block();
        }
    }

    /// Re-emits the sample that starts at `last_pos` with a fresh timestamp.
    /// Returns the position of the duplicated sample, or `None` when the
    /// original sample has been overwritten or does not belong to `tid`.
    pub(crate) fn duplicate_last_sample(
        &mut self,
        tid: u32,
        last_pos: u64,
        now_ms: f64,
    ) -> Option<u64> {
        let (first, mut pos) = self.entry_at(last_pos)?;
        if first != BufferEntry::ThreadId(tid) {
            return None;
        }
        let mut copied = Vec::new();
        let mut replaced_time = false;
        while let Some((entry, next)) = self.entry_at(pos) {
            match entry {
                BufferEntry::ThreadId(_)
                | BufferEntry::CounterId(_)
                | BufferEntry::Pause(_)
                | BufferEntry::Resume(_)
                | BufferEntry::CollectionStart(_)
                | BufferEntry::CollectionEnd(_)
                | BufferEntry::ProfilerOverheadTime(_) => break,
                // Markers may interleave with a sample's entries; they are
                // not part of the sample and must not be copied.
                BufferEntry::MarkerData(_) => {}
                BufferEntry::Time(_) if !replaced_time => {
                    replaced_time = true;
                    copied.push(BufferEntry::Time(now_ms));
                }
                entry => copied.push(entry),
            }
            pos = next;
        }
        if !replaced_time {
            return None;
        }
        let new_pos = self.append(&BufferEntry::ThreadId(tid)).ok()?;
        for entry in &copied {
            self.append(entry).ok()?;
        }
        // If the writes above wrapped far enough to overwrite the new sample
        // header, the duplicate is unusable.
        if new_pos < self.range_start {
            return None;
        }
        Some(new_pos)
    }

    pub(crate) fn clear(&mut self) {
        self.range_start = self.range_end;
    }
}

/// The shared, mutex-protected buffer flavor. Owned by the core state so that
/// marker producers can still reach it (and get a clean `Closed` error)
/// right after deactivation.
#[derive(Debug)]
pub struct ProfileBuffer {
    inner: Mutex<BufferCore>,
}

impl ProfileBuffer {
    pub fn new_closed() -> Self {
        ProfileBuffer {
            inner: Mutex::new(BufferCore::new_closed()),
        }
    }

    pub fn open(&self, capacity_bytes: usize) {
        self.inner.lock().unwrap().open(capacity_bytes);
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().close();
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity()
    }

    pub fn state(&self) -> BufferState {
        self.inner.lock().unwrap().state()
    }

    pub fn append(&self, entry: &BufferEntry) -> Result<u64, BufferError> {
        self.inner.lock().unwrap().append(entry)
    }

    /// Appends a sample header as one unit, so no concurrent producer can
    /// slip an entry between the thread id and its time. Returns the
    /// position of the thread id entry.
    pub fn append_thread_id_and_time(&self, tid: u32, time_ms: f64) -> Result<u64, BufferError> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.append(&BufferEntry::ThreadId(tid))?;
        inner.append(&BufferEntry::Time(time_ms))?;
        Ok(pos)
    }

    pub fn append_contents(&self, other: &LocalProfileBuffer) -> Result<(), BufferError> {
        self.inner.lock().unwrap().append_contents(&other.core)
    }

    pub fn discard_before(&self, cutoff_ms: f64) {
        self.inner.lock().unwrap().discard_before(cutoff_ms);
    }

    pub fn duplicate_last_sample(&self, tid: u32, last_pos: u64, now_ms: f64) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .duplicate_last_sample(tid, last_pos, now_ms)
    }

    pub(crate) fn collect_entries(&self) -> Vec<(u64, BufferEntry)> {
        self.inner.lock().unwrap().collect_entries()
    }
}

/// The single-producer flavor without a mutex. Used as the sampler thread's
/// scratch space inside the suspension window, and as backing storage for
/// detached backtraces.
#[derive(Debug)]
pub struct LocalProfileBuffer {
    core: BufferCore,
}

impl LocalProfileBuffer {
    pub fn new(capacity_bytes: usize) -> Self {
        LocalProfileBuffer {
            core: BufferCore::new_open(capacity_bytes),
        }
    }

    pub fn state(&self) -> BufferState {
        self.core.state()
    }

    pub fn append(&mut self, entry: &BufferEntry) -> Result<u64, BufferError> {
        self.core.append(entry)
    }

    pub fn clear(&mut self) {
        self.core.clear();
    }

    pub(crate) fn collect_entries(&self) -> Vec<(u64, BufferEntry)> {
        self.core.collect_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_buffer(capacity: usize) -> BufferCore {
        BufferCore::new_open(capacity)
    }

    #[test]
    fn closed_buffer_rejects_appends() {
        let mut core = BufferCore::new_closed();
        assert_eq!(
            core.append(&BufferEntry::ThreadId(1)),
            Err(BufferError::Closed)
        );
        assert_eq!(core.state().range_end, 0);
    }

    #[test]
    fn range_is_bounded_and_monotonic() {
        let mut core = open_buffer(256);
        let mut last_state = core.state();
        for i in 0..1000 {
            core.append(&BufferEntry::Number(i)).unwrap();
            let state = core.state();
            assert!(state.range_end - state.range_start <= 256);
            assert!(state.range_end >= last_state.range_end);
            assert!(state.range_start >= last_state.range_start);
            last_state = state;
        }
        assert!(last_state.cleared_block_count > 0);
        assert!(last_state.range_start > 0);
    }

    #[test]
    fn wrapped_buffer_keeps_newest_entries() {
        let mut core = open_buffer(256);
        for i in 0..100u64 {
            core.append(&BufferEntry::Number(i)).unwrap();
        }
        let entries = core.collect_entries();
        let values: Vec<u64> = entries
            .iter()
            .map(|(_, e)| match e {
                BufferEntry::Number(n) => *n,
                other => panic!("unexpected entry {other:?}"),
            })
            .collect();
        // Oldest-first, contiguous, ending at the last appended value.
        assert_eq!(*values.last().unwrap(), 99);
        for pair in values.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn oversized_block_is_discarded_and_counted() {
        let mut core = open_buffer(256);
        core.append(&BufferEntry::Number(1)).unwrap();
        let before = core.state();
        core.append(&BufferEntry::MarkerData(vec![0u8; 1024])).unwrap();
        let after = core.state();
        assert!(after.cleared_block_count > before.cleared_block_count);
        assert_eq!(after.range_start, after.range_end);
    }

    #[test]
    fn append_contents_preserves_order() {
        let mut scratch = LocalProfileBuffer::new(1024);
        scratch.append(&BufferEntry::ThreadId(7)).unwrap();
        scratch.append(&BufferEntry::Time(1.0)).unwrap();
        scratch.append(&BufferEntry::NativeLeafAddr(0x1000)).unwrap();

        let dest = ProfileBuffer::new_closed();
        dest.open(1024);
        dest.append_contents(&scratch).unwrap();
        let entries: Vec<BufferEntry> =
            dest.collect_entries().into_iter().map(|(_, e)| e).collect();
        assert_eq!(
            entries,
            vec![
                BufferEntry::ThreadId(7),
                BufferEntry::Time(1.0),
                BufferEntry::NativeLeafAddr(0x1000),
            ]
        );
    }

    #[test]
    fn discard_before_drops_old_samples() {
        let mut core = open_buffer(4096);
        for i in 0..10 {
            core.append(&BufferEntry::ThreadId(1)).unwrap();
            core.append(&BufferEntry::Time(i as f64)).unwrap();
        }
        core.discard_before(5.0);
        let times: Vec<f64> = core
            .collect_entries()
            .into_iter()
            .filter_map(|(_, e)| match e {
                BufferEntry::Time(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn duplicate_last_sample_copies_payload_with_new_time() {
        let mut core = open_buffer(4096);
        let pos = core.append(&BufferEntry::ThreadId(3)).unwrap();
        core.append(&BufferEntry::Time(10.0)).unwrap();
        core.append(&BufferEntry::Label("work")).unwrap();
        core.append(&BufferEntry::CategoryPair(1)).unwrap();
        core.append(&BufferEntry::NativeLeafAddr(0x40)).unwrap();

        let new_pos = core.duplicate_last_sample(3, pos, 20.0).unwrap();
        assert!(new_pos > pos);
        let entries: Vec<BufferEntry> =
            core.collect_entries().into_iter().map(|(_, e)| e).collect();
        assert_eq!(
            &entries[5..],
            &[
                BufferEntry::ThreadId(3),
                BufferEntry::Time(20.0),
                BufferEntry::Label("work"),
                BufferEntry::CategoryPair(1),
                BufferEntry::NativeLeafAddr(0x40),
            ]
        );
    }

    #[test]
    fn duplicate_fails_for_overwritten_or_foreign_position() {
        let mut core = open_buffer(256);
        let pos = core.append(&BufferEntry::ThreadId(3)).unwrap();
        core.append(&BufferEntry::Time(1.0)).unwrap();
        assert!(core.duplicate_last_sample(4, pos, 2.0).is_none());
        for i in 0..100u64 {
            core.append(&BufferEntry::Number(i)).unwrap();
        }
        assert!(core.duplicate_last_sample(3, pos, 2.0).is_none());
    }
}
