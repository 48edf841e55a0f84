//! Per-segment aggregate indices.
//!
//! The index manager owns every aggregate-to-position mapping in the store:
//! the in-memory position buffer of the active segment, and one `.index` file
//! (plus `.bloom` sidecar) per completed segment. Aggregate reads resolve
//! through here so replay cost is proportional to the hits, not to the log.
//!
//! Completed indices are immutable; they are loaded lazily, cached in a
//! bounded LRU, and shared as `Arc` snapshots so concurrent lookups never
//! block each other.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;

use crate::bloom::BloomFilter;
use crate::error::Error;
use crate::segment::{bloom_file, index_file};
use crate::types::{IndexEntry, SegmentIndexEntries};

/// Magic bytes identifying an index file (ASCII "ECIX").
const MAGIC: [u8; 4] = [0x45, 0x43, 0x49, 0x58];

/// Current index file format version.
const FORMAT_VERSION: u8 = 1;

/// Number of loaded segment indices kept in memory.
const INDEX_CACHE_CAPACITY: usize = 64;

/// Number of bloom filters kept in memory.
///
/// Blooms are small and consulted on every aggregate lookup, so the cache is
/// wider than the index cache.
const BLOOM_CACHE_CAPACITY: usize = 1024;

/// Segment walk cap applied by `SearchHint::RecentOnly` lookups.
pub const RECENT_SEGMENTS: usize = 10;

/// Immutable, fully parsed index of one completed segment.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadedIndex {
    entries: HashMap<String, Vec<IndexEntry>>,
}

impl LoadedIndex {
    /// Entries of one aggregate, ordered by sequence number.
    pub fn entries_for(&self, aggregate: &str) -> Option<&[IndexEntry]> {
        self.entries.get(aggregate).map(Vec::as_slice)
    }

    /// Iterate all `(aggregate, entries)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<IndexEntry>)> {
        self.entries.iter()
    }
}

/// In-memory position buffer of the active segment.
#[derive(Debug, Default)]
struct ActiveIndex {
    segment: u64,
    entries: HashMap<String, Vec<IndexEntry>>,
}

/// Manages aggregate indices across the active segment and every completed
/// segment of a context.
///
/// Lookup paths consult the active buffer first, then completed segments
/// newest-first, skipping any segment whose Bloom filter excludes the
/// aggregate.
pub struct IndexManager {
    /// Directories probed for index files, hottest tier first. New index
    /// files are always written to the first directory.
    dirs: Vec<PathBuf>,
    bloom_fpp: f64,
    active: RwLock<ActiveIndex>,
    completed: RwLock<BTreeSet<u64>>,
    loaded: Mutex<LruCache<u64, Arc<LoadedIndex>>>,
    blooms: Mutex<LruCache<u64, Arc<BloomFilter>>>,
}

impl IndexManager {
    /// Create an index manager probing the given directories (hottest first).
    pub fn new(dirs: Vec<PathBuf>, bloom_fpp: f64) -> IndexManager {
        IndexManager {
            dirs,
            bloom_fpp,
            active: RwLock::new(ActiveIndex::default()),
            completed: RwLock::new(BTreeSet::new()),
            loaded: Mutex::new(LruCache::new(
                NonZeroUsize::new(INDEX_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
            blooms: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOOM_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
        }
    }

    /// Reset the active position buffer for a new active segment.
    pub fn activate_segment(&self, segment: u64) {
        let mut active = self.active.write().expect("active index lock poisoned");
        active.segment = segment;
        active.entries.clear();
    }

    /// Record index entries for events just written to the active segment.
    ///
    /// Entries become visible to lookups immediately; the caller must only
    /// invoke this after the enclosing transaction is durable.
    pub fn add_to_active_segment(
        &self,
        segment: u64,
        entries: HashMap<String, Vec<IndexEntry>>,
    ) {
        let mut active = self.active.write().expect("active index lock poisoned");
        if active.segment != segment {
            active.segment = segment;
            active.entries.clear();
        }
        for (aggregate, mut new_entries) in entries {
            active
                .entries
                .entry(aggregate)
                .or_default()
                .append(&mut new_entries);
        }
    }

    /// Persist the active buffer as the immutable index of `segment`.
    ///
    /// Writes `.index` and `.bloom` through temporary files and atomic
    /// renames, registers the segment as completed, and clears the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a file cannot be written or renamed.
    pub fn complete(&self, segment: u64) -> Result<(), Error> {
        let entries = {
            let mut active = self.active.write().expect("active index lock poisoned");
            if active.segment != segment {
                return Err(Error::InvalidArgument(format!(
                    "complete({segment}) called while segment {} is active",
                    active.segment
                )));
            }
            std::mem::take(&mut active.entries)
        };

        let mut bloom = BloomFilter::with_capacity(entries.len(), self.bloom_fpp);
        for aggregate in entries.keys() {
            bloom.insert(aggregate);
        }

        let dir = &self.dirs[0];
        write_atomically(&index_file(dir, segment), &encode_index(&entries))?;
        write_atomically(&bloom_file(dir, segment), &bloom.to_bytes())?;

        self.completed
            .write()
            .expect("completed set lock poisoned")
            .insert(segment);
        self.loaded
            .lock()
            .expect("index cache lock poisoned")
            .put(segment, Arc::new(LoadedIndex { entries }));
        self.blooms
            .lock()
            .expect("bloom cache lock poisoned")
            .put(segment, Arc::new(bloom));
        Ok(())
    }

    /// Register an already-persisted index discovered at startup.
    pub fn register_completed(&self, segment: u64) {
        self.completed
            .write()
            .expect("completed set lock poisoned")
            .insert(segment);
    }

    /// Verify that the on-disk index of `segment` is usable.
    ///
    /// A valid index parses, passes its whole-file checksum, has a parseable
    /// Bloom sidecar, and every indexed aggregate passes that filter.
    pub fn valid_index(&self, segment: u64) -> bool {
        let Some(index_path) = self.find_file(segment, index_file) else {
            return false;
        };
        let Some(bloom_path) = self.find_file(segment, bloom_file) else {
            return false;
        };
        let Ok(index_bytes) = fs::read(&index_path) else {
            return false;
        };
        let Ok(bloom_bytes) = fs::read(&bloom_path) else {
            return false;
        };
        let Ok(index) = decode_index(segment, &index_bytes) else {
            return false;
        };
        let Ok(bloom) = BloomFilter::from_bytes(segment, &bloom_bytes) else {
            return false;
        };
        index.entries.keys().all(|aggregate| bloom.contains(aggregate))
    }

    /// Look up index entries for an aggregate across all segments.
    ///
    /// Walks the active buffer, then completed segments newest-first. An
    /// entry survives only if its token is at least `min_token` and its
    /// sequence number lies in `[first_sequence, last_sequence)`. Once
    /// `max_results` entries are gathered, older segments are skipped.
    ///
    /// The returned map is keyed by segment id (ascending iteration; callers
    /// replaying forward iterate it directly, newest-first callers reverse).
    pub fn lookup_aggregate(
        &self,
        aggregate: &str,
        first_sequence: u64,
        last_sequence: u64,
        max_results: usize,
        min_token: u64,
    ) -> BTreeMap<u64, Vec<IndexEntry>> {
        let mut found: BTreeMap<u64, Vec<IndexEntry>> = BTreeMap::new();
        let mut gathered = 0usize;

        let in_range = |entry: &IndexEntry| {
            entry.token >= min_token
                && entry.aggregate_sequence_number >= first_sequence
                && entry.aggregate_sequence_number < last_sequence
        };

        {
            let active = self.active.read().expect("active index lock poisoned");
            if let Some(entries) = active.entries.get(aggregate) {
                let hits: Vec<IndexEntry> =
                    entries.iter().copied().filter(in_range).collect();
                if !hits.is_empty() {
                    gathered += hits.len();
                    found.insert(active.segment, hits);
                }
            }
        }

        for segment in self.completed_descending() {
            if gathered >= max_results {
                break;
            }
            if !self.bloom_may_contain(segment, aggregate) {
                continue;
            }
            let Ok(index) = self.load_index(segment) else {
                continue;
            };
            if let Some(entries) = index.entries_for(aggregate) {
                let hits: Vec<IndexEntry> =
                    entries.iter().copied().filter(in_range).collect();
                if !hits.is_empty() {
                    gathered += hits.len();
                    found.insert(segment, hits);
                }
            }
        }
        found
    }

    /// Find the newest segment containing the aggregate at or below
    /// `max_sequence`, with the matching entries.
    pub fn last_index_entries(
        &self,
        aggregate: &str,
        max_sequence: u64,
    ) -> Option<SegmentIndexEntries> {
        {
            let active = self.active.read().expect("active index lock poisoned");
            if let Some(entries) = active.entries.get(aggregate) {
                let hits: Vec<IndexEntry> = entries
                    .iter()
                    .copied()
                    .filter(|e| e.aggregate_sequence_number <= max_sequence)
                    .collect();
                if !hits.is_empty() {
                    return Some(SegmentIndexEntries {
                        segment: active.segment,
                        entries: hits,
                    });
                }
            }
        }
        for segment in self.completed_descending() {
            if !self.bloom_may_contain(segment, aggregate) {
                continue;
            }
            let Ok(index) = self.load_index(segment) else {
                continue;
            };
            if let Some(entries) = index.entries_for(aggregate) {
                let hits: Vec<IndexEntry> = entries
                    .iter()
                    .copied()
                    .filter(|e| e.aggregate_sequence_number <= max_sequence)
                    .collect();
                if !hits.is_empty() {
                    return Some(SegmentIndexEntries {
                        segment,
                        entries: hits,
                    });
                }
            }
        }
        None
    }

    /// Highest sequence number recorded for an aggregate, if any.
    ///
    /// Walks segments newest-first, short-circuiting on the first hit.
    /// `max_segments_hint` caps the walk (pass [`RECENT_SEGMENTS`] for hot
    /// aggregates); `max_token_hint` ignores entries above the given token.
    pub fn get_last_sequence_number(
        &self,
        aggregate: &str,
        max_segments_hint: usize,
        max_token_hint: u64,
    ) -> Option<u64> {
        let mut walked = 0usize;
        {
            let active = self.active.read().expect("active index lock poisoned");
            walked += 1;
            if let Some(entries) = active.entries.get(aggregate) {
                if let Some(seq) = entries
                    .iter()
                    .filter(|e| e.token <= max_token_hint)
                    .map(|e| e.aggregate_sequence_number)
                    .max()
                {
                    return Some(seq);
                }
            }
        }
        for segment in self.completed_descending() {
            if walked >= max_segments_hint {
                return None;
            }
            walked += 1;
            if !self.bloom_may_contain(segment, aggregate) {
                continue;
            }
            let Ok(index) = self.load_index(segment) else {
                continue;
            };
            if let Some(entries) = index.entries_for(aggregate) {
                if let Some(seq) = entries
                    .iter()
                    .filter(|e| e.token <= max_token_hint)
                    .map(|e| e.aggregate_sequence_number)
                    .max()
                {
                    return Some(seq);
                }
            }
        }
        None
    }

    /// Load the full index of a completed segment (cached).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataFileRead`] if no directory holds the file or the
    /// file fails to parse.
    pub fn load_index(&self, segment: u64) -> Result<Arc<LoadedIndex>, Error> {
        if let Some(index) = self
            .loaded
            .lock()
            .expect("index cache lock poisoned")
            .get(&segment)
        {
            return Ok(Arc::clone(index));
        }
        let path = self
            .find_file(segment, index_file)
            .ok_or_else(|| Error::data_file(segment, "index file missing"))?;
        let bytes = fs::read(&path)
            .map_err(|e| Error::data_file(segment, format!("cannot read index file: {e}")))?;
        let index = Arc::new(decode_index(segment, &bytes)?);
        self.loaded
            .lock()
            .expect("index cache lock poisoned")
            .put(segment, Arc::clone(&index));
        Ok(index)
    }

    fn bloom_may_contain(&self, segment: u64, aggregate: &str) -> bool {
        if let Some(bloom) = self
            .blooms
            .lock()
            .expect("bloom cache lock poisoned")
            .get(&segment)
        {
            return bloom.contains(aggregate);
        }
        let Some(path) = self.find_file(segment, bloom_file) else {
            // No filter on disk: cannot exclude the segment.
            return true;
        };
        let Ok(bytes) = fs::read(&path) else {
            return true;
        };
        let Ok(bloom) = BloomFilter::from_bytes(segment, &bytes) else {
            return true;
        };
        let result = bloom.contains(aggregate);
        self.blooms
            .lock()
            .expect("bloom cache lock poisoned")
            .put(segment, Arc::new(bloom));
        result
    }

    fn completed_descending(&self) -> Vec<u64> {
        self.completed
            .read()
            .expect("completed set lock poisoned")
            .iter()
            .rev()
            .copied()
            .collect()
    }

    fn find_file(&self, segment: u64, name: fn(&Path, u64) -> PathBuf) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| name(dir, segment))
            .find(|path| path.exists())
    }
}

/// Write `bytes` to `path` through a sibling temporary file and an atomic rename.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    let file = fs::File::open(&tmp)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Serialize an aggregate index. Aggregates and entries are emitted in
/// deterministic order so rebuilding an index yields identical bytes.
fn encode_index(entries: &HashMap<String, Vec<IndexEntry>>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());

    let mut aggregates: Vec<&String> = entries.keys().collect();
    aggregates.sort();
    for aggregate in aggregates {
        let aggregate_entries = &entries[aggregate];
        buf.extend_from_slice(&(aggregate.len() as u16).to_le_bytes());
        buf.extend_from_slice(aggregate.as_bytes());
        buf.extend_from_slice(&(aggregate_entries.len() as u32).to_le_bytes());
        let mut sorted = aggregate_entries.clone();
        sorted.sort_by_key(|e| e.aggregate_sequence_number);
        for entry in sorted {
            buf.extend_from_slice(&entry.aggregate_sequence_number.to_le_bytes());
            buf.extend_from_slice(&entry.position.to_le_bytes());
            buf.extend_from_slice(&entry.token.to_le_bytes());
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Parse an index file, verifying magic, version, and whole-file checksum.
fn decode_index(segment: u64, buf: &[u8]) -> Result<LoadedIndex, Error> {
    if buf.len() < 13 || buf[0..4] != MAGIC {
        return Err(Error::data_file(segment, "index file has wrong magic"));
    }
    if buf[4] != FORMAT_VERSION {
        return Err(Error::data_file(
            segment,
            format!("unsupported index file version: {}", buf[4]),
        ));
    }

    let crc_offset = buf.len() - 4;
    let stored = u32::from_le_bytes([
        buf[crc_offset],
        buf[crc_offset + 1],
        buf[crc_offset + 2],
        buf[crc_offset + 3],
    ]);
    let computed = crc32fast::hash(&buf[..crc_offset]);
    if stored != computed {
        return Err(Error::data_file(
            segment,
            format!("index CRC mismatch: stored {stored:#010X}, computed {computed:#010X}"),
        ));
    }

    let aggregate_count = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    let body = &buf[9..crc_offset];
    let mut cursor = 0usize;
    let mut entries = HashMap::with_capacity(aggregate_count);

    macro_rules! take {
        ($n:expr) => {{
            let n = $n;
            if cursor + n > body.len() {
                return Err(Error::data_file(segment, "index file is truncated"));
            }
            let start = cursor;
            cursor += n;
            &body[start..cursor]
        }};
    }

    for _ in 0..aggregate_count {
        let id_raw = take!(2);
        let id_len = u16::from_le_bytes([id_raw[0], id_raw[1]]) as usize;
        let aggregate = std::str::from_utf8(take!(id_len))
            .map_err(|e| Error::data_file(segment, format!("invalid UTF-8 in index: {e}")))?
            .to_string();
        let count_raw = take!(4);
        let entry_count =
            u32::from_le_bytes([count_raw[0], count_raw[1], count_raw[2], count_raw[3]]) as usize;
        let mut aggregate_entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let raw = take!(20);
            aggregate_entries.push(IndexEntry {
                aggregate_sequence_number: u64::from_le_bytes(
                    raw[0..8].try_into().expect("8 bytes"),
                ),
                position: u32::from_le_bytes(raw[8..12].try_into().expect("4 bytes")),
                token: u64::from_le_bytes(raw[12..20].try_into().expect("8 bytes")),
            });
        }
        entries.insert(aggregate, aggregate_entries);
    }
    if cursor != body.len() {
        return Err(Error::data_file(segment, "index file has trailing bytes"));
    }

    Ok(LoadedIndex { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, position: u32, token: u64) -> IndexEntry {
        IndexEntry {
            aggregate_sequence_number: seq,
            position,
            token,
        }
    }

    fn manager(dir: &Path) -> IndexManager {
        IndexManager::new(vec![dir.to_path_buf()], 0.03)
    }

    /// Seed a completed segment index directly through the active buffer.
    fn seed_segment(manager: &IndexManager, segment: u64, entries: &[(&str, IndexEntry)]) {
        let mut map: HashMap<String, Vec<IndexEntry>> = HashMap::new();
        for (aggregate, e) in entries {
            map.entry((*aggregate).to_string()).or_default().push(*e);
        }
        manager.activate_segment(segment);
        manager.add_to_active_segment(segment, map);
        manager.complete(segment).expect("complete segment");
    }

    #[test]
    fn index_codec_round_trip() {
        let mut entries: HashMap<String, Vec<IndexEntry>> = HashMap::new();
        entries.insert("order-1".into(), vec![entry(0, 10, 0), entry(1, 90, 1)]);
        entries.insert("order-2".into(), vec![entry(0, 50, 2)]);

        let bytes = encode_index(&entries);
        let decoded = decode_index(0, &bytes).expect("decode");
        assert_eq!(decoded.entries, entries);
    }

    #[test]
    fn index_codec_detects_any_corruption() {
        let mut entries: HashMap<String, Vec<IndexEntry>> = HashMap::new();
        entries.insert("order-1".into(), vec![entry(0, 10, 0)]);
        let bytes = encode_index(&entries);

        // Corrupt every aligned 4-byte window in turn; each must be caught.
        for window in 0..bytes.len() / 4 {
            let mut corrupt = bytes.clone();
            for i in 0..4 {
                corrupt[window * 4 + i] ^= 0xA5;
            }
            assert!(
                decode_index(0, &corrupt).is_err(),
                "corruption at window {window} went undetected"
            );
        }
    }

    #[test]
    fn complete_persists_index_and_bloom() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        seed_segment(&manager, 0, &[("order-1", entry(0, 10, 0))]);

        assert!(index_file(dir.path(), 0).exists());
        assert!(bloom_file(dir.path(), 0).exists());
        assert!(manager.valid_index(0));
    }

    #[test]
    fn lookup_filters_by_sequence_token_and_max_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        seed_segment(
            &manager,
            0,
            &[
                ("order-1", entry(0, 10, 0)),
                ("order-1", entry(1, 80, 1)),
                ("order-2", entry(0, 150, 2)),
            ],
        );
        seed_segment(
            &manager,
            3,
            &[("order-1", entry(2, 10, 3)), ("order-1", entry(3, 90, 4))],
        );

        // Sequence range [1, 3) across both segments.
        let found = manager.lookup_aggregate("order-1", 1, 3, usize::MAX, 0);
        assert_eq!(found.len(), 2);
        assert_eq!(found[&0], vec![entry(1, 80, 1)]);
        assert_eq!(found[&3], vec![entry(2, 10, 3)]);

        // min_token cuts off the older segment entirely.
        let found = manager.lookup_aggregate("order-1", 0, u64::MAX, usize::MAX, 3);
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&3));

        // max_results stops the walk after the newest segment.
        let found = manager.lookup_aggregate("order-1", 0, u64::MAX, 2, 0);
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&3));
    }

    #[test]
    fn last_sequence_number_respects_segment_hint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        seed_segment(&manager, 0, &[("order-1", entry(4, 10, 4))]);
        seed_segment(&manager, 5, &[("order-2", entry(0, 10, 5))]);
        manager.activate_segment(6);

        assert_eq!(
            manager.get_last_sequence_number("order-1", usize::MAX, u64::MAX),
            Some(4)
        );
        // A walk capped at 2 segments (active + segment 5) never reaches
        // segment 0.
        assert_eq!(manager.get_last_sequence_number("order-1", 2, u64::MAX), None);
        // Hint at least as large as the number of segments: same answer as
        // the unbounded walk.
        assert_eq!(
            manager.get_last_sequence_number("order-1", 3, u64::MAX),
            Some(4)
        );
    }

    #[test]
    fn last_index_entries_finds_newest_segment_at_or_below_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        seed_segment(
            &manager,
            0,
            &[("order-1", entry(0, 10, 0)), ("order-1", entry(1, 80, 1))],
        );
        seed_segment(&manager, 2, &[("order-1", entry(2, 10, 2))]);

        let found = manager
            .last_index_entries("order-1", u64::MAX)
            .expect("entries");
        assert_eq!(found.segment, 2);

        let found = manager.last_index_entries("order-1", 1).expect("entries");
        assert_eq!(found.segment, 0);
        assert_eq!(found.entries, vec![entry(0, 10, 0), entry(1, 80, 1)]);

        assert!(manager.last_index_entries("order-9", u64::MAX).is_none());
    }

    #[test]
    fn valid_index_flips_false_on_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        seed_segment(&manager, 0, &[("order-1", entry(0, 10, 0))]);
        assert!(manager.valid_index(0));

        let path = index_file(dir.path(), 0);
        let mut bytes = fs::read(&path).expect("read index");
        let mid = bytes.len() / 2;
        for i in 0..4 {
            bytes[mid + i] ^= 0xFF;
        }
        fs::write(&path, &bytes).expect("write corrupted index");
        assert!(!manager.valid_index(0));
    }

    #[test]
    fn valid_index_requires_both_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        seed_segment(&manager, 0, &[("order-1", entry(0, 10, 0))]);

        fs::remove_file(bloom_file(dir.path(), 0)).expect("remove bloom");
        assert!(!manager.valid_index(0));
    }

    #[test]
    fn active_entries_visible_before_complete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        manager.activate_segment(7);
        let mut map: HashMap<String, Vec<IndexEntry>> = HashMap::new();
        map.insert("order-1".into(), vec![entry(0, 10, 7)]);
        manager.add_to_active_segment(7, map);

        let found = manager.lookup_aggregate("order-1", 0, u64::MAX, usize::MAX, 0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[&7], vec![entry(0, 10, 7)]);
    }
}
