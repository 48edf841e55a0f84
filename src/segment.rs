//! Segment files and scoped read access.
//!
//! A segment is an immutable, append-only file holding a contiguous token
//! range; its id is the token of its first event. This module provides the
//! file-name helpers shared by every layer, the [`EventSource`] scoped read
//! handle, and the forward iterators over events and transactions.
//!
//! `EventSource` is deliberately the only way to read segment bytes: each
//! handle registers itself on an open-handles gauge and unregisters on drop,
//! so a leaked reader shows up in the metrics rather than as a silently
//! pinned memory map.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};
use metrics::{counter, gauge};

use crate::codec::{self, DecodeOutcome};
use crate::error::Error;
use crate::types::{Event, TransactionWithToken};

/// File suffix of event segment files.
pub const EVENTS_SUFFIX: &str = "events";
/// File suffix of aggregate index files.
pub const INDEX_SUFFIX: &str = "index";
/// File suffix of bloom filter files.
pub const BLOOM_SUFFIX: &str = "bloom";

/// Legacy suffixes recognized on startup and renamed in place.
pub const LEGACY_EVENTS_SUFFIX: &str = "data";
/// Legacy index suffix.
pub const LEGACY_INDEX_SUFFIX: &str = "idx";
/// Legacy bloom suffix.
pub const LEGACY_BLOOM_SUFFIX: &str = "bf";

/// File name of a segment-scoped file: zero-padded so lexicographic order
/// equals token order.
pub fn segment_file_name(segment: u64, suffix: &str) -> String {
    format!("{segment:020}.{suffix}")
}

/// Path of the `.events` file of a segment.
pub fn events_file(dir: &Path, segment: u64) -> PathBuf {
    dir.join(segment_file_name(segment, EVENTS_SUFFIX))
}

/// Path of the `.index` file of a segment.
pub fn index_file(dir: &Path, segment: u64) -> PathBuf {
    dir.join(segment_file_name(segment, INDEX_SUFFIX))
}

/// Path of the `.bloom` file of a segment.
pub fn bloom_file(dir: &Path, segment: u64) -> PathBuf {
    dir.join(segment_file_name(segment, BLOOM_SUFFIX))
}

/// Parse a segment id out of a file name with the given suffix.
///
/// Returns `None` for files that do not match `<decimal>.<suffix>`.
pub fn parse_segment_file_name(name: &str, suffix: &str) -> Option<u64> {
    let stem = name.strip_suffix(suffix)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Backing bytes of a segment, shared between all its open sources.
#[derive(Clone)]
pub(crate) enum SourceData {
    /// The mutable active segment. Readers only see bytes below the committed
    /// watermark, which the writer advances after each fsynced transaction.
    Active {
        mmap: Arc<RwLock<MmapMut>>,
        committed: Arc<AtomicUsize>,
    },
    /// A sealed, read-only segment. `data_len` excludes the footer.
    Sealed { mmap: Arc<Mmap>, data_len: usize },
}

/// Scoped, reference-counted read handle to one segment.
///
/// Acquisition and release are tracked on the `eventcask_open_event_sources`
/// gauge. Cloning produces another tracked handle over the same bytes.
pub struct EventSource {
    segment: u64,
    data: SourceData,
}

impl EventSource {
    pub(crate) fn new(segment: u64, data: SourceData) -> EventSource {
        counter!("eventcask_event_source_opens_total").increment(1);
        gauge!("eventcask_open_event_sources").increment(1.0);
        EventSource { segment, data }
    }

    /// Segment id this source reads from.
    pub fn segment(&self) -> u64 {
        self.segment
    }

    /// Run `f` over the currently readable bytes of the segment.
    ///
    /// For the active segment this is the committed prefix; for sealed
    /// segments everything up to the footer.
    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.data {
            SourceData::Active { mmap, committed } => {
                let end = committed.load(Ordering::Acquire);
                let guard = mmap.read().expect("active segment lock poisoned");
                f(&guard[..end])
            }
            SourceData::Sealed { mmap, data_len } => f(&mmap[..*data_len]),
        }
    }

    /// Number of readable bytes (committed prefix or sealed data length).
    pub fn data_len(&self) -> usize {
        match &self.data {
            SourceData::Active { committed, .. } => committed.load(Ordering::Acquire),
            SourceData::Sealed { data_len, .. } => *data_len,
        }
    }

    /// Decode the event record at a byte position within the segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataFileRead`] if the position is out of range or the
    /// record is malformed.
    pub fn read_event(&self, position: u32) -> Result<Event, Error> {
        self.with_data(|data| {
            let position = position as usize;
            if position >= data.len() {
                return Err(Error::data_file(
                    self.segment,
                    format!("event position {position} beyond committed data"),
                ));
            }
            match codec::decode_event(self.segment, &data[position..])? {
                DecodeOutcome::Complete { value, .. } => Ok(value),
                DecodeOutcome::Incomplete => Err(Error::data_file(
                    self.segment,
                    format!("truncated event record at position {position}"),
                )),
            }
        })
    }

    /// Copy raw bytes out of the segment. Used by tests and the validator.
    pub fn read_bytes(&self, position: usize, len: usize) -> Result<Bytes, Error> {
        self.with_data(|data| {
            if position + len > data.len() {
                return Err(Error::data_file(self.segment, "read beyond committed data"));
            }
            Ok(Bytes::copy_from_slice(&data[position..position + len]))
        })
    }

    /// Forward iterator over events, starting at `start_token`.
    ///
    /// `start_token` may point into the middle of a transaction; preceding
    /// events of that transaction are skipped.
    pub fn event_iterator(&self, start_token: u64) -> EventIterator {
        EventIterator {
            source: self.clone(),
            offset: codec::FILE_HEADER_SIZE,
            next_token: self.segment,
            start_token,
            buffered: std::collections::VecDeque::new(),
            done: false,
        }
    }

    /// Forward iterator over whole transactions, starting at the transaction
    /// containing `start_token`.
    ///
    /// With `validating` set, every transaction checksum is verified.
    pub fn transaction_iterator(&self, start_token: u64, validating: bool) -> TransactionIterator {
        TransactionIterator {
            source: self.clone(),
            offset: codec::FILE_HEADER_SIZE,
            next_token: self.segment,
            start_token,
            validating,
            done: false,
        }
    }
}

impl Clone for EventSource {
    fn clone(&self) -> EventSource {
        gauge!("eventcask_open_event_sources").increment(1.0);
        EventSource {
            segment: self.segment,
            data: self.data.clone(),
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        gauge!("eventcask_open_event_sources").decrement(1.0);
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("segment", &self.segment)
            .field("data_len", &self.data_len())
            .finish()
    }
}

/// One event as seen by [`EventIterator`]: the event plus its token and its
/// byte position within the segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInformation {
    /// Global token of the event.
    pub token: u64,
    /// Byte offset of the event record within the segment file.
    pub position: u32,
    /// The event itself.
    pub event: Event,
}

/// Forward iterator over the events of one segment.
///
/// Yields events in token order, starting at the requested token. Ends at the
/// committed watermark (active segment) or the footer (sealed segment).
pub struct EventIterator {
    source: EventSource,
    offset: usize,
    next_token: u64,
    start_token: u64,
    buffered: std::collections::VecDeque<EventInformation>,
    done: bool,
}

impl EventIterator {
    fn fill_buffer(&mut self) -> Result<bool, Error> {
        loop {
            let decoded = self.source.with_data(|data| {
                if self.offset >= data.len() {
                    return Ok(DecodeOutcome::Incomplete);
                }
                codec::decode_transaction(self.source.segment, &data[self.offset..], false)
            })?;

            let (header, events) = match decoded {
                DecodeOutcome::Complete { value, .. } => value,
                DecodeOutcome::Incomplete => return Ok(false),
            };
            let first_token = self.next_token;
            let frame_offset = self.offset;
            self.offset += header.frame_size();
            self.next_token += u64::from(header.event_count);

            // Whole transaction before the start token: skip without buffering.
            if self.next_token <= self.start_token {
                continue;
            }
            for (i, (relative_position, event)) in events.into_iter().enumerate() {
                let token = first_token + i as u64;
                if token < self.start_token {
                    continue;
                }
                self.buffered.push_back(EventInformation {
                    token,
                    position: (frame_offset as u32) + relative_position,
                    event,
                });
            }
            if !self.buffered.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl Iterator for EventIterator {
    type Item = Result<EventInformation, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(info) = self.buffered.pop_front() {
            return Some(Ok(info));
        }
        if self.done {
            return None;
        }
        match self.fill_buffer() {
            Ok(true) => self.buffered.pop_front().map(Ok),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Forward iterator over the transactions of one segment.
pub struct TransactionIterator {
    source: EventSource,
    offset: usize,
    next_token: u64,
    start_token: u64,
    validating: bool,
    done: bool,
}

impl TransactionIterator {
    /// Token of the first event of the next transaction to be returned.
    pub fn current_token(&self) -> u64 {
        self.next_token
    }
}

impl Iterator for TransactionIterator {
    type Item = Result<TransactionWithToken, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let decoded = match self.source.with_data(|data| {
                if self.offset >= data.len() {
                    return Ok(DecodeOutcome::Incomplete);
                }
                codec::decode_transaction(self.source.segment, &data[self.offset..], self.validating)
            }) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            let (header, events) = match decoded {
                DecodeOutcome::Complete { value, .. } => value,
                DecodeOutcome::Incomplete => {
                    self.done = true;
                    return None;
                }
            };
            let token = self.next_token;
            self.offset += header.frame_size();
            self.next_token += u64::from(header.event_count);

            // Transactions entirely before the start token are skipped.
            if self.next_token <= self.start_token {
                continue;
            }
            return Some(Ok(TransactionWithToken {
                token,
                version: header.version,
                events: events.into_iter().map(|(_, event)| event).collect(),
            }));
        }
    }
}
