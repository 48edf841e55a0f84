//! The active (primary) segment.
//!
//! The active segment is a pre-allocated, memory-mapped file that receives
//! every append. Transactions are serialized onto its tail; once a frame and
//! its checksum are flushed, the committed watermark advances and the events
//! become visible to readers holding an [`EventSource`] over the same map.
//!
//! A segment that cannot fit the next transaction is sealed: the footer is
//! written, the file is flushed and truncated to its used length, and the
//! caller promotes it to the completed layer before opening a successor.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use memmap2::MmapMut;

use crate::codec::{
    self, DecodeOutcome, FILE_FOOTER_MAGIC, FILE_FOOTER_SIZE, FILE_HEADER_SIZE,
};
use crate::error::Error;
use crate::segment::{events_file, EventSource, SourceData};
use crate::types::{Event, IndexEntry};

/// Outcome of offering a batch to the active segment.
#[derive(Debug)]
pub enum AppendOutcome {
    /// The transaction was written and flushed.
    Stored {
        /// Token assigned to the first event of the batch.
        first_token: u64,
        /// Index entries for the domain events of the batch.
        entries: HashMap<String, Vec<IndexEntry>>,
    },
    /// The transaction does not fit; the segment must roll over.
    SegmentFull,
}

/// The mutable head segment of the store.
///
/// Exactly one `ActiveSegment` exists per store; it is owned by the writer
/// task. Readers access it through [`EventSource`] handles that share the
/// underlying map and observe only committed bytes.
pub struct ActiveSegment {
    segment: u64,
    path: PathBuf,
    file: std::fs::File,
    mmap: Arc<RwLock<MmapMut>>,
    committed: Arc<AtomicUsize>,
    write_position: usize,
    next_token: u64,
}

impl ActiveSegment {
    /// Create a fresh active segment with `first_token` in `dir`.
    ///
    /// The file is pre-allocated to `size` bytes and starts with the segment
    /// file header.
    pub fn create(dir: &Path, first_token: u64, size: u64) -> Result<ActiveSegment, Error> {
        let path = events_file(dir, first_token);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(size)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[..FILE_HEADER_SIZE].copy_from_slice(&codec::encode_file_header(0));
        mmap.flush_range(0, FILE_HEADER_SIZE)?;

        // Make the directory entry durable as well; a crash right after
        // creation must not lose the file.
        let dir_handle = std::fs::File::open(dir)?;
        dir_handle.sync_all()?;

        Ok(ActiveSegment {
            segment: first_token,
            path,
            file,
            mmap: Arc::new(RwLock::new(mmap)),
            committed: Arc::new(AtomicUsize::new(FILE_HEADER_SIZE)),
            write_position: FILE_HEADER_SIZE,
            next_token: first_token,
        })
    }

    /// Re-open a crashed (unsealed) segment as the active segment.
    ///
    /// Scans the file transaction by transaction with checksum verification.
    /// A trailing incomplete or corrupt transaction is expected after an
    /// unclean shutdown: the tail is zeroed with a warning and appends resume
    /// at the last valid boundary. Returns the segment together with the
    /// recovered index entries of its domain events.
    pub fn recover(
        dir: &Path,
        first_token: u64,
        size: u64,
    ) -> Result<(ActiveSegment, HashMap<String, Vec<IndexEntry>>), Error> {
        let path = events_file(dir, first_token);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() < size {
            // The map must span the full pre-allocated size for future appends.
            file.set_len(size)?;
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        codec::decode_file_header(first_token, &mmap[..])?;

        let mut offset = FILE_HEADER_SIZE;
        let mut next_token = first_token;
        let mut entries: HashMap<String, Vec<IndexEntry>> = HashMap::new();

        loop {
            match codec::decode_transaction(first_token, &mmap[offset..], true) {
                Ok(DecodeOutcome::Complete {
                    value: (_, events),
                    consumed,
                }) => {
                    for (i, (relative_position, event)) in events.iter().enumerate() {
                        if event.is_domain_event() {
                            entries
                                .entry(event.aggregate_identifier.clone())
                                .or_default()
                                .push(IndexEntry {
                                    aggregate_sequence_number: event.aggregate_sequence_number,
                                    position: offset as u32 + relative_position,
                                    token: next_token + i as u64,
                                });
                        }
                    }
                    next_token += events.len() as u64;
                    offset += consumed;
                }
                Ok(DecodeOutcome::Incomplete) => break,
                Err(err) => {
                    tracing::warn!(
                        segment = first_token,
                        offset,
                        %err,
                        "zeroing trailing partial transaction in recovered active segment"
                    );
                    break;
                }
            }
        }

        // Zero everything past the last valid transaction so a torn tail can
        // never be mistaken for a frame again.
        if offset < mmap.len() {
            mmap[offset..].fill(0);
            mmap.flush()?;
        }

        Ok((
            ActiveSegment {
                segment: first_token,
                path,
                file,
                mmap: Arc::new(RwLock::new(mmap)),
                committed: Arc::new(AtomicUsize::new(offset)),
                write_position: offset,
                next_token,
            },
            entries,
        ))
    }

    /// Token of this segment's first event (the segment id).
    pub fn segment(&self) -> u64 {
        self.segment
    }

    /// Token the next appended event will receive.
    pub fn next_token(&self) -> u64 {
        self.next_token
    }

    /// Number of events stored in this segment so far.
    pub fn event_count(&self) -> u64 {
        self.next_token - self.segment
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A scoped read handle over this segment's committed bytes.
    pub fn source(&self) -> EventSource {
        EventSource::new(
            self.segment,
            SourceData::Active {
                mmap: Arc::clone(&self.mmap),
                committed: Arc::clone(&self.committed),
            },
        )
    }

    /// Append one batch of events as a single transaction.
    ///
    /// The frame is written onto the tail, flushed to disk, and only then
    /// published through the committed watermark -- no event is visible until
    /// its transaction checksum is durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the batch cannot fit even in an
    /// empty segment, and [`Error::Io`] on write failures.
    pub fn append(&mut self, events: &[Event]) -> Result<AppendOutcome, Error> {
        let (frame, positions) = codec::encode_transaction(events)?;
        let map_len = {
            let guard = self.mmap.read().expect("active segment lock poisoned");
            guard.len()
        };

        if self.write_position + frame.len() + FILE_FOOTER_SIZE > map_len {
            if FILE_HEADER_SIZE + frame.len() + FILE_FOOTER_SIZE > map_len {
                return Err(Error::InvalidArgument(format!(
                    "transaction of {} bytes can never fit a segment of {} bytes",
                    frame.len(),
                    map_len
                )));
            }
            return Ok(AppendOutcome::SegmentFull);
        }

        {
            let mut guard = self.mmap.write().expect("active segment lock poisoned");
            guard[self.write_position..self.write_position + frame.len()]
                .copy_from_slice(&frame);
            guard.flush_range(self.write_position, frame.len())?;
        }

        let first_token = self.next_token;
        let mut entries: HashMap<String, Vec<IndexEntry>> = HashMap::new();
        for (i, event) in events.iter().enumerate() {
            if event.is_domain_event() {
                entries
                    .entry(event.aggregate_identifier.clone())
                    .or_default()
                    .push(IndexEntry {
                        aggregate_sequence_number: event.aggregate_sequence_number,
                        position: (self.write_position as u32) + positions[i],
                        token: first_token + i as u64,
                    });
            }
        }

        self.write_position += frame.len();
        self.next_token += events.len() as u64;
        // Publish: readers snapshot the watermark with Acquire.
        self.committed.store(self.write_position, Ordering::Release);

        Ok(AppendOutcome::Stored {
            first_token,
            entries,
        })
    }

    /// Seal the segment: write the footer, flush, and truncate the file to
    /// its used length.
    ///
    /// Readers holding sources over this segment keep working -- they only
    /// ever touch committed bytes, all of which precede the truncation point.
    /// Returns the token of the first event of the successor segment.
    pub fn seal(self) -> Result<u64, Error> {
        {
            let mut guard = self.mmap.write().expect("active segment lock poisoned");
            guard[self.write_position..self.write_position + FILE_FOOTER_SIZE]
                .copy_from_slice(&FILE_FOOTER_MAGIC.to_le_bytes());
            guard.flush()?;
        }
        self.file
            .set_len((self.write_position + FILE_FOOTER_SIZE) as u64)?;
        self.file.sync_all()?;
        Ok(self.next_token)
    }
}

impl std::fmt::Debug for ActiveSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSegment")
            .field("segment", &self.segment)
            .field("next_token", &self.next_token)
            .field("write_position", &self.write_position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SEGMENT_SIZE: u64 = 64 * 1024;

    fn sample_event(aggregate: &str, seq: u64) -> Event {
        Event {
            aggregate_identifier: aggregate.to_string(),
            aggregate_type: "Order".to_string(),
            aggregate_sequence_number: seq,
            timestamp: 1_000 + seq as i64,
            payload_type: "OrderPlaced".to_string(),
            payload_revision: "1.0".to_string(),
            payload: Bytes::from(format!("payload-{seq}")),
            meta_data: Bytes::new(),
            snapshot: false,
        }
    }

    #[test]
    fn create_preallocates_and_writes_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let active = ActiveSegment::create(dir.path(), 0, SEGMENT_SIZE).expect("create");

        assert_eq!(active.segment(), 0);
        assert_eq!(active.next_token(), 0);
        let len = std::fs::metadata(active.path()).expect("metadata").len();
        assert_eq!(len, SEGMENT_SIZE);
    }

    #[test]
    fn append_assigns_tokens_and_index_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSegment::create(dir.path(), 10, SEGMENT_SIZE).expect("create");

        let events = vec![sample_event("order-1", 0), sample_event("order-1", 1)];
        let outcome = active.append(&events).expect("append");
        let AppendOutcome::Stored {
            first_token,
            entries,
        } = outcome
        else {
            panic!("expected stored outcome");
        };
        assert_eq!(first_token, 10);
        assert_eq!(active.next_token(), 12);

        let order_entries = &entries["order-1"];
        assert_eq!(order_entries.len(), 2);
        assert_eq!(order_entries[0].token, 10);
        assert_eq!(order_entries[1].token, 11);

        // Positions resolve to the exact events through a source.
        let source = active.source();
        for (i, entry) in order_entries.iter().enumerate() {
            let event = source.read_event(entry.position).expect("read_event");
            assert_eq!(event.aggregate_sequence_number, i as u64);
        }
    }

    #[test]
    fn events_invisible_until_committed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSegment::create(dir.path(), 0, SEGMENT_SIZE).expect("create");
        let source = active.source();
        assert_eq!(source.event_iterator(0).count(), 0);

        active.append(&[sample_event("order-1", 0)]).expect("append");
        // The same pre-existing source sees the event after the watermark moves.
        assert_eq!(source.event_iterator(0).count(), 1);
    }

    #[test]
    fn small_segment_reports_full_and_oversized_batch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSegment::create(dir.path(), 0, 512).expect("create");

        // Fill the tiny segment.
        loop {
            match active.append(&[sample_event("order-1", active.event_count())]) {
                Ok(AppendOutcome::Stored { .. }) => {}
                Ok(AppendOutcome::SegmentFull) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }

        // A batch that cannot fit any segment of this size is an error, not
        // a rollover request.
        let huge = Event {
            payload: Bytes::from(vec![0u8; 4096]),
            ..sample_event("order-1", 99)
        };
        let err = active.append(&[huge]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn seal_truncates_to_used_length_with_footer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut active = ActiveSegment::create(dir.path(), 0, SEGMENT_SIZE).expect("create");
        active.append(&[sample_event("order-1", 0)]).expect("append");
        let path = active.path().to_path_buf();

        let next_token = active.seal().expect("seal");
        assert_eq!(next_token, 1);

        let bytes = std::fs::read(&path).expect("read sealed file");
        assert!(bytes.len() < SEGMENT_SIZE as usize);
        let footer = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().expect("4 bytes"));
        assert_eq!(footer, FILE_FOOTER_MAGIC);
    }

    #[test]
    fn recover_resumes_after_clean_transactions() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut active = ActiveSegment::create(dir.path(), 0, SEGMENT_SIZE).expect("create");
            active.append(&[sample_event("order-1", 0)]).expect("append");
            active
                .append(&[sample_event("order-1", 1), sample_event("order-2", 0)])
                .expect("append");
            // Dropped without seal: simulates a crash.
        }

        let (active, entries) =
            ActiveSegment::recover(dir.path(), 0, SEGMENT_SIZE).expect("recover");
        assert_eq!(active.next_token(), 3);
        assert_eq!(entries["order-1"].len(), 2);
        assert_eq!(entries["order-2"].len(), 1);
    }

    #[test]
    fn recover_zeroes_torn_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (path, valid_committed) = {
            let mut active = ActiveSegment::create(dir.path(), 0, SEGMENT_SIZE).expect("create");
            active.append(&[sample_event("order-1", 0)]).expect("append");
            let committed = active.committed.load(Ordering::Acquire);
            active.append(&[sample_event("order-1", 1)]).expect("append");
            (active.path().to_path_buf(), committed)
        };

        // Corrupt a byte inside the second transaction.
        let mut bytes = std::fs::read(&path).expect("read");
        bytes[valid_committed + 10] ^= 0xFF;
        std::fs::write(&path, &bytes).expect("write corrupted");

        let (active, entries) =
            ActiveSegment::recover(dir.path(), 0, SEGMENT_SIZE).expect("recover");
        assert_eq!(active.next_token(), 1, "only the intact transaction survives");
        assert_eq!(entries["order-1"].len(), 1);

        // The zeroed tail accepts fresh appends at the recovered boundary.
        let mut active = active;
        match active.append(&[sample_event("order-1", 1)]).expect("append") {
            AppendOutcome::Stored { first_token, .. } => assert_eq!(first_token, 1),
            AppendOutcome::SegmentFull => panic!("segment should not be full"),
        }
    }
}
