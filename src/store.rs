//! The segmented store: layer chain, recovery, and token-ordered reads.
//!
//! A store is a stack of segment layers. The active segment receives every
//! append; sealed segments live in the completed layer; segments demoted by
//! an operator (a plain file move into the `cold/` subdirectory) form the
//! cold layer. Every read falls through the stack from hottest to coldest.
//!
//! Opening a store runs recovery: legacy file suffixes are renamed in place,
//! an unsealed head segment is re-adopted as the active segment (with its
//! torn tail truncated), missing or corrupt indices are rebuilt from a full
//! segment scan, and the newest segments are validated for checksum and
//! token-continuity violations. A broken chain refuses to open.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use memmap2::Mmap;

use crate::active::{ActiveSegment, AppendOutcome};
use crate::codec::{FILE_FOOTER_MAGIC, FILE_FOOTER_SIZE, FILE_HEADER_SIZE};
use crate::config::StorageConfig;
use crate::error::Error;
use crate::index::IndexManager;
use crate::segment::{
    self, events_file, EventIterator, EventSource, SourceData, TransactionIterator,
    BLOOM_SUFFIX, EVENTS_SUFFIX, INDEX_SUFFIX, LEGACY_BLOOM_SUFFIX, LEGACY_EVENTS_SUFFIX,
    LEGACY_INDEX_SUFFIX,
};
use crate::types::{Event, EventWithToken, QueryOptions, SearchHint};

/// Number of sealed segment maps kept open per layer.
const SOURCE_CACHE_CAPACITY: usize = 32;

/// One read-only tier of the segment chain.
///
/// A layer owns a disjoint set of sealed segments in one directory and falls
/// back to `next` for anything it does not own.
pub(crate) struct SegmentLayer {
    dir: PathBuf,
    segments: RwLock<BTreeSet<u64>>,
    sources: Mutex<LruCache<u64, Arc<Mmap>>>,
    next: Option<Box<SegmentLayer>>,
}

impl SegmentLayer {
    fn new(dir: PathBuf, next: Option<Box<SegmentLayer>>) -> SegmentLayer {
        SegmentLayer {
            dir,
            segments: RwLock::new(BTreeSet::new()),
            sources: Mutex::new(LruCache::new(
                NonZeroUsize::new(SOURCE_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
            next,
        }
    }

    /// Populate the segment set from the layer directory.
    fn scan(&self) -> Result<(), Error> {
        if !self.dir.exists() {
            return Ok(());
        }
        let mut segments = self.segments.write().expect("segment set lock poisoned");
        for dir_entry in fs::read_dir(&self.dir)? {
            let name = dir_entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(segment) = segment::parse_segment_file_name(name, EVENTS_SUFFIX) {
                segments.insert(segment);
            }
        }
        Ok(())
    }

    /// Returns `true` if this layer (not the chain) owns the segment.
    fn contains_segment(&self, segment: u64) -> bool {
        self.segments
            .read()
            .expect("segment set lock poisoned")
            .contains(&segment)
    }

    /// Accept a sealed segment from the layer above.
    ///
    /// `on_complete` fires once the segment is visible to readers of this
    /// layer; from that point the hotter layer may drop its own handle.
    fn handover(&self, segment: u64, on_complete: impl FnOnce()) {
        self.segments
            .write()
            .expect("segment set lock poisoned")
            .insert(segment);
        on_complete();
    }

    /// Own segments, newest first.
    fn segments_descending(&self) -> Vec<u64> {
        self.segments
            .read()
            .expect("segment set lock poisoned")
            .iter()
            .rev()
            .copied()
            .collect()
    }

    /// All segments of this layer and every layer below, newest first.
    fn all_segments_descending(&self) -> Vec<u64> {
        let mut all = self.segments_descending();
        if let Some(next) = &self.next {
            all.extend(next.all_segments_descending());
        }
        all.sort_unstable_by(|a, b| b.cmp(a));
        all.dedup();
        all
    }

    /// Oldest segment anywhere in the chain.
    fn oldest_segment(&self) -> Option<u64> {
        let own = self
            .segments
            .read()
            .expect("segment set lock poisoned")
            .iter()
            .next()
            .copied();
        match &self.next {
            Some(next) => next.oldest_segment().or(own),
            None => own,
        }
    }

    /// Greatest owned segment id at or below `token`, delegating on miss.
    fn segment_for(&self, token: u64) -> Option<u64> {
        let own = self
            .segments
            .read()
            .expect("segment set lock poisoned")
            .range(..=token)
            .next_back()
            .copied();
        match own {
            Some(segment) => Some(segment),
            None => self.next.as_ref().and_then(|next| next.segment_for(token)),
        }
    }

    /// Event source for a segment, falling through to the next layer when the
    /// segment is not owned here or its file fails to open.
    fn event_source(&self, segment: u64) -> Option<EventSource> {
        if self.contains_segment(segment) {
            match self.open_source(segment) {
                Ok(source) => return Some(source),
                Err(err) => {
                    tracing::warn!(
                        segment,
                        dir = %self.dir.display(),
                        %err,
                        "failed to open segment in this layer, falling through"
                    );
                }
            }
        }
        self.next.as_ref().and_then(|next| next.event_source(segment))
    }

    fn open_source(&self, segment: u64) -> Result<EventSource, Error> {
        let mmap = {
            let mut cache = self.sources.lock().expect("source cache lock poisoned");
            match cache.get(&segment) {
                Some(mmap) => Arc::clone(mmap),
                None => {
                    let file = fs::File::open(events_file(&self.dir, segment))?;
                    let mmap = Arc::new(unsafe { Mmap::map(&file)? });
                    cache.put(segment, Arc::clone(&mmap));
                    mmap
                }
            }
        };
        if mmap.len() < FILE_HEADER_SIZE + FILE_FOOTER_SIZE {
            return Err(Error::data_file(segment, "segment file too short"));
        }
        crate::codec::decode_file_header(segment, &mmap[..])?;
        let data_len = sealed_data_len(&mmap);
        Ok(EventSource::new(
            segment,
            SourceData::Sealed { mmap, data_len },
        ))
    }
}

/// Readable data length of a sealed segment: everything before the footer,
/// or the whole file for a segment that was demoted before being sealed.
fn sealed_data_len(bytes: &[u8]) -> usize {
    if bytes.len() >= FILE_FOOTER_SIZE {
        let tail = &bytes[bytes.len() - FILE_FOOTER_SIZE..];
        if u32::from_le_bytes(tail.try_into().expect("4 bytes")) == FILE_FOOTER_MAGIC {
            return bytes.len() - FILE_FOOTER_SIZE;
        }
    }
    bytes.len()
}

/// View of the active segment shared with readers.
struct ActiveView {
    segment: u64,
    source: EventSource,
}

type CloseListener = Arc<dyn Fn() + Send + Sync>;

/// State shared between the writer-owned [`SegmentStore`] and every
/// [`StoreReader`] handle.
struct StoreShared {
    context: String,
    config: StorageConfig,
    index: IndexManager,
    active: RwLock<ActiveView>,
    completed: SegmentLayer,
    next_token: AtomicU64,
    /// Listener set; close() iterates a clone so listeners run unlocked.
    close_listeners: RwLock<Vec<(u64, CloseListener)>>,
    listener_sequence: AtomicU64,
    closed: AtomicBool,
}

/// The writable half of a store.
///
/// Owned by exactly one writer (typically the writer task spawned by
/// [`spawn_store`](crate::transaction::spawn_store)); every other component
/// holds [`StoreReader`] clones.
pub struct SegmentStore {
    shared: Arc<StoreShared>,
    active: ActiveSegment,
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore").finish_non_exhaustive()
    }
}

impl SegmentStore {
    /// Open (or create) the store for one context in `dir`.
    ///
    /// Runs the full recovery pipeline described in the module docs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationFailed`] if the newest
    /// `validation_segments` segments fail checksum or continuity checks, and
    /// [`Error::Io`] / [`Error::DataFileRead`] on unreadable files.
    pub fn open(context: &str, dir: &Path, config: &StorageConfig) -> Result<SegmentStore, Error> {
        fs::create_dir_all(dir)?;
        rename_legacy_files(dir)?;

        let cold_dir = dir.join("cold");
        if cold_dir.exists() {
            rename_legacy_files(&cold_dir)?;
        }
        let cold = SegmentLayer::new(cold_dir.clone(), None);
        cold.scan()?;
        let completed = SegmentLayer::new(dir.to_path_buf(), Some(Box::new(cold)));
        completed.scan()?;

        let index = IndexManager::new(
            vec![dir.to_path_buf(), cold_dir],
            config.index_bloom_fpp,
        );

        // The newest segment in the hot directory is re-adopted as the active
        // segment when it was never sealed (crash before rollover).
        let newest_hot = completed.segments_descending().first().copied();
        let reactivate = match newest_hot {
            Some(segment) => !file_is_sealed(&events_file(dir, segment))?,
            None => false,
        };

        let (active, active_entries) = if reactivate {
            let segment = newest_hot.expect("reactivate implies a segment");
            completed
                .segments
                .write()
                .expect("segment set lock poisoned")
                .remove(&segment);
            tracing::info!(context, segment, "re-adopting unsealed segment as active");
            ActiveSegment::recover(dir, segment, config.max_segment_size)?
        } else {
            let next_token = match completed.all_segments_descending().first() {
                Some(&newest) => {
                    let source = completed
                        .event_source(newest)
                        .ok_or(Error::SegmentUnavailable { segment: newest })?;
                    newest + count_events(&source, newest)?
                }
                None => 0,
            };
            (
                ActiveSegment::create(dir, next_token, config.max_segment_size)?,
                HashMap::new(),
            )
        };

        // Rebuild any completed segment whose index is missing or corrupt.
        for layer_segment in completed.all_segments_descending() {
            if index.valid_index(layer_segment) {
                index.register_completed(layer_segment);
            } else {
                tracing::warn!(
                    context,
                    segment = layer_segment,
                    "index missing or invalid, rebuilding from segment scan"
                );
                let source = completed
                    .event_source(layer_segment)
                    .ok_or(Error::SegmentUnavailable {
                        segment: layer_segment,
                    })?;
                rebuild_index(&index, &source, layer_segment)?;
            }
        }

        index.activate_segment(active.segment());
        if !active_entries.is_empty() {
            index.add_to_active_segment(active.segment(), active_entries);
        }

        let shared = Arc::new(StoreShared {
            context: context.to_string(),
            config: config.clone(),
            index,
            active: RwLock::new(ActiveView {
                segment: active.segment(),
                source: active.source(),
            }),
            completed,
            next_token: AtomicU64::new(active.next_token()),
            close_listeners: RwLock::new(Vec::new()),
            listener_sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let store = SegmentStore { shared, active };
        store.reader().validate(config.validation_segments)?;
        Ok(store)
    }

    /// A cloneable read handle over this store.
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Append one batch of events as a single durable transaction.
    ///
    /// Rolls the active segment over when the batch does not fit. Returns
    /// the token assigned to the first event of the batch.
    pub fn append_batch(&mut self, events: &[Event]) -> Result<u64, Error> {
        let outcome = self.active.append(events)?;
        let (first_token, entries) = match outcome {
            AppendOutcome::Stored {
                first_token,
                entries,
            } => (first_token, entries),
            AppendOutcome::SegmentFull => {
                self.roll_over()?;
                match self.active.append(events)? {
                    AppendOutcome::Stored {
                        first_token,
                        entries,
                    } => (first_token, entries),
                    AppendOutcome::SegmentFull => {
                        return Err(Error::InvalidArgument(
                            "transaction does not fit an empty segment".to_string(),
                        ));
                    }
                }
            }
        };

        if !entries.is_empty() {
            self.shared
                .index
                .add_to_active_segment(self.active.segment(), entries);
        }
        self.shared
            .next_token
            .store(self.active.next_token(), Ordering::Release);
        Ok(first_token)
    }

    /// Seal the active segment, finalize its index, hand it to the completed
    /// layer, and open a successor.
    fn roll_over(&mut self) -> Result<(), Error> {
        let sealed_segment = self.active.segment();
        let next_token = self.active.next_token();
        tracing::info!(
            context = %self.shared.context,
            segment = sealed_segment,
            next_token,
            "rolling over active segment"
        );

        let successor = ActiveSegment::create(
            &self.shared.completed.dir,
            next_token,
            self.shared.config.max_segment_size,
        )?;

        let previous = std::mem::replace(&mut self.active, successor);
        previous.seal()?;
        self.shared.index.complete(sealed_segment)?;
        self.shared.completed.handover(sealed_segment, || {});

        self.shared.index.activate_segment(self.active.segment());
        let mut view = self.shared.active.write().expect("active view lock poisoned");
        view.segment = self.active.segment();
        view.source = self.active.source();
        Ok(())
    }

    /// Close the store and notify close listeners exactly once.
    ///
    /// Appended data is already durable at this point; every transaction is
    /// flushed before its append completes.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<(u64, CloseListener)> = self
            .shared
            .close_listeners
            .read()
            .expect("close listener lock poisoned")
            .clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                tracing::warn!(listener = id, "close listener panicked during shutdown");
            }
        }
    }
}

impl Drop for SegmentStore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deregistration handle for a close listener.
///
/// Dropping the handle does not deregister; call
/// [`deregister`](ListenerRegistration::deregister) explicitly.
pub struct ListenerRegistration {
    shared: Arc<StoreShared>,
    id: u64,
}

impl ListenerRegistration {
    /// Remove the listener from the store's listener set.
    pub fn deregister(self) {
        let mut listeners = self
            .shared
            .close_listeners
            .write()
            .expect("close listener lock poisoned");
        listeners.retain(|(id, _)| *id != self.id);
    }
}

/// Cloneable, read-only handle over a [`SegmentStore`].
///
/// All read paths -- aggregate lookups, token walks, queries, validation --
/// live here so they can run concurrently with the single writer.
#[derive(Clone)]
pub struct StoreReader {
    shared: Arc<StoreShared>,
}

impl StoreReader {
    /// Context this store belongs to.
    pub fn context(&self) -> &str {
        &self.shared.context
    }

    /// The store's configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// The index manager of this store.
    pub fn index(&self) -> &IndexManager {
        &self.shared.index
    }

    /// Token the next append will receive.
    pub fn next_token(&self) -> u64 {
        self.shared.next_token.load(Ordering::Acquire)
    }

    /// Token of the oldest retained event, or `None` for an empty store.
    ///
    /// The chain is consulted coldest layer first: a cold tier that still
    /// holds segments answers before the completed layer, which answers
    /// before the active segment.
    pub fn first_token(&self) -> Option<u64> {
        let oldest = self.oldest_segment();
        (self.next_token() > oldest).then_some(oldest)
    }

    /// Token of the newest event, or `None` for an empty store.
    pub fn last_token(&self) -> Option<u64> {
        let next = self.next_token();
        (next > self.oldest_segment()).then(|| next - 1)
    }

    fn oldest_segment(&self) -> u64 {
        if let Some(oldest) = self.shared.completed.oldest_segment() {
            return oldest;
        }
        self.shared
            .active
            .read()
            .expect("active view lock poisoned")
            .segment
    }

    /// Returns `true` if any layer (active included) owns the segment.
    pub fn contains_segment(&self, segment: u64) -> bool {
        {
            let view = self.shared.active.read().expect("active view lock poisoned");
            if view.segment == segment {
                return true;
            }
        }
        let mut layer = Some(&self.shared.completed);
        while let Some(current) = layer {
            if current.contains_segment(segment) {
                return true;
            }
            layer = current.next.as_deref();
        }
        false
    }

    /// All segment ids, newest first, active segment included.
    pub fn segments_descending(&self) -> Vec<u64> {
        let mut segments = self.shared.completed.all_segments_descending();
        let view = self.shared.active.read().expect("active view lock poisoned");
        if !segments.contains(&view.segment) {
            segments.insert(0, view.segment);
        }
        segments
    }

    /// Greatest segment id at or below `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenBeforeStart`] when the token precedes every
    /// retained segment.
    pub fn get_segment_for(&self, token: u64) -> Result<u64, Error> {
        {
            let view = self.shared.active.read().expect("active view lock poisoned");
            if token >= view.segment {
                return Ok(view.segment);
            }
        }
        self.shared
            .completed
            .segment_for(token)
            .ok_or(Error::TokenBeforeStart { token })
    }

    /// Scoped read handle for a segment, from the hottest layer that owns it.
    pub fn event_source(&self, segment: u64) -> Option<EventSource> {
        {
            let view = self.shared.active.read().expect("active view lock poisoned");
            if view.segment == segment {
                return Some(view.source.clone());
            }
        }
        self.shared.completed.event_source(segment)
    }

    /// Forward event iterator over one segment starting at `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenBeforeStart`] when no layer owns the segment.
    pub fn events(&self, segment: u64, token: u64) -> Result<EventIterator, Error> {
        match self.event_source(segment) {
            Some(source) => Ok(source.event_iterator(token)),
            None => Err(Error::TokenBeforeStart { token }),
        }
    }

    /// Forward transaction iterator over one segment starting at `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentUnavailable`] when no layer owns the segment.
    pub fn transactions(
        &self,
        segment: u64,
        token: u64,
        validating: bool,
    ) -> Result<TransactionIterator, Error> {
        match self.event_source(segment) {
            Some(source) => Ok(source.transaction_iterator(token, validating)),
            None => Err(Error::SegmentUnavailable { segment }),
        }
    }

    /// Highest sequence number recorded for an aggregate.
    pub fn get_last_sequence_number(&self, aggregate: &str, hint: SearchHint) -> Option<u64> {
        let max_segments = match hint {
            SearchHint::Full => usize::MAX,
            SearchHint::RecentOnly => crate::index::RECENT_SEGMENTS,
        };
        self.shared
            .index
            .get_last_sequence_number(aggregate, max_segments, u64::MAX)
    }

    /// The newest event of an aggregate with sequence in
    /// `[min_sequence, max_sequence]`, if any.
    ///
    /// Snapshot stores use this to find the latest applicable snapshot.
    pub fn get_last_event(
        &self,
        aggregate: &str,
        min_sequence: u64,
        max_sequence: u64,
    ) -> Result<Option<Event>, Error> {
        let Some(found) = self.shared.index.last_index_entries(aggregate, max_sequence) else {
            return Ok(None);
        };
        let Some(source) = self.event_source(found.segment) else {
            return Ok(None);
        };
        for entry in found.entries.iter().rev() {
            let event = source.read_event(entry.position)?;
            if event.aggregate_sequence_number >= min_sequence
                && event.aggregate_sequence_number <= max_sequence
            {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Token of the first event with `timestamp >= instant`.
    ///
    /// Scans segments oldest-first comparing each segment's first-transaction
    /// timestamp; once a segment starts at or after the instant, the previous
    /// segment is scanned event by event. When no segment starts at or after
    /// the instant, the engine's first token is returned.
    pub fn get_token_at(&self, instant: i64) -> Option<u64> {
        let mut ascending = self.segments_descending();
        ascending.reverse();
        if ascending.is_empty() || self.first_token().is_none() {
            return None;
        }

        let mut boundary_index = None;
        for (i, &segment) in ascending.iter().enumerate() {
            let Some(first_ts) = self.first_timestamp_of(segment) else {
                continue;
            };
            if first_ts >= instant {
                boundary_index = Some(i);
                break;
            }
        }

        // Scan from the segment before the boundary: the instant may fall
        // inside it. When no segment starts at or after the instant, the
        // boundary can only lie inside the newest segment.
        let start = match boundary_index {
            Some(i) => i.saturating_sub(1),
            None => ascending.len() - 1,
        };
        for &segment in &ascending[start..] {
            if let Some(token) = self.scan_for_timestamp(segment, instant) {
                return Some(token);
            }
        }
        self.first_token()
    }

    fn first_timestamp_of(&self, segment: u64) -> Option<i64> {
        let source = self.event_source(segment)?;
        let mut iterator = source.transaction_iterator(segment, false);
        let transaction = iterator.next()?.ok()?;
        transaction.events.first().map(|e| e.timestamp)
    }

    fn scan_for_timestamp(&self, segment: u64, instant: i64) -> Option<u64> {
        let source = self.event_source(segment)?;
        for info in source.event_iterator(segment) {
            let info = info.ok()?;
            if info.event.timestamp >= instant {
                return Some(info.token);
            }
        }
        None
    }

    /// Scan events newest-segment-first, feeding each match to `predicate`.
    ///
    /// Stops descending when a segment shows that older segments cannot match
    /// (`min_token` above the segment start, or every timestamp in the
    /// segment below `min_timestamp`), and stops entirely when the predicate
    /// returns `false`.
    pub fn query(
        &self,
        options: QueryOptions,
        mut predicate: impl FnMut(EventWithToken) -> bool,
    ) -> Result<(), Error> {
        for segment in self.segments_descending() {
            if segment > options.max_token {
                continue;
            }
            let Some(source) = self.event_source(segment) else {
                continue;
            };
            let mut min_timestamp_in_segment = i64::MAX;
            for info in source.event_iterator(segment) {
                let info = info?;
                min_timestamp_in_segment = min_timestamp_in_segment.min(info.event.timestamp);
                if info.token > options.max_token {
                    break;
                }
                if info.token >= options.min_token
                    && info.event.timestamp >= options.min_timestamp
                    && !predicate(EventWithToken {
                        token: info.token,
                        event: info.event,
                    })
                {
                    return Ok(());
                }
            }
            if options.min_token > segment || min_timestamp_in_segment < options.min_timestamp {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Compare a replicated transaction against the locally stored one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReplicatedTransactionMismatch`] when the stored
    /// transaction at `token` is absent or differs from `expected_events`.
    pub fn validate_transaction(&self, token: u64, expected_events: &[Event]) -> Result<(), Error> {
        let segment = self
            .get_segment_for(token)
            .map_err(|_| Error::ReplicatedTransactionMismatch { token })?;
        let mut iterator = self.transactions(segment, token, false)?;
        match iterator.next() {
            Some(Ok(transaction)) if transaction.token == token => {
                if transaction.events.len() != expected_events.len()
                    || transaction
                        .events
                        .iter()
                        .zip(expected_events)
                        .any(|(stored, expected)| stored != expected)
                {
                    return Err(Error::ReplicatedTransactionMismatch { token });
                }
                Ok(())
            }
            Some(Ok(_)) | None => Err(Error::ReplicatedTransactionMismatch { token }),
            Some(Err(err)) => Err(err),
        }
    }

    /// Validate the newest `max_segments` segments: checksum every
    /// transaction and verify token continuity between adjacent segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationFailed`] naming the corrupt segment or the
    /// continuity gap.
    pub fn validate(&self, max_segments: usize) -> Result<(), Error> {
        let mut results: Vec<(u64, u64)> = Vec::new();
        for segment in self.segments_descending().into_iter().take(max_segments) {
            let mut last_token = segment;
            let mut iterator = self.transactions(segment, segment, true)?;
            for transaction in &mut iterator {
                let transaction = transaction.map_err(|err| {
                    Error::ValidationFailed(format!("segment {segment}: {err}"))
                })?;
                last_token = transaction.next_token();
            }
            results.push((segment, last_token));
        }

        results.sort_unstable_by_key(|(segment, _)| *segment);
        for pair in results.windows(2) {
            let (segment, last_token) = pair[0];
            let (next_segment, _) = pair[1];
            if last_token != next_segment {
                return Err(Error::ValidationFailed(format!(
                    "segment {segment} ends at token {}, next segment starts at token {next_segment}",
                    last_token.saturating_sub(1),
                )));
            }
        }
        Ok(())
    }

    /// Register a listener invoked exactly once when the store closes.
    ///
    /// Listeners must be idempotent and non-blocking; a panicking listener is
    /// logged and does not prevent shutdown.
    pub fn register_close_listener(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> ListenerRegistration {
        let id = self.shared.listener_sequence.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .shared
            .close_listeners
            .write()
            .expect("close listener lock poisoned");
        listeners.push((id, Arc::new(listener)));
        ListenerRegistration {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Returns `true` once the store has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StoreReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreReader")
            .field("context", &self.shared.context)
            .field("next_token", &self.next_token())
            .finish()
    }
}

/// Count the events of a sealed segment by walking its transactions.
fn count_events(source: &EventSource, segment: u64) -> Result<u64, Error> {
    let mut count = 0u64;
    for transaction in source.transaction_iterator(segment, false) {
        count += transaction?.events.len() as u64;
    }
    Ok(count)
}

/// Rebuild the index of one segment from a full transaction scan and persist
/// it atomically.
fn rebuild_index(index: &IndexManager, source: &EventSource, segment: u64) -> Result<(), Error> {
    let mut entries: HashMap<String, Vec<crate::types::IndexEntry>> = HashMap::new();
    for info in source.event_iterator(segment) {
        let info = info?;
        if info.event.is_domain_event() {
            entries
                .entry(info.event.aggregate_identifier.clone())
                .or_default()
                .push(crate::types::IndexEntry {
                    aggregate_sequence_number: info.event.aggregate_sequence_number,
                    position: info.position,
                    token: info.token,
                });
        }
    }
    index.activate_segment(segment);
    index.add_to_active_segment(segment, entries);
    index.complete(segment)?;
    Ok(())
}

/// Rename files with legacy suffixes (`.data`, `.idx`, `.bf`) in place.
fn rename_legacy_files(dir: &Path) -> Result<(), Error> {
    let renames = [
        (LEGACY_EVENTS_SUFFIX, EVENTS_SUFFIX),
        (LEGACY_INDEX_SUFFIX, INDEX_SUFFIX),
        (LEGACY_BLOOM_SUFFIX, BLOOM_SUFFIX),
    ];
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        for (legacy, current) in renames {
            if let Some(segment) = segment::parse_segment_file_name(name, legacy) {
                let target = dir.join(segment::segment_file_name(segment, current));
                tracing::info!(
                    from = %dir_entry.path().display(),
                    to = %target.display(),
                    "renaming legacy storage file"
                );
                fs::rename(dir_entry.path(), target)?;
            }
        }
    }
    Ok(())
}

/// Returns `true` if the file ends with the segment footer magic.
fn file_is_sealed(path: &Path) -> Result<bool, Error> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len < FILE_FOOTER_SIZE as u64 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-(FILE_FOOTER_SIZE as i64)))?;
    let mut tail = [0u8; FILE_FOOTER_SIZE];
    file.read_exact(&mut tail)?;
    Ok(u32::from_le_bytes(tail) == FILE_FOOTER_MAGIC)
}
