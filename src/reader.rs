//! Streaming read paths: aggregate replay, token-range tailing, permit-gated
//! event streams.
//!
//! All streams here are pull-based. The aggregate replay stream resolves its
//! index entries once, then reads events in bounded chunks with at most
//! [`PREFETCH_SEGMENT_FILES`] segment files open at a time; the token-range
//! iterator walks transactions segment by segment; the permit-gated stream
//! translates client flow-control grants into demand. Dropping any of them
//! releases the underlying [`EventSource`] handles within one prefetch
//! window.

use std::sync::Arc;

use async_stream::try_stream;
use futures_core::Stream;
use metrics::histogram;
use tokio::sync::Semaphore;

use crate::error::Error;
use crate::segment::TransactionIterator;
use crate::store::StoreReader;
use crate::types::{Event, EventWithToken, IndexEntry, TransactionWithToken};

/// Maximum number of segment files an aggregate replay keeps open at once:
/// the segment being drained plus one opened ahead.
pub const PREFETCH_SEGMENT_FILES: usize = 2;

/// Lazily replay the events of one aggregate in sequence order.
///
/// Index entries are resolved once, up front. Segments are then visited in
/// ascending order; while one segment drains, the next one's source is
/// already open. Within a segment, up to `events_per_segment_prefetch`
/// events are read ahead of consumer demand.
///
/// Events below `first_sequence` are skipped even if the index returned
/// them; the stream ends at the first event reaching `last_sequence`.
pub fn events_per_aggregate(
    reader: StoreReader,
    aggregate: String,
    first_sequence: u64,
    last_sequence: u64,
    min_token: u64,
) -> impl Stream<Item = Result<Event, Error>> {
    let prefetch = reader.config().events_per_segment_prefetch.max(1);
    try_stream! {
        tracing::debug!(%aggregate, "reading index entries for aggregate");
        let positions = reader.index().lookup_aggregate(
            &aggregate,
            first_sequence,
            last_sequence,
            usize::MAX,
            min_token,
        );
        histogram!("eventcask_aggregate_segments").record(positions.len() as f64);

        // Ascending segment order: BTreeMap iteration.
        let segments: Vec<(u64, Vec<IndexEntry>)> = positions.into_iter().collect();

        let mut lookahead = None;
        for (i, (segment, entries)) in segments.iter().enumerate() {
            let source = match lookahead.take() {
                Some(source) => source,
                None => reader.event_source(*segment),
            };
            let source = source.ok_or(Error::SegmentUnavailable { segment: *segment })?;
            // Open the next segment before draining this one.
            if let Some((next_segment, _)) = segments.get(i + 1) {
                lookahead = Some(reader.event_source(*next_segment));
            }

            for chunk in entries.chunks(prefetch) {
                let mut batch = Vec::with_capacity(chunk.len());
                for entry in chunk {
                    batch.push(source.read_event(entry.position)?);
                }
                for event in batch {
                    // Guard against index entries below the requested range.
                    if event.aggregate_sequence_number < first_sequence {
                        continue;
                    }
                    if event.aggregate_sequence_number >= last_sequence {
                        return;
                    }
                    yield event;
                }
            }
        }
    }
}

/// Finite, forward, single-reader iterator over transactions in a token range.
///
/// Starts at the segment owning `first_token`, drains it, then advances to
/// the segment whose first token equals the running token, until
/// `limit_token` is reached or the store has no further transactions. The
/// iterator is a scoped resource: dropping it releases the current segment's
/// source.
pub struct TokenTransactionIterator {
    reader: StoreReader,
    limit_token: u64,
    current_token: u64,
    inner: Option<TransactionIterator>,
}

impl TokenTransactionIterator {
    /// Open an iterator over `[first_token, limit_token)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenBeforeStart`] when `first_token` precedes every
    /// retained segment.
    pub fn new(
        reader: StoreReader,
        first_token: u64,
        limit_token: u64,
    ) -> Result<TokenTransactionIterator, Error> {
        let inner = if first_token < limit_token && first_token < reader.next_token() {
            let segment = reader.get_segment_for(first_token)?;
            Some(reader.transactions(segment, first_token, false)?)
        } else {
            None
        };
        Ok(TokenTransactionIterator {
            reader,
            limit_token,
            current_token: first_token,
            inner,
        })
    }

    /// Token of the next transaction to be delivered.
    pub fn current_token(&self) -> u64 {
        self.current_token
    }

    fn advance_segment(&mut self) -> Result<bool, Error> {
        if self.current_token >= self.limit_token
            || self.current_token >= self.reader.next_token()
        {
            self.inner = None;
            return Ok(false);
        }
        let segment = self.reader.get_segment_for(self.current_token)?;
        self.inner = Some(
            self.reader
                .transactions(segment, self.current_token, false)?,
        );
        Ok(true)
    }
}

impl Iterator for TokenTransactionIterator {
    type Item = Result<TransactionWithToken, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_token >= self.limit_token {
                self.inner = None;
                return None;
            }
            let inner = self.inner.as_mut()?;
            match inner.next() {
                Some(Ok(transaction)) => {
                    self.current_token = transaction.next_token();
                    return Some(Ok(transaction));
                }
                Some(Err(err)) => {
                    self.inner = None;
                    return Some(Err(err));
                }
                None => match self.advance_segment() {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(err) => {
                        self.inner = None;
                        return Some(Err(err));
                    }
                },
            }
        }
    }
}

/// Token-ordered event stream with client-driven flow control.
///
/// One event is delivered per permit; the consumer grants demand with
/// [`Semaphore::add_permits`]. The stream serves tokens from `first_token`
/// up to the last token durable at call time, then ends. Closing the
/// semaphore (or dropping the stream) stops delivery immediately.
pub fn events_with_permits(
    reader: StoreReader,
    first_token: u64,
    permits: Arc<Semaphore>,
) -> impl Stream<Item = Result<EventWithToken, Error>> {
    try_stream! {
        let limit_token = reader.next_token();
        let mut transactions = TokenTransactionIterator::new(reader, first_token, limit_token)?;
        while let Some(transaction) = transactions.next() {
            let transaction = transaction?;
            let mut token = transaction.token;
            for event in transaction.events {
                if token >= first_token && token < limit_token {
                    match permits.acquire().await {
                        Ok(permit) => permit.forget(),
                        // Semaphore closed: the consumer is gone.
                        Err(_) => return,
                    }
                    yield EventWithToken { token, event };
                }
                token += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::store::SegmentStore;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::path::Path;

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

    /// Open a store with tiny segments so tests cross segment boundaries.
    fn open_store(root: &Path) -> SegmentStore {
        let config = StorageConfig {
            storage_root: root.to_path_buf(),
            max_segment_size: 2 * 1024,
            events_per_segment_prefetch: 4,
            ..StorageConfig::default()
        };
        SegmentStore::open("default", &config.event_dir("default"), &config)
            .expect("open store")
    }

    #[tokio::test]
    async fn aggregate_replay_is_gap_free_across_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for seq in 0..40 {
            store
                .append_batch(&[sample_event("a1", seq)])
                .expect("append");
        }
        let reader = store.reader();
        assert!(
            reader.segments_descending().len() > 1,
            "test requires multiple segments"
        );

        let stream = events_per_aggregate(reader, "a1".to_string(), 0, u64::MAX, 0);
        let events: Vec<Event> = stream.map(|r| r.expect("event")).collect().await;
        let sequences: Vec<u64> = events.iter().map(|e| e.aggregate_sequence_number).collect();
        assert_eq!(sequences, (0..40).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn aggregate_replay_honors_sequence_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for seq in 0..10 {
            store
                .append_batch(&[sample_event("a1", seq)])
                .expect("append");
        }

        let stream = events_per_aggregate(store.reader(), "a1".to_string(), 3, 7, 0);
        let sequences: Vec<u64> = stream
            .map(|r| r.expect("event").aggregate_sequence_number)
            .collect()
            .await;
        assert_eq!(sequences, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn aggregate_replay_of_unknown_aggregate_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        store.append_batch(&[sample_event("a1", 0)]).expect("append");

        let stream = events_per_aggregate(store.reader(), "ghost".to_string(), 0, u64::MAX, 0);
        assert_eq!(stream.count().await, 0);
    }

    #[tokio::test]
    async fn token_iterator_crosses_segment_boundaries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for seq in 0..40 {
            store
                .append_batch(&[sample_event("a1", seq)])
                .expect("append");
        }
        let reader = store.reader();
        let segments = reader.segments_descending();
        assert!(segments.len() > 1);
        let boundary = segments[segments.len() - 2];

        // Start one token before a boundary and run a few tokens past it.
        let iterator =
            TokenTransactionIterator::new(reader, boundary - 1, boundary + 3).expect("iterator");
        let tokens: Vec<u64> = iterator.map(|r| r.expect("transaction").token).collect();
        assert_eq!(
            tokens,
            vec![boundary - 1, boundary, boundary + 1, boundary + 2]
        );
    }

    #[tokio::test]
    async fn token_iterator_limit_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for seq in 0..5 {
            store
                .append_batch(&[sample_event("a1", seq)])
                .expect("append");
        }

        let iterator = TokenTransactionIterator::new(store.reader(), 0, 3).expect("iterator");
        let tokens: Vec<u64> = iterator.map(|r| r.expect("transaction").token).collect();
        assert_eq!(tokens, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn token_iterator_ends_at_store_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for seq in 0..3 {
            store
                .append_batch(&[sample_event("a1", seq)])
                .expect("append");
        }

        let iterator =
            TokenTransactionIterator::new(store.reader(), 0, u64::MAX).expect("iterator");
        assert_eq!(iterator.count(), 3);
    }

    #[tokio::test]
    async fn permit_stream_delivers_exactly_granted_demand() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(dir.path());
        for seq in 0..10 {
            store
                .append_batch(&[sample_event("a1", seq)])
                .expect("append");
        }

        let permits = Arc::new(Semaphore::new(0));
        let stream = events_with_permits(store.reader(), 2, Arc::clone(&permits));
        futures::pin_mut!(stream);

        permits.add_permits(3);
        for expected_token in 2..5 {
            let delivered = stream.next().await.expect("event").expect("ok");
            assert_eq!(delivered.token, expected_token);
        }

        // No further demand: the stream must be pending, not ended.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            stream.next(),
        )
        .await;
        assert!(pending.is_err(), "stream delivered without demand");

        // Granting more demand resumes delivery; closing the semaphore ends
        // the stream.
        permits.add_permits(1);
        let delivered = stream.next().await.expect("event").expect("ok");
        assert_eq!(delivered.token, 5);
        permits.close();
        assert!(stream.next().await.is_none());
    }
}
