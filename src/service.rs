//! The narrow service boundary of the engine.
//!
//! `EventStoreService` is the surface a transport layer wraps: append events
//! and snapshots, replay aggregates (optionally snapshot-accelerated), tail
//! the global event stream with client-driven flow control, query by token
//! range, and resolve token bookkeeping. Everything else -- request framing,
//! authentication, replication, metrics export -- lives outside.
//!
//! Events and snapshots are held in sibling stores with identical machinery:
//! snapshots carry the aggregate sequence number of the event they replace,
//! so they skip sequence reservation but reuse segments, indices, and
//! streaming unchanged.

use std::sync::Arc;

use async_stream::try_stream;
use futures_core::Stream;
use tokio::sync::Semaphore;
use tokio_stream::StreamExt;

use crate::config::{SequenceValidationStrategy, StorageConfig};
use crate::error::Error;
use crate::reader::{events_per_aggregate, events_with_permits, TokenTransactionIterator};
use crate::store::{SegmentStore, StoreReader};
use crate::transaction::{spawn_store, TransactionManager};
use crate::types::{
    Event, EventWithToken, QueryOptions, SearchHint, TransactionWithToken, MAX_AGGREGATE_ID_LEN,
};

/// Bound of the writer-task request channel.
const APPEND_CHANNEL_CAPACITY: usize = 256;

/// One store with its writer task.
struct StoreGroup {
    manager: TransactionManager,
    reader: StoreReader,
    join: tokio::task::JoinHandle<()>,
}

impl StoreGroup {
    fn spawn(store: SegmentStore) -> StoreGroup {
        let (manager, reader, join) = spawn_store(store, APPEND_CHANNEL_CAPACITY);
        StoreGroup {
            manager,
            reader,
            join,
        }
    }
}

/// Engine facade for one context: an events store plus a snapshots store.
pub struct EventStoreService {
    events: StoreGroup,
    snapshots: StoreGroup,
    strategy: SequenceValidationStrategy,
}

impl EventStoreService {
    /// Open both stores of a context and spawn their writer tasks.
    ///
    /// Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Propagates recovery and validation failures from
    /// [`SegmentStore::open`].
    pub fn open(context: &str, config: &StorageConfig) -> Result<EventStoreService, Error> {
        let events = SegmentStore::open(context, &config.event_dir(context), config)?;
        let snapshots = SegmentStore::open(context, &config.snapshot_dir(context), config)?;
        Ok(EventStoreService {
            events: StoreGroup::spawn(events),
            snapshots: StoreGroup::spawn(snapshots),
            strategy: config.sequence_validation_strategy,
        })
    }

    /// Read handle over the events store.
    pub fn events_reader(&self) -> StoreReader {
        self.events.reader.clone()
    }

    /// Read handle over the snapshots store.
    pub fn snapshots_reader(&self) -> StoreReader {
        self.snapshots.reader.clone()
    }

    /// Transaction manager of the events store, for callers that split
    /// reservation from persistence (replication layers).
    pub fn transaction_manager(&self) -> TransactionManager {
        self.events.manager.clone()
    }

    /// Append a client stream of events as one transaction.
    ///
    /// The stream is drained completely before anything is persisted; the
    /// confirmation resolves with the first assigned token.
    pub async fn append_events(
        &self,
        events: impl Stream<Item = Event> + Unpin,
    ) -> Result<u64, Error> {
        let batch: Vec<Event> = events.collect().await;
        self.append_event_batch(batch).await
    }

    /// Append one batch of events as a single transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for an empty batch or an oversized
    ///   aggregate identifier.
    /// - [`Error::InvalidSequence`] when a declared sequence number does not
    ///   match the aggregate's next expected one.
    pub async fn append_event_batch(&self, batch: Vec<Event>) -> Result<u64, Error> {
        if batch.is_empty() {
            return Err(Error::InvalidArgument(
                "append requires at least one event".to_string(),
            ));
        }
        for event in &batch {
            validate_aggregate_id(event)?;
            if event.snapshot {
                return Err(Error::InvalidArgument(
                    "snapshots must be appended through append_snapshot".to_string(),
                ));
            }
        }
        self.events.manager.append(batch).await
    }

    /// Append an aggregate snapshot.
    ///
    /// The snapshot keeps the sequence number of the event it condenses, so
    /// no sequence reservation happens here.
    pub async fn append_snapshot(&self, mut snapshot: Event) -> Result<u64, Error> {
        if !snapshot.is_domain_event() {
            return Err(Error::InvalidArgument(
                "a snapshot must name its aggregate".to_string(),
            ));
        }
        validate_aggregate_id(&snapshot)?;
        snapshot.snapshot = true;
        self.snapshots.manager.store_batch(vec![snapshot]).await
    }

    /// Replay the events of an aggregate in sequence order.
    ///
    /// With `allow_snapshots`, the newest applicable snapshot is delivered
    /// first and the event replay starts right after its sequence number.
    /// The stream ends at `last_sequence` (exclusive). Outgoing sequence
    /// numbers are gap-checked per the configured validation strategy.
    pub fn list_aggregate_events(
        &self,
        aggregate: &str,
        first_sequence: u64,
        last_sequence: u64,
        allow_snapshots: bool,
    ) -> impl Stream<Item = Result<Event, Error>> {
        let events_reader = self.events.reader.clone();
        let snapshots_reader = self.snapshots.reader.clone();
        let strategy = self.strategy;
        let aggregate = aggregate.to_string();

        let stream = try_stream! {
            let mut start = first_sequence;
            if allow_snapshots {
                let max_sequence = last_sequence.saturating_sub(1);
                if let Some(snapshot) =
                    snapshots_reader.get_last_event(&aggregate, first_sequence, max_sequence)?
                {
                    start = snapshot.aggregate_sequence_number + 1;
                    yield snapshot;
                }
            }
            let replay =
                events_per_aggregate(events_reader, aggregate.clone(), start, last_sequence, 0);
            tokio::pin!(replay);
            while let Some(event) = replay.next().await {
                yield event?;
            }
        };
        validated_sequences(stream, strategy)
    }

    /// List the snapshots of an aggregate, newest first.
    ///
    /// Delivers snapshots with sequence numbers in
    /// `[first_sequence, max_sequence]`, at most `max_results` of them.
    pub fn list_aggregate_snapshots(
        &self,
        aggregate: &str,
        first_sequence: u64,
        max_sequence: u64,
        max_results: usize,
    ) -> impl Stream<Item = Result<Event, Error>> {
        let reader = self.snapshots.reader.clone();
        let aggregate = aggregate.to_string();

        try_stream! {
            let found = reader.index().lookup_aggregate(
                &aggregate,
                first_sequence,
                max_sequence.saturating_add(1),
                max_results,
                0,
            );
            let mut delivered = 0usize;
            for (segment, entries) in found.into_iter().rev() {
                let source = reader
                    .event_source(segment)
                    .ok_or(Error::SegmentUnavailable { segment })?;
                for entry in entries.iter().rev() {
                    if delivered >= max_results {
                        return;
                    }
                    yield source.read_event(entry.position)?;
                    delivered += 1;
                }
            }
        }
    }

    /// Token-ordered event stream with client-driven flow control.
    ///
    /// The caller grants demand through the returned semaphore (one permit
    /// per event); see [`events_with_permits`].
    pub fn list_events(
        &self,
        first_token: u64,
    ) -> (
        Arc<Semaphore>,
        impl Stream<Item = Result<EventWithToken, Error>>,
    ) {
        let permits = Arc::new(Semaphore::new(0));
        let stream = events_with_permits(
            self.events.reader.clone(),
            first_token,
            Arc::clone(&permits),
        );
        (permits, stream)
    }

    /// Forward transaction iterator over `[first_token, limit_token)`.
    pub fn transaction_iterator(
        &self,
        first_token: u64,
        limit_token: u64,
    ) -> Result<TokenTransactionIterator, Error> {
        TokenTransactionIterator::new(self.events.reader.clone(), first_token, limit_token)
    }

    /// Scan events by token range and timestamp, newest first.
    pub fn query_events(
        &self,
        options: QueryOptions,
        predicate: impl FnMut(EventWithToken) -> bool,
    ) -> Result<(), Error> {
        self.events.reader.query(options, predicate)
    }

    /// Highest sequence number stored for an aggregate.
    pub fn read_highest_sequence_number(&self, aggregate: &str) -> Option<u64> {
        self.events
            .reader
            .get_last_sequence_number(aggregate, SearchHint::Full)
    }

    /// Token of the oldest retained event.
    pub fn get_first_token(&self) -> Option<u64> {
        self.events.reader.first_token()
    }

    /// Token of the newest event.
    pub fn get_last_token(&self) -> Option<u64> {
        self.events.reader.last_token()
    }

    /// Token of the first event at or after `instant` (ms since epoch).
    pub fn get_token_at(&self, instant: i64) -> Option<u64> {
        self.events.reader.get_token_at(instant)
    }

    /// Compare a replicated transaction against local storage.
    pub fn validate_transaction(
        &self,
        token: u64,
        expected_events: &[Event],
    ) -> Result<(), Error> {
        self.events.reader.validate_transaction(token, expected_events)
    }

    /// The transaction stored at `token`, if any. Replication catch-up uses
    /// this to stream whole transactions to followers.
    pub fn transaction_at(&self, token: u64) -> Result<Option<TransactionWithToken>, Error> {
        let mut iterator = self.transaction_iterator(token, token.saturating_add(1))?;
        iterator.next().transpose()
    }

    /// Shut both stores down and wait for their writer tasks to finish.
    ///
    /// Close listeners fire exactly once per store.
    pub async fn shutdown(self) {
        let EventStoreService {
            events, snapshots, ..
        } = self;
        drop(events.manager);
        drop(events.reader);
        drop(snapshots.manager);
        drop(snapshots.reader);
        if events.join.await.is_err() {
            tracing::warn!("events writer task panicked during shutdown");
        }
        if snapshots.join.await.is_err() {
            tracing::warn!("snapshots writer task panicked during shutdown");
        }
    }
}

fn validate_aggregate_id(event: &Event) -> Result<(), Error> {
    if event.aggregate_identifier.len() > MAX_AGGREGATE_ID_LEN {
        return Err(Error::InvalidArgument(format!(
            "aggregate identifier exceeds {MAX_AGGREGATE_ID_LEN} bytes"
        )));
    }
    Ok(())
}

/// Gap-check an outgoing aggregate stream per the configured strategy.
///
/// `Log` warns and keeps streaming, `Fail` terminates the stream with
/// [`Error::InvalidSequence`], `Off` passes events through untouched.
fn validated_sequences(
    stream: impl Stream<Item = Result<Event, Error>>,
    strategy: SequenceValidationStrategy,
) -> impl Stream<Item = Result<Event, Error>> {
    try_stream! {
        let mut previous: Option<u64> = None;
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            let event = event?;
            if let Some(previous_sequence) = previous {
                let expected = previous_sequence + 1;
                let got = event.aggregate_sequence_number;
                if got != expected {
                    match strategy {
                        SequenceValidationStrategy::Off => {}
                        SequenceValidationStrategy::Log => {
                            tracing::warn!(
                                aggregate = %event.aggregate_identifier,
                                expected,
                                got,
                                "sequence gap in outgoing aggregate stream"
                            );
                        }
                        SequenceValidationStrategy::Fail => {
                            Err(Error::InvalidSequence {
                                aggregate: event.aggregate_identifier.clone(),
                                expected,
                                got,
                            })?;
                        }
                    }
                }
            }
            previous = Some(event.aggregate_sequence_number);
            yield event;
        }
    }
}
