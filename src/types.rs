//! Core domain types for eventcask.
//!
//! This module defines the foundational data types that every other module depends on:
//! events (domain events and snapshots), token-annotated wrappers used by the read path,
//! index entries, query options, and size limit constants.

use bytes::Bytes;

/// Maximum encoded size of a single transaction in bytes.
///
/// A transaction must fit in one segment together with the file header and
/// footer, and its length field is a `u32`. Batches exceeding this limit are
/// rejected on append.
pub const MAX_TRANSACTION_SIZE: usize = u32::MAX as usize - 16;

/// Maximum length of an aggregate identifier in bytes.
///
/// Aggregate identifiers are UTF-8 strings naming the domain entity an event
/// belongs to (e.g., `"order-7f3a"`). An empty identifier marks an event that
/// is not a domain event and is excluded from aggregate indices.
pub const MAX_AGGREGATE_ID_LEN: usize = 256;

/// An immutable event record, either a domain event or a snapshot.
///
/// Events are appended in batches (transactions) and receive a global token
/// from their position in the store. The token is not a field of the event:
/// it is implied by storage order and carried separately where needed
/// ([`EventWithToken`]).
///
/// # Fields
///
/// * `aggregate_identifier` - Identifier of the owning aggregate. Empty means
///   "not a domain event"; such events are stored but never indexed.
/// * `aggregate_type` - Type tag of the owning aggregate.
/// * `aggregate_sequence_number` - Zero-based, gap-free sequence within the
///   aggregate, across all segments.
/// * `timestamp` - Milliseconds since the Unix epoch, assigned by the producer.
/// * `payload_type` - Type tag of the payload.
/// * `payload_revision` - Revision tag of the payload schema.
/// * `payload` - Opaque payload bytes.
/// * `meta_data` - Opaque metadata bytes.
/// * `snapshot` - `true` if this event is an aggregate snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    /// Identifier of the owning aggregate; empty for non-domain events.
    pub aggregate_identifier: String,
    /// Type tag of the owning aggregate.
    pub aggregate_type: String,
    /// Zero-based, gap-free sequence number within the aggregate.
    pub aggregate_sequence_number: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Type tag of the payload.
    pub payload_type: String,
    /// Revision tag of the payload schema.
    pub payload_revision: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Opaque metadata bytes.
    pub meta_data: Bytes,
    /// `true` if this event is an aggregate snapshot.
    pub snapshot: bool,
}

impl Event {
    /// Returns `true` if this event belongs to an aggregate.
    ///
    /// Non-domain events (empty `aggregate_identifier`) are stored and
    /// replayable by token, but never appear in aggregate indices and do not
    /// consume sequence numbers.
    pub fn is_domain_event(&self) -> bool {
        !self.aggregate_identifier.is_empty()
    }
}

/// An event paired with its global token, as delivered by token-ordered reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWithToken {
    /// Global token of the event.
    pub token: u64,
    /// The event itself.
    pub event: Event,
}

/// A persisted transaction read back from a segment, with its first token.
///
/// The events of a transaction occupy the dense token range
/// `[token, token + events.len())`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionWithToken {
    /// Token of the first event in the transaction.
    pub token: u64,
    /// On-disk transaction format version.
    pub version: u8,
    /// The events persisted by this transaction, in token order.
    pub events: Vec<Event>,
}

impl TransactionWithToken {
    /// Token of the first event after this transaction.
    pub fn next_token(&self) -> u64 {
        self.token + self.events.len() as u64
    }
}

/// One aggregate index entry: enough to retrieve a single event from a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Aggregate sequence number of the event.
    pub aggregate_sequence_number: u64,
    /// Byte offset of the event record within its segment file.
    pub position: u32,
    /// Global token of the event.
    pub token: u64,
}

/// Index entries for one aggregate within one segment, paired with the segment id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIndexEntries {
    /// Segment id (token of the segment's first event).
    pub segment: u64,
    /// Entries for the aggregate in that segment, ordered by sequence number.
    pub entries: Vec<IndexEntry>,
}

/// Options for token-range queries over the store.
///
/// `query` scans newest-first and stops descending once a segment can no
/// longer contain matches (all tokens below `min_token`, or every timestamp
/// in the segment below `min_timestamp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Smallest token to deliver.
    pub min_token: u64,
    /// Largest token to deliver.
    pub max_token: u64,
    /// Smallest event timestamp to deliver (ms since epoch).
    pub min_timestamp: i64,
}

/// Hint for last-sequence-number lookups.
///
/// `RecentOnly` caps the newest-first segment walk at a small constant, for
/// callers that know the aggregate was touched recently (e.g. sequence
/// reservation for a hot aggregate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchHint {
    /// Walk every segment if needed.
    Full,
    /// Cap the walk at [`RECENT_SEGMENTS`](crate::index::RECENT_SEGMENTS) segments.
    RecentOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_event_requires_aggregate_identifier() {
        let mut event = Event {
            aggregate_identifier: "order-1".to_string(),
            aggregate_type: "Order".to_string(),
            ..Event::default()
        };
        assert!(event.is_domain_event());

        event.aggregate_identifier.clear();
        assert!(!event.is_domain_event());
    }

    #[test]
    fn event_clone_is_equal() {
        let event = Event {
            aggregate_identifier: "order-1".to_string(),
            aggregate_type: "Order".to_string(),
            aggregate_sequence_number: 3,
            timestamp: 1_700_000_000_000,
            payload_type: "OrderPlaced".to_string(),
            payload_revision: "1.0".to_string(),
            payload: Bytes::from_static(b"{\"qty\":1}"),
            meta_data: Bytes::from_static(b"corr-123"),
            snapshot: false,
        };
        assert_eq!(event, event.clone());
    }

    #[test]
    fn transaction_next_token_counts_events() {
        let transaction = TransactionWithToken {
            token: 10,
            version: 2,
            events: vec![Event::default(), Event::default(), Event::default()],
        };
        assert_eq!(transaction.next_token(), 13);
    }

    #[test]
    fn events_with_different_sequence_are_not_equal() {
        let event_a = Event {
            aggregate_identifier: "a".to_string(),
            aggregate_sequence_number: 0,
            ..Event::default()
        };
        let event_b = Event {
            aggregate_sequence_number: 1,
            ..event_a.clone()
        };
        assert_ne!(event_a, event_b);
    }
}
