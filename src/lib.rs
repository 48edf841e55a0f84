//! eventcask: a segmented event store engine for event-sourcing platforms.
//!
//! Clients append domain events and snapshots, replay them forward from a
//! global monotonic token, and look up the full history of one aggregate.
//! Storage is a stack of immutable, append-only segment files (active,
//! completed, cold) with per-segment aggregate indices and Bloom filters, so
//! aggregate replay touches only the segments that contain hits.

pub mod active;
pub mod bloom;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod reader;
pub mod segment;
pub mod sequence;
pub mod service;
pub mod store;
pub mod transaction;
pub mod types;

pub use codec::DecodeOutcome;
pub use config::{SequenceValidationStrategy, StorageConfig};
pub use error::Error;
pub use index::IndexManager;
pub use reader::{events_per_aggregate, events_with_permits, TokenTransactionIterator};
pub use segment::{EventInformation, EventIterator, EventSource, TransactionIterator};
pub use sequence::{SequenceNumberCache, SequenceReservation};
pub use service::EventStoreService;
pub use store::{SegmentStore, StoreReader};
pub use transaction::{spawn_store, TransactionManager};
pub use types::{
    Event, EventWithToken, IndexEntry, QueryOptions, SearchHint, SegmentIndexEntries,
    TransactionWithToken,
};
