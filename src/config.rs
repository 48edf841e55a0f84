//! Storage configuration for eventcask.
//!
//! `StorageConfig` collects every knob the engine consults at runtime. It is a plain
//! struct threaded through constructors -- there is no global configuration registry.

use std::path::PathBuf;

/// Default pre-allocated size of a segment file (256 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

/// How aggressively outgoing aggregate event streams check for sequence gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceValidationStrategy {
    /// Log a warning when a gap is observed, keep streaming.
    #[default]
    Log,
    /// Terminate the stream with an error when a gap is observed.
    Fail,
    /// Do not check.
    Off,
}

/// Configuration for one event store context.
///
/// # Fields
///
/// * `storage_root` - Root directory; each context stores its segments under
///   `storage_root/<context>/...`.
/// * `max_segment_size` - Pre-allocated size of the active segment file. A
///   transaction that does not fit triggers rollover.
/// * `events_per_segment_prefetch` - How many events the aggregate replay
///   stream reads ahead within one segment.
/// * `validation_segments` - How many of the newest segments startup
///   validation scans for checksum and continuity violations.
/// * `sequence_validation_strategy` - Gap checking on outgoing aggregate
///   streams.
/// * `index_bloom_fpp` - Target false-positive rate of per-segment Bloom
///   filters.
/// * `sequence_cache_capacity` - Number of aggregates the sequence-number
///   cache tracks before evicting least-recently-used entries.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Root directory for all contexts.
    pub storage_root: PathBuf,
    /// Pre-allocated size of the active segment file in bytes.
    pub max_segment_size: u64,
    /// Events read ahead per segment by the aggregate replay stream.
    pub events_per_segment_prefetch: usize,
    /// Newest segments scanned by startup validation.
    pub validation_segments: usize,
    /// Gap checking on outgoing aggregate streams.
    pub sequence_validation_strategy: SequenceValidationStrategy,
    /// Target false-positive rate of per-segment Bloom filters.
    pub index_bloom_fpp: f64,
    /// Aggregates tracked by the sequence-number cache.
    pub sequence_cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            events_per_segment_prefetch: 50,
            validation_segments: 10,
            sequence_validation_strategy: SequenceValidationStrategy::Log,
            index_bloom_fpp: 0.03,
            sequence_cache_capacity: 100_000,
        }
    }
}

impl StorageConfig {
    /// Directory holding the event segments of a context.
    pub fn event_dir(&self, context: &str) -> PathBuf {
        self.storage_root.join(context).join("events")
    }

    /// Directory holding the snapshot segments of a context.
    pub fn snapshot_dir(&self, context: &str) -> PathBuf {
        self.storage_root.join(context).join("snapshots")
    }
}
