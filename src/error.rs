//! Error types for eventcask.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. A transport layer wrapping the engine maps
//! these variants to its wire error codes.

/// Unified error type for all eventcask operations.
///
/// Each variant represents a distinct failure mode:
///
/// - `InvalidSequence` -- rejected at reservation time, before any disk I/O.
/// - `SegmentUnavailable` / `TokenBeforeStart` -- terminal read errors after
///   the whole layer chain has been consulted.
/// - `DataFileRead` -- I/O or corruption at the file level; the read path
///   falls through to the next layer before surfacing this.
/// - `ValidationFailed` -- startup continuity or checksum violation; the
///   store refuses to open.
/// - `ReplicatedTransactionMismatch` -- replicated content differs from local
///   content at the same token.
/// - `AppendCancelled` -- producer cancelled before the append completed; the
///   events may still have been durably written.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Per-aggregate sequence number mismatch at reservation time.
    #[error(
        "invalid sequence number for aggregate {aggregate}: expected {expected}, got {got}"
    )]
    InvalidSequence {
        /// Aggregate whose sequence check failed.
        aggregate: String,
        /// The next sequence number the store expects for this aggregate.
        expected: u64,
        /// The sequence number the batch declared.
        got: u64,
    },

    /// No layer in the chain is responsible for the requested segment.
    #[error("segment {segment} is not available in any layer")]
    SegmentUnavailable {
        /// Segment id that could not be resolved.
        segment: u64,
    },

    /// The requested token precedes the first retained token of the store.
    #[error("token {token} before start of event store")]
    TokenBeforeStart {
        /// The requested token.
        token: u64,
    },

    /// I/O failure or corruption while reading a data file.
    #[error("data file read error in segment {segment}: {detail}")]
    DataFileRead {
        /// Segment the failure occurred in.
        segment: u64,
        /// Human-readable description of the failure.
        detail: String,
    },

    /// Startup validation found a broken segment chain or a corrupt segment.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A replicated transaction does not match the locally stored one.
    #[error("replicated transaction {token} does not match stored transaction")]
    ReplicatedTransactionMismatch {
        /// Token of the mismatching transaction.
        token: u64,
    },

    /// The append was cancelled before its completion was observed.
    ///
    /// The events may still have been durably written; idempotent replay is
    /// the caller's responsibility.
    #[error("append cancelled before completion")]
    AppendCancelled,

    /// An I/O error occurred during a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A request argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Shorthand for a [`Error::DataFileRead`] with a formatted detail message.
    pub(crate) fn data_file(segment: u64, detail: impl Into<String>) -> Error {
        Error::DataFileRead {
            segment,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sequence_display_names_aggregate_and_values() {
        let err = Error::InvalidSequence {
            aggregate: "order-1".into(),
            expected: 5,
            got: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("order-1"), "expected aggregate in: {msg}");
        assert!(msg.contains('5'), "expected '5' in: {msg}");
        assert!(msg.contains("10"), "expected '10' in: {msg}");
    }

    #[test]
    fn io_error_question_mark_coercion() {
        fn fallible() -> Result<(), Error> {
            let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
            Err(io_err)?
        }

        let result = fallible();
        assert!(matches!(result.unwrap_err(), Error::Io(_)));
    }

    #[test]
    fn data_file_shorthand_formats_segment() {
        let err = Error::data_file(400, "bad checksum");
        let msg = err.to_string();
        assert!(msg.contains("400"), "expected segment in: {msg}");
        assert!(msg.contains("bad checksum"), "expected detail in: {msg}");
    }

    #[test]
    fn token_before_start_display() {
        let msg = Error::TokenBeforeStart { token: 7 }.to_string();
        assert!(msg.contains('7'), "expected token in: {msg}");
        assert!(msg.contains("before start"), "unexpected message: {msg}");
    }

    #[test]
    fn all_variants_debug_non_empty() {
        let variants: Vec<Error> = vec![
            Error::InvalidSequence {
                aggregate: "a".into(),
                expected: 0,
                got: 1,
            },
            Error::SegmentUnavailable { segment: 0 },
            Error::TokenBeforeStart { token: 0 },
            Error::data_file(0, "detail"),
            Error::ValidationFailed("gap".into()),
            Error::ReplicatedTransactionMismatch { token: 100 },
            Error::AppendCancelled,
            Error::Io(std::io::Error::other("test")),
            Error::InvalidArgument("empty".into()),
        ];

        for (i, variant) in variants.iter().enumerate() {
            assert!(
                !format!("{variant:?}").is_empty(),
                "variant {i} produced empty Debug output"
            );
        }
    }
}
