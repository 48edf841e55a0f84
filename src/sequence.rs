//! Sequence-number reservation for concurrent appenders.
//!
//! Before a batch is handed to the writer, the sequence numbers it declares
//! are validated and claimed here. The cache maps each aggregate to the next
//! expected sequence number, falling back to an engine lookup for aggregates
//! it has not seen (or has evicted). Claims are made atomically for a whole
//! batch: either every aggregate's range is reserved or nothing is.
//!
//! A [`SequenceReservation`] keeps the claim alive. Dropping it without
//! [`commit`](SequenceReservation::commit) rolls the claimed ranges back, so
//! an aborted append (replication quorum lost, persistence error) leaves no
//! hole in any aggregate's sequence.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::Error;
use crate::types::Event;

/// Engine callback resolving the last stored sequence number of an aggregate.
pub type SequenceLoader = Box<dyn Fn(&str) -> Option<u64> + Send + Sync>;

/// Attempts to re-warm the cache when entries are evicted mid-reservation.
const RESERVE_ATTEMPTS: usize = 3;

/// One claimed sequence range for one aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Claim {
    aggregate: String,
    /// Next expected sequence before the claim.
    start: u64,
    /// Next expected sequence after the claim.
    end: u64,
}

/// Process-wide cache of next expected sequence numbers.
///
/// Shared by every appender; mutation happens under one short-lived lock so
/// concurrent reservations for the same aggregate are serialized. Entries
/// beyond the configured capacity are evicted least-recently-used; a later
/// reservation for an evicted aggregate re-reads from the engine.
pub struct SequenceNumberCache {
    entries: Mutex<LruCache<String, u64>>,
    loader: SequenceLoader,
}

impl SequenceNumberCache {
    /// Create a cache holding at most `capacity` aggregates.
    pub fn new(capacity: usize, loader: SequenceLoader) -> SequenceNumberCache {
        SequenceNumberCache {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity"),
            )),
            loader,
        }
    }

    /// Validate and claim the sequence ranges declared by a batch.
    ///
    /// Every domain event must carry the exact next sequence number of its
    /// aggregate; the first mismatch fails the whole call and nothing is
    /// reserved. Non-domain events (empty aggregate identifier) are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSequence`] on the first mismatching event.
    pub fn reserve(self: &Arc<Self>, events: &[Event]) -> Result<SequenceReservation, Error> {
        let mut last_error = None;
        for _ in 0..RESERVE_ATTEMPTS {
            // Warm the cache for unseen aggregates; the engine lookup must
            // not run under the cache lock.
            for event in events.iter().filter(|e| e.is_domain_event()) {
                let aggregate = &event.aggregate_identifier;
                let cached = {
                    let mut entries = self.entries.lock().expect("sequence cache lock poisoned");
                    entries.get(aggregate).is_some()
                };
                if !cached {
                    let next = (self.loader)(aggregate).map(|seq| seq + 1).unwrap_or(0);
                    let mut entries = self.entries.lock().expect("sequence cache lock poisoned");
                    if entries.peek(aggregate).is_none() {
                        entries.put(aggregate.clone(), next);
                    }
                }
            }

            match self.try_claim(events) {
                Ok(Some(claims)) => {
                    return Ok(SequenceReservation {
                        cache: Arc::clone(self),
                        claims,
                        committed: false,
                    });
                }
                // An aggregate was evicted between warming and claiming;
                // retry the warm-up.
                Ok(None) => continue,
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::InvalidArgument(
                "sequence cache thrashing: batch touches more aggregates than the cache holds"
                    .to_string(),
            )
        }))
    }

    /// Validate the batch and apply claims under a single lock acquisition.
    ///
    /// Returns `Ok(None)` when a required entry was evicted before the lock
    /// was taken (the caller re-warms and retries).
    fn try_claim(&self, events: &[Event]) -> Result<Option<Vec<Claim>>, Error> {
        let mut entries = self.entries.lock().expect("sequence cache lock poisoned");
        let mut plan: HashMap<&str, (u64, u64)> = HashMap::new();

        for event in events.iter().filter(|e| e.is_domain_event()) {
            let aggregate = event.aggregate_identifier.as_str();
            let expected = match plan.get(aggregate) {
                Some(&(_, next)) => next,
                None => match entries.get(aggregate) {
                    Some(&next) => next,
                    None => return Ok(None),
                },
            };
            if event.aggregate_sequence_number != expected {
                return Err(Error::InvalidSequence {
                    aggregate: aggregate.to_string(),
                    expected,
                    got: event.aggregate_sequence_number,
                });
            }
            plan.entry(aggregate)
                .and_modify(|(_, next)| *next += 1)
                .or_insert((expected, expected + 1));
        }

        let mut claims = Vec::with_capacity(plan.len());
        for (aggregate, (start, end)) in plan {
            entries.put(aggregate.to_string(), end);
            claims.push(Claim {
                aggregate: aggregate.to_string(),
                start,
                end,
            });
        }
        Ok(Some(claims))
    }

    fn rollback(&self, claims: &[Claim]) {
        let mut entries = self.entries.lock().expect("sequence cache lock poisoned");
        for claim in claims {
            // Only undo a claim that is still the newest one; a concurrent
            // writer that advanced past us keeps its progress.
            if entries.peek(&claim.aggregate) == Some(&claim.end) {
                entries.put(claim.aggregate.clone(), claim.start);
            }
        }
    }

    /// Drop every cached entry. Registered as the engine's close listener.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("sequence cache lock poisoned")
            .clear();
    }

    /// Next expected sequence for an aggregate, if cached. Test hook.
    #[cfg(test)]
    fn peek(&self, aggregate: &str) -> Option<u64> {
        self.entries
            .lock()
            .expect("sequence cache lock poisoned")
            .peek(aggregate)
            .copied()
    }
}

/// A live claim on sequence-number ranges.
///
/// Dropping the reservation without committing rolls the claim back; after
/// [`commit`](Self::commit) the cache advance is permanent.
#[must_use = "dropping a reservation without commit rolls the claim back"]
pub struct SequenceReservation {
    cache: Arc<SequenceNumberCache>,
    claims: Vec<Claim>,
    committed: bool,
}

impl std::fmt::Debug for SequenceReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceReservation")
            .field("claims", &self.claims)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl SequenceReservation {
    /// Make the claimed ranges permanent.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SequenceReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.cache.rollback(&self.claims);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_event(aggregate: &str, seq: u64) -> Event {
        Event {
            aggregate_identifier: aggregate.to_string(),
            aggregate_type: "Order".to_string(),
            aggregate_sequence_number: seq,
            ..Event::default()
        }
    }

    fn cache_with_loader(
        capacity: usize,
        loader: impl Fn(&str) -> Option<u64> + Send + Sync + 'static,
    ) -> Arc<SequenceNumberCache> {
        Arc::new(SequenceNumberCache::new(capacity, Box::new(loader)))
    }

    #[test]
    fn fresh_aggregate_starts_at_zero() {
        let cache = cache_with_loader(16, |_| None);
        let reservation = cache
            .reserve(&[domain_event("a1", 0), domain_event("a1", 1)])
            .expect("reserve");
        reservation.commit();
        assert_eq!(cache.peek("a1"), Some(2));
    }

    #[test]
    fn loader_supplies_last_stored_sequence() {
        let cache = cache_with_loader(16, |aggregate| (aggregate == "a1").then_some(4));
        let reservation = cache.reserve(&[domain_event("a1", 5)]).expect("reserve");
        reservation.commit();
        assert_eq!(cache.peek("a1"), Some(6));
    }

    #[test]
    fn sequence_mismatch_reserves_nothing() {
        let cache = cache_with_loader(16, |_| Some(4));
        let err = cache
            .reserve(&[domain_event("a1", 10), domain_event("a2", 5)])
            .unwrap_err();
        match err {
            Error::InvalidSequence {
                aggregate,
                expected,
                got,
            } => {
                assert_eq!(aggregate, "a1");
                assert_eq!(expected, 5);
                assert_eq!(got, 10);
            }
            other => panic!("expected InvalidSequence, got: {other:?}"),
        }
        // The failed call must not advance either aggregate.
        assert_eq!(cache.peek("a1"), Some(5));
        assert_eq!(cache.peek("a2"), Some(5));
    }

    #[test]
    fn gap_inside_batch_is_rejected() {
        let cache = cache_with_loader(16, |_| None);
        let err = cache
            .reserve(&[domain_event("a1", 0), domain_event("a1", 2)])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidSequence {
                expected: 1,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn dropped_reservation_rolls_back() {
        let cache = cache_with_loader(16, |_| None);
        {
            let _reservation = cache
                .reserve(&[domain_event("a1", 0), domain_event("a1", 1)])
                .expect("reserve");
            // While held, the claim is visible to other reservations.
            assert_eq!(cache.peek("a1"), Some(2));
        }
        assert_eq!(cache.peek("a1"), Some(0));

        // A follow-up reservation starts from the rolled-back value.
        let reservation = cache.reserve(&[domain_event("a1", 0)]).expect("reserve");
        reservation.commit();
        assert_eq!(cache.peek("a1"), Some(1));
    }

    #[test]
    fn concurrent_reservation_sees_live_claim() {
        let cache = cache_with_loader(16, |_| None);
        let held = cache
            .reserve(&[domain_event("a1", 0), domain_event("a1", 1)])
            .expect("reserve");

        // A second appender declaring the same range is rejected while the
        // first claim is alive.
        let err = cache.reserve(&[domain_event("a1", 0)]).unwrap_err();
        assert!(matches!(err, Error::InvalidSequence { expected: 2, .. }));

        // Declaring the range after the claim succeeds.
        let next = cache.reserve(&[domain_event("a1", 2)]).expect("reserve");
        next.commit();
        held.commit();
        assert_eq!(cache.peek("a1"), Some(3));
    }

    #[test]
    fn eviction_forces_engine_reread() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let loads = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&loads);
        let cache = cache_with_loader(1, move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
            None
        });

        cache.reserve(&[domain_event("a1", 0)]).expect("a1").commit();
        // Capacity 1: reserving a2 evicts a1.
        cache.reserve(&[domain_event("a2", 0)]).expect("a2").commit();
        assert_eq!(cache.peek("a1"), None);

        let before = loads.load(Ordering::SeqCst);
        // a1 was evicted, so its next reservation goes through the loader,
        // which knows nothing stored -- sequence 1 is now wrong.
        let err = cache.reserve(&[domain_event("a1", 1)]).unwrap_err();
        assert!(matches!(err, Error::InvalidSequence { expected: 0, .. }));
        assert!(loads.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn clear_drops_all_entries() {
        let cache = cache_with_loader(16, |_| None);
        cache.reserve(&[domain_event("a1", 0)]).expect("reserve").commit();
        cache.clear();
        assert_eq!(cache.peek("a1"), None);
    }

    #[test]
    fn non_domain_events_do_not_reserve() {
        let cache = cache_with_loader(16, |_| None);
        let reservation = cache
            .reserve(&[Event::default(), domain_event("a1", 0)])
            .expect("reserve");
        reservation.commit();
        assert_eq!(cache.peek("a1"), Some(1));
        assert_eq!(cache.peek(""), None);
    }
}
