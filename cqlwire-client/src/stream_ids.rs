//! Stream id allocation.

use cqlwire_protocol::{ProtocolVersion, StreamId};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const BUCKET_BITS: usize = 64;

/// A fixed pool of request stream ids.
///
/// Ids live in `[1, max_streams)` for the negotiated version; id 0 is kept
/// back for administrative traffic and is never handed out. Allocation is
/// lock-free: each id is one bit in a bucket of `AtomicU64`s, and
/// successive searches start from a rotating bucket so that freshly released
/// ids are not immediately reused.
#[derive(Debug)]
pub struct StreamIds {
    buckets: Box<[AtomicU64]>,
    num_streams: usize,
    offset: AtomicUsize,
    in_use: AtomicUsize,
}

impl StreamIds {
    pub fn new(version: ProtocolVersion) -> Self {
        Self::with_capacity(version.max_streams())
    }

    fn with_capacity(num_streams: usize) -> Self {
        let buckets: Box<[AtomicU64]> = (0..num_streams.div_ceil(BUCKET_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();
        // Reserve id 0.
        buckets[0].store(1, Ordering::Relaxed);
        Self {
            buckets,
            num_streams,
            offset: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Takes a free id, or `None` when every id is in use.
    pub fn allocate(&self) -> Option<StreamId> {
        let count = self.buckets.len();
        let start = self.offset.fetch_add(1, Ordering::Relaxed) % count;

        for i in 0..count {
            let index = (start + i) % count;
            let bucket = &self.buckets[index];
            let mut current = bucket.load(Ordering::Acquire);
            while current != u64::MAX {
                let bit = (!current).trailing_zeros() as usize;
                match bucket.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.in_use.fetch_add(1, Ordering::Relaxed);
                        return Some((index * BUCKET_BITS + bit) as StreamId);
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    /// Returns `id` to the pool.
    ///
    /// Returns `false` if the id was not allocated, so releasing twice is harmless.
    pub fn release(&self, id: StreamId) -> bool {
        if id <= 0 || id as usize >= self.num_streams {
            return false;
        }
        let id = id as usize;
        let mask = 1u64 << (id % BUCKET_BITS);
        let previous = self.buckets[id / BUCKET_BITS].fetch_and(!mask, Ordering::AcqRel);
        if previous & mask == 0 {
            return false;
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Returns whether `id` is currently allocated.
    pub fn is_allocated(&self, id: StreamId) -> bool {
        if id <= 0 || id as usize >= self.num_streams {
            return false;
        }
        let id = id as usize;
        self.buckets[id / BUCKET_BITS].load(Ordering::Acquire) & (1 << (id % BUCKET_BITS)) != 0
    }

    /// Number of ids that can still be allocated.
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Total number of allocatable ids.
    pub fn capacity(&self) -> usize {
        self.num_streams - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_capacity_per_version() {
        assert_eq!(StreamIds::new(ProtocolVersion::V1).capacity(), 127);
        assert_eq!(StreamIds::new(ProtocolVersion::V2).available(), 127);
        assert_eq!(StreamIds::new(ProtocolVersion::V3).capacity(), 32767);
        assert_eq!(StreamIds::new(ProtocolVersion::V5).available(), 32767);
    }

    #[test]
    fn test_exhaustion_never_yields_zero() {
        let ids = StreamIds::new(ProtocolVersion::V2);
        let mut seen = HashSet::new();
        while let Some(id) = ids.allocate() {
            assert!(id > 0 && id < 128, "id {id} out of range");
            assert!(seen.insert(id), "id {id} allocated twice");
        }
        assert_eq!(seen.len(), 127);
        assert_eq!(ids.available(), 0);
        assert!(ids.allocate().is_none());

        assert!(ids.release(42));
        assert_eq!(ids.allocate(), Some(42));
    }

    #[test]
    fn test_release_is_idempotent() {
        let ids = StreamIds::new(ProtocolVersion::V4);
        let id = ids.allocate().unwrap();
        assert!(ids.is_allocated(id));
        assert_eq!(ids.in_use(), 1);

        assert!(ids.release(id));
        assert!(!ids.release(id));
        assert!(!ids.is_allocated(id));
        assert_eq!(ids.in_use(), 0);
        assert_eq!(ids.available(), 32767);
    }

    #[test]
    fn test_release_reserved_and_out_of_range() {
        let ids = StreamIds::new(ProtocolVersion::V2);
        assert!(!ids.release(0));
        assert!(!ids.release(-1));
        assert!(!ids.release(128));
        assert!(!ids.release(i16::MAX));
        assert_eq!(ids.available(), 127);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = Arc::new(StreamIds::new(ProtocolVersion::V4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    for _ in 0..1000 {
                        if let Some(id) = ids.allocate() {
                            mine.push(id);
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "id {id} allocated twice");
            }
        }
        assert_eq!(all.len(), 8000);
        assert_eq!(ids.in_use(), 8000);
    }

    proptest! {
        #[test]
        fn allocated_ids_are_never_shared(ops in prop::collection::vec(any::<Option<u8>>(), 0..400)) {
            let ids = StreamIds::new(ProtocolVersion::V2);
            let mut held: Vec<StreamId> = Vec::new();

            for op in ops {
                match op {
                    None => {
                        if let Some(id) = ids.allocate() {
                            prop_assert!(!held.contains(&id));
                            held.push(id);
                        } else {
                            prop_assert_eq!(held.len(), 127);
                        }
                    }
                    Some(n) if !held.is_empty() => {
                        let id = held.swap_remove(n as usize % held.len());
                        prop_assert!(ids.release(id));
                    }
                    Some(_) => {}
                }
                prop_assert_eq!(ids.in_use(), held.len());
            }
        }
    }
}
