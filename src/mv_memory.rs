use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::utils::CachePadded;

use crate::mv_data::{MvData, ReadResult};
use crate::mv_iterator::MvIterator;
use crate::storage::MultiStore;
use crate::{
    bytes_beyond, diff_ordered_list, IteratorDescriptor, Key, MultiReadSet, MultiWriteSet,
    ReadOrigin, StoreId, TxnIndex, TxnVersion,
};

// Shared memory of the block execution: one multi-version structure per
// store, plus the latest read set and written locations of every
// transaction. The per-transaction slots are single-writer (the
// executing worker) and multi-reader (validators), hence atomic
// pointers to immutable values.
pub(crate) struct MvMemory {
    stores: Vec<MvData>,
    // Per transaction, the ordered key lists (one per store) its latest
    // execution wrote. Swapped wholesale, never torn.
    last_written_locations: Vec<CachePadded<ArcSwap<Vec<Vec<Key>>>>>,
    last_read_set: Vec<CachePadded<ArcSwapOption<MultiReadSet>>>,
}

impl MvMemory {
    pub(crate) fn new(block_size: usize, num_stores: usize) -> Self {
        Self {
            stores: (0..num_stores).map(|_| MvData::new()).collect(),
            last_written_locations: (0..block_size)
                .map(|_| CachePadded::new(ArcSwap::from_pointee(vec![Vec::new(); num_stores])))
                .collect(),
            last_read_set: (0..block_size)
                .map(|_| CachePadded::new(ArcSwapOption::empty()))
                .collect(),
        }
    }

    pub(crate) fn data(&self, store: StoreId) -> &MvData {
        &self.stores[store]
    }

    pub(crate) fn read(&self, store: StoreId, key: &[u8], txn: TxnIndex) -> ReadResult {
        self.stores[store].read(key, txn)
    }

    // Apply the read & write sets of a finished execution. Returns
    // whether a write occurred to a key the previous incarnation of the
    // same transaction did not write to, which decides whether the
    // executed higher transactions require a validation restart.
    pub(crate) fn record(
        &self,
        version: TxnVersion,
        read_set: MultiReadSet,
        write_set: MultiWriteSet,
    ) -> bool {
        let mut new_locations = Vec::with_capacity(self.stores.len());
        for (store, writes) in write_set.into_iter().enumerate() {
            let mut locations = Vec::with_capacity(writes.len());
            for (key, value) in writes {
                self.stores[store].write(&key, value, version);
                locations.push(key);
            }
            new_locations.push(locations);
        }

        let wrote_new_location = self.update_written_locations(version.index, new_locations);
        self.last_read_set[version.index].store(Some(Arc::new(read_set)));
        wrote_new_location
    }

    // RCU swap of the per-transaction written-location lists. Keys the
    // new incarnation no longer writes lose their multi-version entry,
    // so stale values (or leftover estimates) cannot be observed.
    fn update_written_locations(&self, txn: TxnIndex, new_locations: Vec<Vec<Key>>) -> bool {
        let prev_locations = self.last_written_locations[txn].load_full();

        let mut wrote_new_location = false;
        for (store, (prev, new)) in prev_locations.iter().zip(new_locations.iter()).enumerate() {
            diff_ordered_list(prev, new, |key, is_new| {
                if is_new {
                    wrote_new_location = true;
                } else {
                    self.stores[store].delete(key, txn);
                }
            });
        }

        self.last_written_locations[txn].store(Arc::new(new_locations));
        wrote_new_location
    }

    // Replace the write set of an aborted incarnation with ESTIMATE
    // markers, so that higher transactions wait for the re-execution
    // instead of reading stale values.
    pub(crate) fn convert_writes_to_estimates(&self, txn: TxnIndex) {
        let locations = self.last_written_locations[txn].load_full();
        for (store, keys) in locations.iter().enumerate() {
            for key in keys {
                self.stores[store].write_estimate(key, txn);
            }
        }
    }

    // Re-resolve every read the transaction's latest execution recorded
    // and check it still observes the same origin. A slow validator may
    // load a read set recorded by a later incarnation; that is benign,
    // since the validated incarnation is then already aborted and
    // `try_validation_abort` refuses a second abort of it.
    pub(crate) fn validate_read_set(&self, txn: TxnIndex) -> bool {
        let read_set = self.last_read_set[txn]
            .load_full()
            .expect("read set is recorded before validation");
        for (store, reads) in read_set.iter().enumerate() {
            for desc in &reads.reads {
                match self.stores[store].read(&desc.key, txn) {
                    ReadResult::Estimate { .. } => return false,
                    ReadResult::NotFound => {
                        if desc.origin != ReadOrigin::Storage {
                            // previously read an entry, now gone
                            return false;
                        }
                    }
                    ReadResult::Data { version, .. } => {
                        if desc.origin != ReadOrigin::MvMemory(version) {
                            return false;
                        }
                    }
                }
            }
            for desc in &reads.iterators {
                if !self.validate_iterator(store, txn, desc) {
                    return false;
                }
            }
        }
        true
    }

    // Replay a recorded range scan against the live multi-version data
    // only (no base store, no overlay, no waiting), stopping at the
    // recorded stop key. The resolved sequence must match the recorded
    // one exactly and must not run into an ESTIMATE.
    fn validate_iterator(&self, store: StoreId, txn: TxnIndex, desc: &IteratorDescriptor) -> bool {
        let mut iter = MvIterator::new(
            self.stores[store].key_tree(),
            desc.opts.clone(),
            txn,
            None,
        );
        let mut observed = 0;
        while iter.valid() {
            if desc
                .stop
                .as_ref()
                .is_some_and(|stop| bytes_beyond(iter.key(), stop, desc.opts.ascending))
            {
                break;
            }
            let Some(recorded) = desc.reads.get(observed) else {
                return false;
            };
            if recorded.key != iter.key()
                || recorded.origin != ReadOrigin::MvMemory(iter.version())
            {
                return false;
            }
            observed += 1;
            iter.next();
        }
        !iter.read_estimate() && observed == desc.reads.len()
    }

    // Write the per-key latest values into the base stores; tombstones
    // become deletions.
    pub(crate) fn write_snapshot<S: MultiStore + ?Sized>(&self, storage: &mut S) {
        for (id, data) in self.stores.iter().enumerate() {
            let store = storage.store_mut(id);
            data.snapshot_scan(|key, value| match value {
                Some(value) => store.set(key.clone(), value.clone()),
                None => store.delete(key),
            });
        }
    }
}
