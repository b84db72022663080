use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;

use crate::mv_data::ReadResult;
use crate::mv_iterator::MvIterator;
use crate::mv_memory::MvMemory;
use crate::scheduler::Scheduler;
use crate::storage::{range_bounds, range_is_degenerate, KVStore, MultiStore, StoreIterator};
use crate::{
    bytes_beyond, IteratorDescriptor, IteratorOptions, Key, MultiReadSet, MultiWriteSet,
    ReadDescriptor, ReadOrigin, ReadSet, StoreId, TxnIndex, Value, WriteSet,
};

// A per-transaction layer over one store that intercepts every access:
// reads resolve overlay -> multi-version data -> base storage and are
// recorded for validation, writes stay buffered in the overlay until
// the execution finishes and is recorded wholesale.
struct StoreView<'a> {
    store: StoreId,
    storage: &'a dyn KVStore,
    mv: &'a MvMemory,
    scheduler: &'a Scheduler,
    txn: TxnIndex,
    read_set: RefCell<ReadSet>,
    write_set: RefCell<WriteSet>,
}

impl<'a> StoreView<'a> {
    fn get(&self, key: &[u8]) -> Option<Value> {
        if let Some(value) = self.write_set.borrow().get(key) {
            // written by this transaction; None means deleted
            return value.clone();
        }

        loop {
            match self.mv.read(self.store, key, self.txn) {
                ReadResult::Estimate { blocking_txn } => {
                    // an in-flight write of a lower transaction; wait
                    // for it to finish and resolve the key again
                    self.scheduler.wait_for_dependency(self.txn, blocking_txn);
                    if self.scheduler.halted() {
                        // nothing will be committed; satisfy the read
                        // from base storage so the executor can unwind
                        return self.storage.get(key);
                    }
                }
                ReadResult::NotFound => {
                    self.read_set.borrow_mut().reads.push(ReadDescriptor {
                        key: key.to_vec(),
                        origin: ReadOrigin::Storage,
                    });
                    return self.storage.get(key);
                }
                ReadResult::Data { version, value } => {
                    self.read_set.borrow_mut().reads.push(ReadDescriptor {
                        key: key.to_vec(),
                        origin: ReadOrigin::MvMemory(version),
                    });
                    return value;
                }
            }
        }
    }

    fn set(&self, key: Key, value: Value) {
        self.write_set.borrow_mut().insert(key, Some(value));
    }

    fn delete(&self, key: Key) {
        self.write_set.borrow_mut().insert(key, None);
    }
}

/// Transactional view handed to the transaction body: one overlay per
/// store, layered over the multi-version writes of lower transactions
/// and the base storage.
pub struct MultiStoreView<'a> {
    views: Vec<StoreView<'a>>,
}

impl<'a> MultiStoreView<'a> {
    pub(crate) fn new<S: MultiStore + ?Sized>(
        num_stores: usize,
        storage: &'a S,
        mv: &'a MvMemory,
        scheduler: &'a Scheduler,
        txn: TxnIndex,
    ) -> Self {
        Self {
            views: (0..num_stores)
                .map(|store| StoreView {
                    store,
                    storage: storage.store(store),
                    mv,
                    scheduler,
                    txn,
                    read_set: RefCell::default(),
                    write_set: RefCell::default(),
                })
                .collect(),
        }
    }

    /// Index of the transaction this view belongs to.
    pub fn txn(&self) -> TxnIndex {
        self.views.first().map_or(0, |view| view.txn)
    }

    /// Point read: this transaction's own writes, then the latest write
    /// of a lower transaction, then base storage.
    pub fn get(&self, store: StoreId, key: &[u8]) -> Option<Value> {
        self.views[store].get(key)
    }

    /// Whether the key currently exists for this transaction.
    pub fn has(&self, store: StoreId, key: &[u8]) -> bool {
        self.get(store, key).is_some()
    }

    /// Buffers a write, visible to subsequent reads of this transaction.
    pub fn set(&self, store: StoreId, key: Key, value: Value) {
        self.views[store].set(key, value);
    }

    /// Buffers a deletion.
    pub fn delete(&self, store: StoreId, key: Key) {
        self.views[store].delete(key);
    }

    /// Ascending merged iterator over the half-open range `[start, end)`.
    pub fn iterator(
        &self,
        store: StoreId,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> ViewIterator<'_> {
        ViewIterator::new(
            &self.views[store],
            IteratorOptions {
                start: start.map(<[u8]>::to_vec),
                end: end.map(<[u8]>::to_vec),
                ascending: true,
            },
        )
    }

    /// Descending merged iterator over the same half-open range.
    pub fn reverse_iterator(
        &self,
        store: StoreId,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> ViewIterator<'_> {
        ViewIterator::new(
            &self.views[store],
            IteratorOptions {
                start: start.map(<[u8]>::to_vec),
                end: end.map(<[u8]>::to_vec),
                ascending: false,
            },
        )
    }

    pub(crate) fn into_result(self) -> (MultiReadSet, MultiWriteSet) {
        self.views
            .into_iter()
            .map(|view| (view.read_set.into_inner(), view.write_set.into_inner()))
            .unzip()
    }
}

impl fmt::Debug for MultiStoreView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiStoreView")
            .field("txn", &self.txn())
            .field("stores", &self.views.len())
            .finish_non_exhaustive()
    }
}

// The merge machinery below is direction-aware: `cache` shadows
// `parent` on equal keys, and a `None` value anywhere is a deletion
// that the top-level iterator skips.
trait RawIterator {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> Option<&[u8]>;
    fn advance(&mut self);
}

struct BaseIterator<'a> {
    inner: Box<dyn StoreIterator + 'a>,
}

impl RawIterator for BaseIterator<'_> {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> Option<&[u8]> {
        Some(self.inner.value())
    }

    fn advance(&mut self) {
        self.inner.next();
    }
}

impl RawIterator for MvIterator<'_> {
    fn valid(&self) -> bool {
        MvIterator::valid(self)
    }

    fn key(&self) -> &[u8] {
        MvIterator::key(self)
    }

    fn value(&self) -> Option<&[u8]> {
        MvIterator::value(self)
    }

    fn advance(&mut self) {
        self.next();
    }
}

// Snapshot of the transaction's own writes in range, in iteration
// order. The write set is tiny compared to the data below it, and a
// snapshot keeps the view usable while the iterator is alive.
struct OverlayIterator {
    entries: Vec<(Key, Option<Value>)>,
    position: usize,
}

impl OverlayIterator {
    fn new(write_set: &WriteSet, opts: &IteratorOptions) -> Self {
        let start = opts.start.as_deref();
        let end = opts.end.as_deref();
        let mut entries: Vec<(Key, Option<Value>)> = if range_is_degenerate(start, end) {
            Vec::new()
        } else {
            write_set
                .range::<[u8], _>(range_bounds(start, end))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        if !opts.ascending {
            entries.reverse();
        }
        Self {
            entries,
            position: 0,
        }
    }
}

impl RawIterator for OverlayIterator {
    fn valid(&self) -> bool {
        self.position < self.entries.len()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.position].0
    }

    fn value(&self) -> Option<&[u8]> {
        self.entries[self.position].1.as_deref()
    }

    fn advance(&mut self) {
        self.position += 1;
    }
}

enum Side {
    Parent,
    Cache,
    Both,
}

struct MergeIterator<P, C> {
    parent: P,
    cache: C,
    ascending: bool,
}

impl<P: RawIterator, C: RawIterator> MergeIterator<P, C> {
    fn new(parent: P, cache: C, ascending: bool) -> Self {
        Self {
            parent,
            cache,
            ascending,
        }
    }

    fn selection(&self) -> Side {
        match (self.parent.valid(), self.cache.valid()) {
            (true, false) => Side::Parent,
            (false, _) => Side::Cache,
            (true, true) => {
                let order = self.parent.key().cmp(self.cache.key());
                let order = if self.ascending { order } else { order.reverse() };
                match order {
                    Ordering::Less => Side::Parent,
                    Ordering::Equal => Side::Both,
                    Ordering::Greater => Side::Cache,
                }
            }
        }
    }
}

impl<P: RawIterator, C: RawIterator> RawIterator for MergeIterator<P, C> {
    fn valid(&self) -> bool {
        self.parent.valid() || self.cache.valid()
    }

    fn key(&self) -> &[u8] {
        match self.selection() {
            Side::Parent => self.parent.key(),
            Side::Cache | Side::Both => self.cache.key(),
        }
    }

    fn value(&self) -> Option<&[u8]> {
        match self.selection() {
            Side::Parent => self.parent.value(),
            Side::Cache | Side::Both => self.cache.value(),
        }
    }

    fn advance(&mut self) {
        match self.selection() {
            Side::Parent => self.parent.advance(),
            Side::Cache => self.cache.advance(),
            Side::Both => {
                self.parent.advance();
                self.cache.advance();
            }
        }
    }
}

type MergedSides<'a> = MergeIterator<MergeIterator<BaseIterator<'a>, MvIterator<'a>>, OverlayIterator>;

/// Three-way merged range iterator observed by one transaction: its own
/// write set over the multi-version writes of lower transactions over
/// the base store. Deleted keys are skipped. Dropping the iterator
/// installs the recorded scan into the transaction's read set for
/// later validation.
pub struct ViewIterator<'a> {
    view: &'a StoreView<'a>,
    opts: IteratorOptions,
    merged: MergedSides<'a>,
}

impl<'a> ViewIterator<'a> {
    fn new(view: &'a StoreView<'a>, opts: IteratorOptions) -> Self {
        let start = opts.start.as_deref();
        let end = opts.end.as_deref();

        let base = BaseIterator {
            inner: if opts.ascending {
                view.storage.iterator(start, end)
            } else {
                view.storage.reverse_iterator(start, end)
            },
        };

        let scheduler = view.scheduler;
        let txn = view.txn;
        let mv = MvIterator::new(
            view.mv.data(view.store).key_tree(),
            opts.clone(),
            txn,
            Some(Box::new(move |blocking_txn| {
                scheduler.wait_for_dependency(txn, blocking_txn);
                !scheduler.halted()
            })),
        );

        let overlay = OverlayIterator::new(&view.write_set.borrow(), &opts);

        let mut iter = Self {
            view,
            merged: MergeIterator::new(
                MergeIterator::new(base, mv, opts.ascending),
                overlay,
                opts.ascending,
            ),
            opts,
        };
        iter.settle();
        iter
    }

    // Skip positions whose winning entry is a deletion.
    fn settle(&mut self) {
        while self.merged.valid() && self.merged.value().is_none() {
            self.merged.advance();
        }
    }

    /// Whether the iterator currently points at an entry.
    pub fn valid(&self) -> bool {
        self.merged.valid()
    }

    /// Key of the current entry.
    pub fn key(&self) -> &[u8] {
        self.merged.key()
    }

    /// Value of the current entry.
    pub fn value(&self) -> &[u8] {
        self.merged.value().expect("iterator is valid")
    }

    /// Advances to the next visible entry.
    pub fn next(&mut self) {
        self.merged.advance();
        self.settle();
    }
}

impl Drop for ViewIterator<'_> {
    // Install the recorded scan. When the caller stopped early, the
    // first unconsumed key becomes the stop marker and resolved reads
    // past it are discarded, so that validation replays exactly the
    // observed prefix.
    fn drop(&mut self) {
        let stop = if self.merged.valid() {
            Some(self.merged.key().to_vec())
        } else {
            None
        };

        let mut reads = self.merged.parent.cache.take_reads();
        if let Some(stop_key) = &stop {
            while reads
                .last()
                .is_some_and(|read| bytes_beyond(&read.key, stop_key, self.opts.ascending))
            {
                reads.pop();
            }
        }

        self.view.read_set.borrow_mut().iterators.push(IteratorDescriptor {
            opts: std::mem::take(&mut self.opts),
            stop,
            reads,
        });
    }
}

impl fmt::Debug for ViewIterator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewIterator")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}
