use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use im::OrdMap;
use parking_lot::Mutex;

use crate::{Incarnation, Key, TxnIndex, TxnVersion, Value};

#[derive(Clone, Debug)]
pub(crate) enum MemoryEntry {
    // A value written by a transaction incarnation. `None` is a
    // deletion tombstone: lower readers observe the key as absent while
    // the entry still shadows the base storage.
    Data(Incarnation, Option<Value>),
    // For each transaction, Block-STM treats the write set of an
    // aborted incarnation as an estimation of the write set of the next
    // one. When an incarnation is aborted due to a validation failure,
    // the entries corresponding to its write set are replaced with this
    // special ESTIMATE marker. A transaction that reads an ESTIMATE
    // written by a lower transaction waits for that dependency to
    // re-execute instead of wasting a speculative execution that is
    // likely to abort. The markers that the next incarnation does not
    // overwrite are removed when its write set is recorded.
    Estimate,
}

// Per-key secondary tree: transaction index to the entry that
// transaction currently owns. Usually touched by the single owning
// transaction, with occasional concurrent readers, hence a plain mutex.
pub(crate) type SecondaryTree = Mutex<BTreeMap<TxnIndex, MemoryEntry>>;

// The outer key tree. An immutable ordered map behind an atomic
// pointer: readers load the root once and see a frozen snapshot;
// writers clone the spine and install the new root with a CAS.
pub(crate) type KeyTree = OrdMap<Key, Arc<SecondaryTree>>;

pub(crate) enum ReadResult {
    NotFound,
    Estimate { blocking_txn: TxnIndex },
    Data { version: TxnVersion, value: Option<Value> },
}

// Multi-version data for a single store: every transactional write is
// addressable as `(key, txn) -> entry`, and a read by transaction T
// resolves to the entry of the highest transaction below T.
pub(crate) struct MvData {
    tree: ArcSwap<KeyTree>,
}

impl MvData {
    pub(crate) fn new() -> Self {
        Self {
            tree: ArcSwap::from_pointee(OrdMap::new()),
        }
    }

    // One consistent snapshot of the outer key tree, e.g. for range
    // iteration. Keys inserted after the load are not observed; the
    // entries inside the secondary trees stay live.
    pub(crate) fn key_tree(&self) -> Arc<KeyTree> {
        self.tree.load_full()
    }

    // The secondary tree for `key`, created on first touch. Outer keys
    // are never removed for the lifetime of the block.
    fn secondary(&self, key: &[u8]) -> Arc<SecondaryTree> {
        loop {
            let current = self.tree.load_full();
            if let Some(tree) = current.get(key) {
                return tree.clone();
            }
            let fresh = Arc::new(SecondaryTree::default());
            let mut next = (*current).clone();
            next.insert(key.to_vec(), fresh.clone());
            let previous = self.tree.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return fresh;
            }
        }
    }

    pub(crate) fn write(&self, key: &[u8], value: Option<Value>, version: TxnVersion) {
        self.secondary(key)
            .lock()
            .insert(version.index, MemoryEntry::Data(version.incarnation, value));
    }

    pub(crate) fn write_estimate(&self, key: &[u8], txn: TxnIndex) {
        self.secondary(key).lock().insert(txn, MemoryEntry::Estimate);
    }

    pub(crate) fn delete(&self, key: &[u8], txn: TxnIndex) {
        if let Some(tree) = self.tree.load().get(key) {
            tree.lock().remove(&txn);
        }
    }

    // Resolve a read of `key` by transaction `txn`: the entry of the
    // highest transaction strictly below `txn`, the ESTIMATE marker
    // blocking it, or nothing when no lower transaction wrote the key
    // (the caller then completes the read from base storage).
    pub(crate) fn read(&self, key: &[u8], txn: TxnIndex) -> ReadResult {
        if txn == 0 {
            return ReadResult::NotFound;
        }
        let root = self.tree.load();
        match root.get(key) {
            None => ReadResult::NotFound,
            Some(tree) => closest_below(tree, txn),
        }
    }

    // Emits `(key, latest value)` in key order across all keys, where
    // "latest" is the entry of the highest transaction. Tombstones are
    // emitted as `None` so the snapshot writer can delete on the base
    // store. Estimates cannot remain once the block completed; skip
    // them if observed.
    pub(crate) fn snapshot_scan(&self, mut visit: impl FnMut(&Key, Option<&Value>)) {
        let root = self.tree.load();
        for (key, tree) in root.iter() {
            let guard = tree.lock();
            match guard.iter().next_back() {
                None | Some((_, MemoryEntry::Estimate)) => continue,
                Some((_, MemoryEntry::Data(_, value))) => visit(key, value.as_ref()),
            }
        }
    }
}

// Seek the entry of the largest transaction index strictly below `txn`.
pub(crate) fn closest_below(tree: &SecondaryTree, txn: TxnIndex) -> ReadResult {
    let guard = tree.lock();
    match guard.range(..txn).next_back() {
        None => ReadResult::NotFound,
        Some((index, MemoryEntry::Estimate)) => ReadResult::Estimate {
            blocking_txn: *index,
        },
        Some((index, MemoryEntry::Data(incarnation, value))) => ReadResult::Data {
            version: TxnVersion {
                index: *index,
                incarnation: *incarnation,
            },
            value: value.clone(),
        },
    }
}
