//! Parallel optimistic execution of ordered transaction blocks over a
//! multi-store byte key-value state (Block-STM).
//!
//! A block of transactions is executed speculatively across worker
//! threads and committed with results indistinguishable from running
//! the transactions one by one in block order. Writes land in an
//! in-memory multi-version structure during execution; the base stores
//! are only touched once at the end, when the winning value per key is
//! written back as a snapshot.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The index of the transaction in the block.
pub type TxnIndex = usize;

/// The i-th time a transaction is re-executed, counting from 0.
pub type Incarnation = usize;

/// Dense identifier of a store inside the multi-store, in `0..num_stores`.
pub type StoreId = usize;

/// Raw key bytes; ordering is lexicographic.
pub type Key = Vec<u8>;

/// Raw value bytes.
pub type Value = Vec<u8>;

// Block-STM maintains an in-memory multi-version data structure that
// stores for each key the latest value written per transaction, along
// with the associated transaction version. When a transaction reads a
// key, it obtains the value written by the highest transaction that
// appears before it in the block, along with that version. For
// instance, tx5 would read the value written by tx3 even when tx6 has
// also written to it. If no lower transaction has written to the key,
// the value is read from the base storage state before block execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TxnVersion {
    pub(crate) index: TxnIndex,
    pub(crate) incarnation: Incarnation,
}

// The origin of a read: either the multi-version data structure (the
// closest lower transaction that wrote the key) or the base storage
// state from before block execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ReadOrigin {
    MvMemory(TxnVersion),
    Storage,
}

// A single recorded point read: the key and the origin observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReadDescriptor {
    pub(crate) key: Key,
    pub(crate) origin: ReadOrigin,
}

// Range-scan parameters. The range is half-open `[start, end)` with
// `None` meaning unbounded; `ascending` picks the scan direction.
#[derive(Clone, Debug, Default)]
pub(crate) struct IteratorOptions {
    pub(crate) start: Option<Key>,
    pub(crate) end: Option<Key>,
    pub(crate) ascending: bool,
}

// The recorded trace of one range scan: the options it ran with, the
// key the caller had not yet consumed when it released the iterator
// early, and every multi-version read the scan resolved. Validation
// replays the scan against the current multi-version data, stopping at
// the same key, and compares the resolved sequence.
#[derive(Clone, Debug)]
pub(crate) struct IteratorDescriptor {
    pub(crate) opts: IteratorOptions,
    pub(crate) stop: Option<Key>,
    pub(crate) reads: Vec<ReadDescriptor>,
}

// Everything one store view observed during a single execution.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReadSet {
    pub(crate) reads: Vec<ReadDescriptor>,
    pub(crate) iterators: Vec<IteratorDescriptor>,
}

// The updates made by one transaction incarnation, applied to the
// multi-version data structure at the end of the execution. `None`
// marks a deletion. Keys are kept ordered so that re-execution can
// diff against the previous write set with a single linear merge.
pub(crate) type WriteSet = BTreeMap<Key, Option<Value>>;

// One read / write set per store, indexed by `StoreId`.
pub(crate) type MultiReadSet = Vec<ReadSet>;
pub(crate) type MultiWriteSet = Vec<WriteSet>;

pub(crate) type ExecutionTask = TxnVersion;
pub(crate) type ValidationTask = TxnVersion;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Task {
    Execution(ExecutionTask),
    Validation(ValidationTask),
}

// Linear merge of two sorted key lists. The callback receives every key
// that appears in exactly one of the lists, with `is_new == true` for
// keys only present in `new`.
pub(crate) fn diff_ordered_list(old: &[Key], new: &[Key], mut callback: impl FnMut(&Key, bool)) {
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            Ordering::Less => {
                callback(&old[i], false);
                i += 1;
            }
            Ordering::Greater => {
                callback(&new[j], true);
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    for key in &old[i..] {
        callback(key, false);
    }
    for key in &new[j..] {
        callback(key, true);
    }
}

// Whether `key` lies strictly past `boundary` in the scan direction.
pub(crate) fn bytes_beyond(key: &[u8], boundary: &[u8], ascending: bool) -> bool {
    if ascending {
        key > boundary
    } else {
        key < boundary
    }
}

mod mv_data;
mod mv_iterator;
mod mv_memory;
mod scheduler;
mod stm;
mod storage;
mod view;

pub use stm::{execute_block, execute_block_sequential, BlockError, CancelToken};
pub use storage::{KVStore, MemDb, MultiMemDb, MultiStore, StoreIterator};
pub use view::{MultiStoreView, ViewIterator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_ordered_list_reports_additions_and_removals() {
        let old: Vec<Key> = [b"a".to_vec(), b"b".to_vec(), b"d".to_vec()].to_vec();
        let new: Vec<Key> = [b"b".to_vec(), b"c".to_vec(), b"e".to_vec()].to_vec();
        let mut added = Vec::new();
        let mut removed = Vec::new();
        diff_ordered_list(&old, &new, |key, is_new| {
            if is_new {
                added.push(key.clone());
            } else {
                removed.push(key.clone());
            }
        });
        assert_eq!(added, vec![b"c".to_vec(), b"e".to_vec()]);
        assert_eq!(removed, vec![b"a".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn bytes_beyond_respects_direction() {
        assert!(bytes_beyond(b"b", b"a", true));
        assert!(!bytes_beyond(b"a", b"a", true));
        assert!(!bytes_beyond(b"a", b"b", true));
        assert!(bytes_beyond(b"a", b"b", false));
        assert!(!bytes_beyond(b"b", b"a", false));
    }
}
