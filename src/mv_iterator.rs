use std::ops::Bound::{self, Excluded, Included, Unbounded};
use std::sync::Arc;

use crate::mv_data::{closest_below, KeyTree, ReadResult, SecondaryTree};
use crate::{IteratorOptions, Key, ReadDescriptor, ReadOrigin, TxnIndex, TxnVersion, Value};

// Outcome of resolving one outer key at the iterator's transaction.
enum KeyResolution {
    // No lower transaction wrote the key; it is invisible here.
    Missing,
    // Hit an ESTIMATE while replaying for validation.
    Estimate,
    Entry(TxnVersion, Option<Value>),
}

// Range iterator over the multi-version data of one store, as seen by
// one transaction.
//
// The outer key tree is a frozen snapshot loaded once at construction;
// each step seeks the next outer key in range and resolves the entry of
// the closest lower transaction. During execution (`wait` present) an
// ESTIMATE blocks until the owning transaction finishes and the key is
// resolved again; during validation replay (`wait` absent) it marks the
// iterator failed instead. Every resolved position is recorded in
// execution mode so the scan can be replayed for validation later.
pub(crate) struct MvIterator<'a> {
    tree: Arc<KeyTree>,
    opts: IteratorOptions,
    txn: TxnIndex,
    // Blocking wait on a lower transaction. Returns false when the wait
    // was interrupted (scheduler halt) and the key should be skipped.
    wait: Option<Box<dyn Fn(TxnIndex) -> bool + 'a>>,
    exhausted: bool,
    cursor: Option<Key>,
    current: Option<Current>,
    reads: Vec<ReadDescriptor>,
    read_estimate: bool,
}

struct Current {
    key: Key,
    version: TxnVersion,
    value: Option<Value>,
}

impl<'a> MvIterator<'a> {
    pub(crate) fn new(
        tree: Arc<KeyTree>,
        opts: IteratorOptions,
        txn: TxnIndex,
        wait: Option<Box<dyn Fn(TxnIndex) -> bool + 'a>>,
    ) -> Self {
        let exhausted = matches!(
            (&opts.start, &opts.end),
            (Some(start), Some(end)) if start > end
        );
        let mut iter = Self {
            tree,
            opts,
            txn,
            wait,
            exhausted,
            cursor: None,
            current: None,
            reads: Vec::new(),
            read_estimate: false,
        };
        iter.resolve();
        iter
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator is valid").key
    }

    pub(crate) fn version(&self) -> TxnVersion {
        self.current.as_ref().expect("iterator is valid").version
    }

    pub(crate) fn value(&self) -> Option<&[u8]> {
        self.current
            .as_ref()
            .expect("iterator is valid")
            .value
            .as_deref()
    }

    pub(crate) fn next(&mut self) {
        self.resolve();
    }

    // Whether the scan hit an ESTIMATE during a validation replay.
    pub(crate) fn read_estimate(&self) -> bool {
        self.read_estimate
    }

    pub(crate) fn take_reads(&mut self) -> Vec<ReadDescriptor> {
        std::mem::take(&mut self.reads)
    }

    // Step to the next outer key and resolve it, skipping keys with no
    // entry visible to this transaction.
    fn resolve(&mut self) {
        self.current = None;
        while let Some((key, tree)) = self.next_outer() {
            self.cursor = Some(key.clone());
            match self.resolve_key(&tree) {
                KeyResolution::Missing => continue,
                KeyResolution::Estimate => {
                    self.read_estimate = true;
                    self.exhausted = true;
                    return;
                }
                KeyResolution::Entry(version, value) => {
                    if self.wait.is_some() {
                        self.reads.push(ReadDescriptor {
                            key: key.clone(),
                            origin: ReadOrigin::MvMemory(version),
                        });
                    }
                    self.current = Some(Current { key, version, value });
                    return;
                }
            }
        }
    }

    fn next_outer(&mut self) -> Option<(Key, Arc<SecondaryTree>)> {
        if self.exhausted {
            return None;
        }
        let bounds = self.step_bounds();
        let mut range = self.tree.range::<(Bound<&[u8]>, Bound<&[u8]>), [u8]>(bounds);
        let next = if self.opts.ascending {
            range.next()
        } else {
            range.next_back()
        };
        next.map(|(key, tree)| (key.clone(), tree.clone()))
    }

    // Bounds for the next step: past the cursor in the scan direction,
    // within the configured half-open range.
    fn step_bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let start = self.opts.start.as_deref();
        let end = self.opts.end.as_deref();
        if self.opts.ascending {
            let lower = match (self.cursor.as_deref(), start) {
                (Some(cursor), _) => Excluded(cursor),
                (None, Some(start)) => Included(start),
                (None, None) => Unbounded,
            };
            (lower, end.map_or(Unbounded, Excluded))
        } else {
            let upper = match (self.cursor.as_deref(), end) {
                (Some(cursor), _) => Excluded(cursor),
                (None, Some(end)) => Excluded(end),
                (None, None) => Unbounded,
            };
            (start.map_or(Unbounded, Included), upper)
        }
    }

    // Loop until the key resolves to a value or a definite miss; blocks
    // on estimates in execution mode.
    fn resolve_key(&self, tree: &SecondaryTree) -> KeyResolution {
        loop {
            match closest_below(tree, self.txn) {
                ReadResult::NotFound => return KeyResolution::Missing,
                ReadResult::Data { version, value } => {
                    return KeyResolution::Entry(version, value)
                }
                ReadResult::Estimate { blocking_txn } => match &self.wait {
                    None => return KeyResolution::Estimate,
                    Some(wait) => {
                        if !wait(blocking_txn) {
                            return KeyResolution::Missing;
                        }
                    }
                },
            }
        }
    }
}
