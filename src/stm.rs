use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{debug, error, trace};

use crate::mv_memory::MvMemory;
use crate::scheduler::Scheduler;
use crate::storage::MultiStore;
use crate::view::MultiStoreView;
use crate::{ExecutionTask, MultiReadSet, MultiWriteSet, Task, TxnIndex, TxnVersion, ValidationTask};

/// Errors from executing a block.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BlockError {
    /// The caller signalled cancellation; the base stores were left
    /// untouched.
    #[error("block execution cancelled")]
    Cancelled,
    /// The workers exited without completing the block. This cannot
    /// happen absent cancellation and indicates a scheduling bug.
    #[error("block execution finished incomplete")]
    Incomplete,
}

/// Cooperative cancellation signal for [`execute_block`], checked by
/// every worker between tasks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that only fires once [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the block execution.
    pub fn cancel(&self) {
        self.0.store(true, SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(SeqCst)
    }
}

// The transaction body supplied by the caller. It must be deterministic
// per transaction index given the views it is handed; user-level
// failures are the closure author's business and never travel through
// engine control flow.
type TxExecutor<'a> = dyn Fn(TxnIndex, &MultiStoreView<'_>) + Sync + 'a;

// Runs one transaction body under a fresh per-transaction view and
// collects the observed read and write sets.
struct Vm<'a> {
    num_stores: usize,
    storage: &'a (dyn MultiStore + Sync),
    mv: &'a MvMemory,
    scheduler: &'a Scheduler,
    execute_tx: &'a TxExecutor<'a>,
}

impl Vm<'_> {
    fn execute(&self, txn: TxnIndex) -> (MultiReadSet, MultiWriteSet) {
        let view = MultiStoreView::new(self.num_stores, self.storage, self.mv, self.scheduler, txn);
        (self.execute_tx)(txn, &view);
        view.into_result()
    }
}

// Per-worker driver alternating between execution and validation tasks.
//
// After an incarnation executes it needs to pass validation. The
// validation re-resolves the read set and compares the observed
// versions; success means the applied writes are still up to date. A
// successful validation is not a commit: an abort of a lower
// transaction re-schedules validation for everything above it, so the
// same incarnation may be validated multiple times, by different
// threads, and potentially in parallel. The scheduler ensures that only
// the first abort per incarnation wins.
struct Executor<'a> {
    scheduler: &'a Scheduler,
    mv: &'a MvMemory,
    vm: &'a Vm<'a>,
    cancel: &'a CancelToken,
}

impl Executor<'_> {
    fn run(&self) {
        let mut task = None;
        loop {
            if self.scheduler.done() {
                return;
            }
            if self.cancel.is_cancelled() {
                self.scheduler.halt();
                return;
            }
            task = match task {
                Some(Task::Execution(version)) => self.try_execute(version).map(Task::Validation),
                Some(Task::Validation(version)) => self.try_validate(version).map(Task::Execution),
                None => self.scheduler.next_task(),
            };
        }
    }

    fn try_execute(&self, version: ExecutionTask) -> Option<ValidationTask> {
        let (read_set, write_set) = self.vm.execute(version.index);
        let wrote_new_location = self.mv.record(version, read_set, write_set);
        self.scheduler.finish_execution(version, wrote_new_location)
    }

    fn try_validate(&self, version: ValidationTask) -> Option<ExecutionTask> {
        let read_set_valid = self.mv.validate_read_set(version.index);
        let aborted = !read_set_valid && self.scheduler.try_validation_abort(&version);
        if aborted {
            trace!(
                txn = version.index,
                incarnation = version.incarnation,
                "validation abort"
            );
            self.mv.convert_writes_to_estimates(version.index);
        }
        self.scheduler.finish_validation(version.index, aborted)
    }
}

/// Executes a block of `block_size` transactions over `num_stores`
/// stores in parallel, with results indistinguishable from running the
/// transactions serially in index order.
///
/// `execute_tx` runs the transaction at the given index against the
/// supplied view; it may be invoked multiple times per transaction
/// (re-executions after conflicts) and concurrently for different
/// transactions. `workers == 0` uses the hardware parallelism. On
/// success the resulting snapshot is written back into `storage`; on
/// cancellation the stores are left untouched.
pub fn execute_block<MS>(
    cancel: &CancelToken,
    block_size: usize,
    num_stores: usize,
    storage: &mut MS,
    workers: usize,
    execute_tx: impl Fn(TxnIndex, &MultiStoreView<'_>) + Sync,
) -> Result<(), BlockError>
where
    MS: MultiStore + Sync,
{
    if block_size == 0 {
        return Ok(());
    }
    let workers = if workers == 0 {
        num_cpus::get()
    } else {
        workers
    }
    .min(block_size);
    debug!(block_size, num_stores, workers, "executing block");

    let scheduler = Scheduler::new(block_size);
    let mv = MvMemory::new(block_size, num_stores);
    let vm = Vm {
        num_stores,
        storage: &*storage,
        mv: &mv,
        scheduler: &scheduler,
        execute_tx: &execute_tx,
    };

    thread::scope(|scope| {
        for _ in 0..workers {
            let executor = Executor {
                scheduler: &scheduler,
                mv: &mv,
                vm: &vm,
                cancel,
            };
            scope.spawn(move || executor.run());
        }
    });

    if cancel.is_cancelled() {
        return Err(BlockError::Cancelled);
    }
    if !scheduler.completed() {
        error!("workers exited without completing the block");
        return Err(BlockError::Incomplete);
    }

    drop(vm);
    mv.write_snapshot(storage);
    Ok(())
}

/// Executes the block on the current thread, in index order, through
/// the same multi-version machinery. The outcome is byte-identical to
/// the parallel execution; useful as a fallback for tiny blocks and as
/// a differential-testing oracle.
pub fn execute_block_sequential<MS>(
    block_size: usize,
    num_stores: usize,
    storage: &mut MS,
    execute_tx: impl Fn(TxnIndex, &MultiStoreView<'_>),
) -> Result<(), BlockError>
where
    MS: MultiStore,
{
    if block_size == 0 {
        return Ok(());
    }
    let scheduler = Scheduler::new(block_size);
    let mv = MvMemory::new(block_size, num_stores);
    for index in 0..block_size {
        let view = MultiStoreView::new(num_stores, &*storage, &mv, &scheduler, index);
        execute_tx(index, &view);
        let (read_set, write_set) = view.into_result();
        mv.record(
            TxnVersion {
                index,
                incarnation: 0,
            },
            read_set,
            write_set,
        );
    }
    mv.write_snapshot(storage);
    Ok(())
}
