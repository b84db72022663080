use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::{ExecutionTask, Incarnation, Task, TxnIndex, TxnVersion, ValidationTask};

// Per-transaction status machine:
//
// - ReadyToExecute(i) --try_incarnate--> Executing(i)
// - Executing(i) --finish_execution--> Executed(i)
// - Executed(i) --try_validation_abort--> Aborting(i)
// - Aborting(i) --set_ready--> ReadyToExecute(i+1)
//
// A transaction that hits an in-flight write of a lower transaction
// either registers as an abort-style dependent (Executing -> Aborting,
// re-executed after the blocker finishes), or parks mid-execution on
// the blocker's condvar (Executing -> Suspended -> Executing).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    ReadyToExecute,
    Executing,
    Suspended,
    Executed,
    Aborting,
}

struct StatusInner {
    incarnation: Incarnation,
    status: Status,
}

// Status and incarnation under one short-held mutex. The condvar
// carries dependency wake-ups: waiters park here until this transaction
// reports `Executed`.
pub(crate) struct StatusEntry {
    inner: Mutex<StatusInner>,
    executed: Condvar,
}

impl StatusEntry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                incarnation: 0,
                status: Status::ReadyToExecute,
            }),
            executed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> (Status, Incarnation) {
        let guard = self.inner.lock();
        (guard.status, guard.incarnation)
    }

    fn set_executing(&self) -> Option<Incarnation> {
        let mut guard = self.inner.lock();
        if guard.status == Status::ReadyToExecute {
            guard.status = Status::Executing;
            return Some(guard.incarnation);
        }
        None
    }

    fn set_executed(&self) {
        let mut guard = self.inner.lock();
        debug_assert_eq!(guard.status, Status::Executing);
        guard.status = Status::Executed;
        // wake everyone parked on this dependency
        self.executed.notify_all();
    }

    fn set_aborting(&self) -> bool {
        let mut guard = self.inner.lock();
        if guard.status == Status::Executed {
            return false;
        }
        guard.status = Status::Aborting;
        true
    }

    fn try_validation_abort(&self, incarnation: Incarnation) -> bool {
        let mut guard = self.inner.lock();
        if guard.incarnation == incarnation && guard.status == Status::Executed {
            guard.status = Status::Aborting;
            return true;
        }
        false
    }

    fn set_ready(&self) {
        let mut guard = self.inner.lock();
        debug_assert_eq!(guard.status, Status::Aborting);
        guard.incarnation += 1;
        guard.status = Status::ReadyToExecute;
    }

    fn is_executed(&self) -> bool {
        self.inner.lock().status == Status::Executed
    }

    fn suspend(&self) {
        let mut guard = self.inner.lock();
        debug_assert_eq!(guard.status, Status::Executing);
        guard.status = Status::Suspended;
    }

    fn resume(&self) {
        let mut guard = self.inner.lock();
        debug_assert_eq!(guard.status, Status::Suspended);
        guard.status = Status::Executing;
    }
}

// The scheduler dispatches execution and validation tasks to worker
// threads under two monotone indices, prioritizing the lower one.
// Indices only decrease on aborts and dependency resumptions; every
// decrease is counted so that termination can be detected without a
// lock.
pub(crate) struct Scheduler {
    block_size: usize,

    // next transaction to attempt to execute
    execution_idx: CachePadded<AtomicUsize>,
    // next transaction to attempt to validate
    validation_idx: CachePadded<AtomicUsize>,
    // times validation_idx or execution_idx was decreased
    decrease_cnt: CachePadded<AtomicUsize>,
    // ongoing validation and execution tasks
    num_active_tasks: CachePadded<AtomicUsize>,
    done_marker: AtomicBool,
    // cooperative stop for cancellation; also wakes parked waiters
    halted: AtomicBool,

    // abort-style dependents of each transaction
    txn_dependency: Vec<Mutex<Vec<TxnIndex>>>,
    txn_status: Vec<StatusEntry>,
}

impl Scheduler {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            block_size,
            execution_idx: CachePadded::new(AtomicUsize::new(0)),
            validation_idx: CachePadded::new(AtomicUsize::new(0)),
            decrease_cnt: CachePadded::new(AtomicUsize::new(0)),
            num_active_tasks: CachePadded::new(AtomicUsize::new(0)),
            done_marker: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            txn_dependency: (0..block_size).map(|_| Mutex::new(Vec::new())).collect(),
            txn_status: (0..block_size).map(|_| StatusEntry::new()).collect(),
        }
    }

    // Whether workers should stop dispatching, either because the block
    // completed or because execution was halted.
    pub(crate) fn done(&self) -> bool {
        self.done_marker.load(SeqCst) || self.halted.load(SeqCst)
    }

    // Whether the block actually ran to completion.
    pub(crate) fn completed(&self) -> bool {
        self.done_marker.load(SeqCst)
    }

    pub(crate) fn halted(&self) -> bool {
        self.halted.load(SeqCst)
    }

    // Stops the block early: dispatch loops observe `done` and every
    // waiter parked on a dependency is woken up.
    pub(crate) fn halt(&self) {
        self.halted.store(true, SeqCst);
        for entry in &self.txn_status {
            let _guard = entry.inner.lock();
            entry.executed.notify_all();
        }
    }

    fn decrease_execution_idx(&self, target: TxnIndex) {
        store_min(&self.execution_idx, target);
        self.decrease_cnt.fetch_add(1, SeqCst);
    }

    fn decrease_validation_idx(&self, target: TxnIndex) {
        store_min(&self.validation_idx, target);
        self.decrease_cnt.fetch_add(1, SeqCst);
    }

    // Latch `done` only when both indices have run off the block, no
    // task is in flight, and no index decrease raced with the
    // observation (the re-read of `decrease_cnt` catches a decrement
    // between the index loads and the task-count load).
    fn check_done(&self) {
        let observed_cnt = self.decrease_cnt.load(SeqCst);
        if self.execution_idx.load(SeqCst) >= self.block_size
            && self.validation_idx.load(SeqCst) >= self.block_size
            && self.num_active_tasks.load(SeqCst) == 0
            && observed_cnt == self.decrease_cnt.load(SeqCst)
        {
            self.done_marker.store(true, SeqCst);
        }
    }

    // Move a transaction into `Executing` and hand out its incarnation.
    // On failure the caller's active-task slot is released.
    pub(crate) fn try_incarnate(&self, idx: TxnIndex) -> Option<TxnVersion> {
        if idx < self.block_size {
            if let Some(incarnation) = self.txn_status[idx].set_executing() {
                return Some(TxnVersion {
                    index: idx,
                    incarnation,
                });
            }
        }
        self.num_active_tasks.fetch_sub(1, SeqCst);
        None
    }

    fn next_version_to_execute(&self) -> Option<TxnVersion> {
        if self.execution_idx.load(SeqCst) >= self.block_size {
            self.check_done();
            return None;
        }
        self.num_active_tasks.fetch_add(1, SeqCst);
        let idx = self.execution_idx.fetch_add(1, SeqCst);
        self.try_incarnate(idx)
    }

    fn next_version_to_validate(&self) -> Option<TxnVersion> {
        if self.validation_idx.load(SeqCst) >= self.block_size {
            self.check_done();
            return None;
        }
        self.num_active_tasks.fetch_add(1, SeqCst);
        let idx = self.validation_idx.fetch_add(1, SeqCst);
        if idx < self.block_size {
            let (status, incarnation) = self.txn_status[idx].get();
            if status == Status::Executed {
                return Some(TxnVersion {
                    index: idx,
                    incarnation,
                });
            }
        }
        self.num_active_tasks.fetch_sub(1, SeqCst);
        None
    }

    // The next task to work on, preferring validation of lower
    // transactions over execution of higher ones.
    pub(crate) fn next_task(&self) -> Option<Task> {
        let validation_idx = self.validation_idx.load(SeqCst);
        let execution_idx = self.execution_idx.load(SeqCst);
        if validation_idx < execution_idx {
            self.next_version_to_validate().map(Task::Validation)
        } else {
            self.next_version_to_execute().map(Task::Execution)
        }
    }

    // Register `txn` as an abort-style dependent of `blocking_txn`.
    // Returns false when the dependency resolved in the meantime; the
    // caller then re-reads and retries instead of retiring.
    pub(crate) fn add_dependency(&self, txn: TxnIndex, blocking_txn: TxnIndex) -> bool {
        let mut dependents = self.txn_dependency[blocking_txn].lock();

        if self.txn_status[blocking_txn].is_executed() {
            return false;
        }
        if !self.txn_status[txn].set_aborting() {
            return false;
        }

        dependents.push(txn);
        self.num_active_tasks.fetch_sub(1, SeqCst);
        true
    }

    // Park the executing transaction until `blocking_txn` finishes its
    // current incarnation. Returns immediately when the blocker is
    // already executed (the caller re-reads and retries) or when the
    // scheduler was halted.
    pub(crate) fn wait_for_dependency(&self, txn: TxnIndex, blocking_txn: TxnIndex) {
        self.txn_status[txn].suspend();

        let entry = &self.txn_status[blocking_txn];
        {
            let mut guard = entry.inner.lock();
            while guard.status != Status::Executed && !self.halted.load(SeqCst) {
                entry.executed.wait(&mut guard);
            }
        }

        self.txn_status[txn].resume();
    }

    fn resume_dependencies(&self, txns: &[TxnIndex]) {
        let mut min_idx = None;
        for &txn in txns {
            self.txn_status[txn].set_ready();
            min_idx = Some(min_idx.map_or(txn, |min: TxnIndex| min.min(txn)));
        }
        if let Some(min_idx) = min_idx {
            if min_idx < self.execution_idx.load(SeqCst) {
                self.decrease_execution_idx(min_idx);
            }
        }
    }

    // Mark the version executed, release its dependents, and decide
    // what to validate: everything from this transaction on when it
    // wrote a fresh location, otherwise just this transaction (on the
    // current thread, without retiring the task slot).
    pub(crate) fn finish_execution(
        &self,
        version: TxnVersion,
        wrote_new_location: bool,
    ) -> Option<ValidationTask> {
        self.txn_status[version.index].set_executed();

        let dependents = std::mem::take(&mut *self.txn_dependency[version.index].lock());
        self.resume_dependencies(&dependents);

        if self.validation_idx.load(SeqCst) > version.index {
            if !wrote_new_location {
                return Some(version);
            }
            self.decrease_validation_idx(version.index);
        }
        self.num_active_tasks.fetch_sub(1, SeqCst);
        None
    }

    // Abort the executed incarnation, but only if it is still the one
    // the validator looked at.
    pub(crate) fn try_validation_abort(&self, version: &TxnVersion) -> bool {
        self.txn_status[version.index].try_validation_abort(version.incarnation)
    }

    // After an abort, everything above must revalidate and the aborted
    // transaction is re-executed right away when the execution index
    // already passed it.
    pub(crate) fn finish_validation(
        &self,
        txn: TxnIndex,
        aborted: bool,
    ) -> Option<ExecutionTask> {
        if aborted {
            self.txn_status[txn].set_ready();
            self.decrease_validation_idx(txn + 1);
            if self.execution_idx.load(SeqCst) > txn {
                // on failure try_incarnate already retired the task slot
                return self.try_incarnate(txn);
            }
        }
        self.num_active_tasks.fetch_sub(1, SeqCst);
        None
    }
}

// Compare-and-swap loop storing the minimum of the current and given
// values.
fn store_min(atomic: &AtomicUsize, target: usize) {
    let mut current = atomic.load(SeqCst);
    while current > target {
        match atomic.compare_exchange_weak(current, target, SeqCst, SeqCst) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Dispatch until an execution task comes out. Single-threaded
    // dispatch interleaves empty validation attempts whenever the
    // validation index trails the execution index.
    fn next_execution(scheduler: &Scheduler, index: TxnIndex, incarnation: Incarnation) -> TxnVersion {
        for _ in 0..4 {
            match scheduler.next_task() {
                Some(Task::Execution(version)) => {
                    assert_eq!(version.index, index);
                    assert_eq!(version.incarnation, incarnation);
                    return version;
                }
                Some(Task::Validation(version)) => {
                    panic!("unexpected validation task for {}", version.index)
                }
                None => continue,
            }
        }
        panic!("no execution task dispatched for {index}");
    }

    #[test]
    fn status_transitions() {
        let entry = StatusEntry::new();
        assert_eq!(entry.get(), (Status::ReadyToExecute, 0));

        assert_eq!(entry.set_executing(), Some(0));
        // cannot start twice
        assert_eq!(entry.set_executing(), None);
        entry.set_executed();

        // wrong incarnation does not abort
        assert!(!entry.try_validation_abort(1));
        assert!(entry.try_validation_abort(0));
        // a second abort of the same incarnation is refused
        assert!(!entry.try_validation_abort(0));

        entry.set_ready();
        assert_eq!(entry.get(), (Status::ReadyToExecute, 1));
        assert_eq!(entry.set_executing(), Some(1));
    }

    #[test]
    fn set_aborting_refuses_executed() {
        let entry = StatusEntry::new();
        entry.set_executing();
        assert!(entry.set_aborting());

        let entry = StatusEntry::new();
        entry.set_executing();
        entry.set_executed();
        assert!(!entry.set_aborting());
    }

    #[test]
    fn single_transaction_runs_to_done() {
        let scheduler = Scheduler::new(1);
        let version = next_execution(&scheduler, 0, 0);

        assert!(scheduler.finish_execution(version, true).is_none());
        match scheduler.next_task() {
            Some(Task::Validation(v)) => {
                assert_eq!(v, version);
                assert!(scheduler.finish_validation(v.index, false).is_none());
            }
            other => panic!("expected validation task, got {other:?}"),
        }

        assert!(scheduler.next_task().is_none());
        assert!(scheduler.done());
        assert!(scheduler.completed());
    }

    #[test]
    fn execution_tasks_come_out_in_order() {
        let scheduler = Scheduler::new(3);
        next_execution(&scheduler, 0, 0);
        next_execution(&scheduler, 1, 0);
        next_execution(&scheduler, 2, 0);
        assert!(scheduler.next_task().is_none());
        assert!(!scheduler.done());
    }

    #[test]
    fn self_validation_without_new_location() {
        let scheduler = Scheduler::new(2);
        let v0 = next_execution(&scheduler, 0, 0);
        let v1 = next_execution(&scheduler, 1, 0);

        // the failed validation attempt during dispatch pushed the
        // validation index past tx0, so tx0 validates itself in place
        assert_eq!(scheduler.finish_execution(v0, false), Some(v0));
        assert!(scheduler.finish_validation(v0.index, false).is_none());

        // validation_idx == 1 is not past tx1; it retires and the
        // validation task is dispatched separately
        assert!(scheduler.finish_execution(v1, false).is_none());
        match scheduler.next_task() {
            Some(Task::Validation(v)) => assert_eq!(v, v1),
            other => panic!("expected validation of tx1, got {other:?}"),
        }
    }

    #[test]
    fn new_location_restarts_validation_below() {
        let scheduler = Scheduler::new(2);
        let v0 = next_execution(&scheduler, 0, 0);
        let _v1 = next_execution(&scheduler, 1, 0);

        // a write to a fresh location retires and schedules revalidation
        // from this transaction on
        assert!(scheduler.finish_execution(v0, true).is_none());
        match scheduler.next_task() {
            Some(Task::Validation(v)) => assert_eq!(v, v0),
            other => panic!("expected validation of tx0, got {other:?}"),
        }
    }

    #[test]
    fn aborted_validation_reexecutes_in_place() {
        let scheduler = Scheduler::new(2);
        let v0 = next_execution(&scheduler, 0, 0);
        let _v1 = next_execution(&scheduler, 1, 0);

        let validation = scheduler.finish_execution(v0, false);
        assert_eq!(validation, Some(v0));

        assert!(scheduler.try_validation_abort(&v0));
        let task = scheduler.finish_validation(v0.index, true);
        assert_eq!(
            task,
            Some(TxnVersion {
                index: 0,
                incarnation: 1
            })
        );
        assert_eq!(scheduler.txn_status[0].get(), (Status::Executing, 1));
    }

    #[test]
    fn add_dependency_resumes_on_finish() {
        let scheduler = Scheduler::new(3);
        let v0 = next_execution(&scheduler, 0, 0);
        let _v1 = next_execution(&scheduler, 1, 0);
        let v2 = next_execution(&scheduler, 2, 0);

        assert!(scheduler.add_dependency(v2.index, v0.index));
        assert_eq!(scheduler.txn_status[2].get(), (Status::Aborting, 0));

        assert!(scheduler.finish_execution(v0, false).is_some());
        // the dependent is ready again at the next incarnation and the
        // execution index was pulled back to reach it
        assert_eq!(scheduler.txn_status[2].get(), (Status::ReadyToExecute, 1));
        assert!(scheduler.execution_idx.load(SeqCst) <= 2);
    }

    #[test]
    fn add_dependency_fails_on_executed_blocker() {
        let scheduler = Scheduler::new(2);
        let v0 = next_execution(&scheduler, 0, 0);
        let v1 = next_execution(&scheduler, 1, 0);
        assert!(scheduler.finish_execution(v0, false).is_some());

        assert!(!scheduler.add_dependency(v1.index, v0.index));
        // caller keeps its task and retries the read
        assert_eq!(scheduler.txn_status[1].get(), (Status::Executing, 0));
    }

    #[test]
    fn wait_for_dependency_parks_until_executed() {
        let scheduler = Scheduler::new(2);
        let v0 = next_execution(&scheduler, 0, 0);
        let v1 = next_execution(&scheduler, 1, 0);

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                scheduler.wait_for_dependency(v1.index, v0.index);
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!waiter.is_finished());
            scheduler.finish_execution(v0, false);
            waiter.join().expect("waiter wakes up");
        });
        assert_eq!(scheduler.txn_status[1].get(), (Status::Executing, 0));
    }

    #[test]
    fn halt_wakes_parked_waiters() {
        let scheduler = Scheduler::new(2);
        let _v0 = next_execution(&scheduler, 0, 0);
        let v1 = next_execution(&scheduler, 1, 0);

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                scheduler.wait_for_dependency(v1.index, 0);
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            scheduler.halt();
            waiter.join().expect("waiter wakes up");
        });
        assert!(scheduler.done());
        assert!(!scheduler.completed());
    }
}
