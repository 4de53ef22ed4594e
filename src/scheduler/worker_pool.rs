use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::primitives::ObjectPool;
use crate::scheduler::events::{
    ComputationStatus, CreatedComputations, LocalComputationPriorityAndStatusChanged,
};
use crate::types::{ComputationId, ComputationPriority, Guid, MachineId};
use crate::values::MemoryPool;

/// A checked-out computation's executable state.
///
/// `compute` runs until the computation finishes, voluntarily yields with
/// created child computations, or acknowledges an `interrupt`. Transient
/// values built during the run live in `scratch`, an arena the pool lends
/// out for the duration of the execution and recycles afterwards.
/// `compute` and `interrupt` may be called from different threads.
pub trait ComputationState: Send + Sync + 'static {
    fn compute(&self, guid: Guid, scratch: &Arc<MemoryPool>) -> CreatedComputations;
    fn interrupt(&self);
    /// The status after `compute` returns; `Computable` means the
    /// computation was preempted and should be rescheduled.
    fn current_status(&self) -> ComputationStatus;
}

/// One entry in the computable queue: a computation, its priority, and its
/// insertion sequence (older entries win priority ties).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ComputablePriority {
    pub computation: ComputationId,
    pub priority: ComputationPriority,
    seq: u64,
}

impl ComputablePriority {
    fn ordering_key(&self) -> (ComputationPriority, std::cmp::Reverse<u64>) {
        (self.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialOrd for ComputablePriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComputablePriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ordering_key()
            .cmp(&other.ordering_key())
            .then_with(|| self.computation.cmp(&other.computation))
    }
}

struct InProgress<S> {
    state: Arc<S>,
    priority: ComputationPriority,
    worker: usize,
}

struct PoolState<S> {
    computable: BTreeSet<ComputablePriority>,
    entries: BTreeMap<ComputationId, ComputablePriority>,
    in_progress: BTreeMap<ComputationId, InProgress<S>>,
    stopping: bool,
    next_seq: u64,
}

impl<S> Default for PoolState<S> {
    fn default() -> Self {
        PoolState {
            computable: BTreeSet::new(),
            entries: BTreeMap::new(),
            in_progress: BTreeMap::new(),
            stopping: false,
            next_seq: 0,
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    computations_started: AtomicU64,
    interrupts_sent: AtomicU64,
    checkins: AtomicU64,
}

/// Counters describing pool activity since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerPoolMetricsSnapshot {
    pub computations_started: u64,
    pub interrupts_sent: u64,
    pub checkins: u64,
}

type CheckoutFn<S> = Box<dyn Fn(&ComputationId) -> (Arc<S>, Guid) + Send + Sync>;
type CheckinFn = Box<dyn Fn(ComputationId, CreatedComputations) + Send + Sync>;
type ComputingCallback = Arc<dyn Fn(&ComputablePriority) + Send + Sync>;

struct PoolShared<S: ComputationState> {
    machine: MachineId,
    state: Mutex<PoolState<S>>,
    work_available: Condvar,
    checkout: CheckoutFn<S>,
    checkin: CheckinFn,
    computing_callback: Mutex<Option<ComputingCallback>>,
    /// reusable per-execution value arenas
    scratch_arenas: ObjectPool<Arc<MemoryPool>>,
    metrics: PoolMetrics,
}

/// Executes checked-out computations on `thread_count` worker threads in
/// strictly descending priority order, FIFO among equals.
///
/// Status events drive the computable queue; when a new computable outranks
/// a running computation, the lowest-priority running computation is
/// interrupted, checked back in, and requeued behind the newcomer.
pub struct WorkerThreadPool<S: ComputationState> {
    shared: Arc<PoolShared<S>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl<S: ComputationState> WorkerThreadPool<S> {
    pub fn new(
        thread_count: usize,
        checkout: impl Fn(&ComputationId) -> (Arc<S>, Guid) + Send + Sync + 'static,
        checkin: impl Fn(ComputationId, CreatedComputations) + Send + Sync + 'static,
        machine: MachineId,
    ) -> Self {
        WorkerThreadPool {
            shared: Arc::new(PoolShared {
                machine,
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                checkout: Box::new(checkout),
                checkin: Box::new(checkin),
                computing_callback: Mutex::new(None),
                scratch_arenas: ObjectPool::new(MemoryPool::new),
                metrics: PoolMetrics::default(),
            }),
            threads: Mutex::new(Vec::new()),
            thread_count,
        }
    }

    /// Test and telemetry hook invoked as each computation is selected.
    pub fn set_computing_callback(
        &self,
        callback: impl Fn(&ComputablePriority) + Send + Sync + 'static,
    ) {
        *self.shared.computing_callback.lock() = Some(Arc::new(callback));
    }

    /// Number of computations currently queued as computable.
    pub fn computable_count(&self) -> usize {
        self.shared.state.lock().computable.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.shared.state.lock().in_progress.len()
    }

    /// The worker slot currently running `computation`, if any.
    pub fn worker_running(&self, computation: &ComputationId) -> Option<usize> {
        self.shared
            .state
            .lock()
            .in_progress
            .get(computation)
            .map(|running| running.worker)
    }

    pub fn metrics(&self) -> WorkerPoolMetricsSnapshot {
        WorkerPoolMetricsSnapshot {
            computations_started: self
                .shared
                .metrics
                .computations_started
                .load(Ordering::Relaxed),
            interrupts_sent: self.shared.metrics.interrupts_sent.load(Ordering::Relaxed),
            checkins: self.shared.metrics.checkins.load(Ordering::Relaxed),
        }
    }

    /// Feeds a local status event into the scheduler: upserts or drops the
    /// computation in the computable queue and preempts a running
    /// computation that a newly queued one outranks.
    pub fn on_computation_status_changed(&self, event: LocalComputationPriorityAndStatusChanged) {
        let to_interrupt = {
            let mut state = self.shared.state.lock();

            match &event {
                LocalComputationPriorityAndStatusChanged::Active {
                    computation,
                    new_priority,
                    status,
                    ..
                } if status.is_computable() && !new_priority.is_null() => {
                    // keep the original insertion order on priority change
                    let existing_seq = state.entries.get(computation).map(|entry| entry.seq);
                    let seq = existing_seq.unwrap_or_else(|| {
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        seq
                    });
                    if let Some(previous) = state.entries.remove(computation) {
                        state.computable.remove(&previous);
                    }
                    if state.in_progress.contains_key(computation) {
                        if let Some(running) = state.in_progress.get_mut(computation) {
                            running.priority = *new_priority;
                        }
                    } else {
                        let entry = ComputablePriority {
                            computation: computation.clone(),
                            priority: *new_priority,
                            seq,
                        };
                        state.entries.insert(computation.clone(), entry.clone());
                        state.computable.insert(entry);
                    }
                }
                _ => {
                    let computation = event.computation();
                    if let Some(previous) = state.entries.remove(computation) {
                        state.computable.remove(&previous);
                    }
                }
            }

            self.preemption_candidate(&mut state)
        };

        if let Some((computation, state_to_interrupt)) = to_interrupt {
            debug!(?computation, "worker.interrupt");
            self.shared
                .metrics
                .interrupts_sent
                .fetch_add(1, Ordering::Relaxed);
            state_to_interrupt.interrupt();
        }

        self.shared.work_available.notify_all();
    }

    /// When the queue's top outranks the weakest running computation,
    /// returns that computation's state for interruption.
    fn preemption_candidate(
        &self,
        state: &mut PoolState<S>,
    ) -> Option<(ComputationId, Arc<S>)> {
        let top = state.computable.iter().next_back()?.priority;
        let weakest = state
            .in_progress
            .iter()
            .min_by_key(|(_, running)| running.priority)?;
        if weakest.1.priority < top {
            Some((weakest.0.clone(), Arc::clone(&weakest.1.state)))
        } else {
            None
        }
    }

    /// Spawns the worker threads.
    pub fn start_computations(&self) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }
        info!(
            workers = self.thread_count,
            machine = %self.shared.machine.guid(),
            "worker_pool.start"
        );
        for worker in 0..self.thread_count {
            let shared = Arc::clone(&self.shared);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("nimbus-worker-{worker}"))
                    .spawn(move || worker_loop(&shared, worker))
                    .expect("spawning worker thread"),
            );
        }
    }

    /// Drains the pool: interrupts everything running and joins the
    /// workers. Blocks until every in-flight computation has checked in.
    pub fn stop_computations(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            for running in state.in_progress.values() {
                self.shared
                    .metrics
                    .interrupts_sent
                    .fetch_add(1, Ordering::Relaxed);
                running.state.interrupt();
            }
            self.shared.work_available.notify_all();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        info!("worker_pool.stop");
    }

    /// Final teardown; safe to call after (or instead of) `stop_computations`.
    pub fn teardown(&self) {
        self.stop_computations();
    }
}

impl<S: ComputationState> Drop for WorkerThreadPool<S> {
    fn drop(&mut self) {
        self.stop_computations();
    }
}

fn worker_loop<S: ComputationState>(shared: &PoolShared<S>, worker: usize) {
    loop {
        let entry = {
            let mut state = shared.state.lock();
            loop {
                if state.stopping {
                    return;
                }
                if let Some(top) = state.computable.iter().next_back().cloned() {
                    state.computable.remove(&top);
                    state.entries.remove(&top.computation);
                    break top;
                }
                shared.work_available.wait(&mut state);
            }
        };

        trace!(worker, computation = ?entry.computation, "worker.select");
        if let Some(callback) = shared.computing_callback.lock().clone() {
            (*callback)(&entry);
        }

        let (computation_state, guid) = (shared.checkout)(&entry.computation);
        shared
            .metrics
            .computations_started
            .fetch_add(1, Ordering::Relaxed);

        {
            let mut state = shared.state.lock();
            state.in_progress.insert(
                entry.computation.clone(),
                InProgress {
                    state: Arc::clone(&computation_state),
                    priority: entry.priority,
                    worker,
                },
            );
        }

        // the scratch arena returns to the pool when the handle drops
        let scratch = shared.scratch_arenas.get();
        let result = computation_state.compute(guid, &scratch);
        drop(scratch);

        let (requeue_priority, stopping) = {
            let mut state = shared.state.lock();
            let recorded = state.in_progress.remove(&entry.computation);
            let priority = recorded.map(|r| r.priority).unwrap_or(entry.priority);
            (priority, state.stopping)
        };

        shared.metrics.checkins.fetch_add(1, Ordering::Relaxed);
        let checkin_outcome = catch_unwind(AssertUnwindSafe(|| {
            (shared.checkin)(entry.computation.clone(), result)
        }));
        if checkin_outcome.is_err() {
            // the computation is treated as completed; retries are the
            // scheduler client's concern
            error!(computation = ?entry.computation, "checkin failed");
        }

        // a preempted computation goes back into the queue at its priority
        if !stopping && computation_state.current_status().is_computable() {
            let mut state = shared.state.lock();
            if !state.stopping && !state.entries.contains_key(&entry.computation) {
                let requeued = ComputablePriority {
                    computation: entry.computation.clone(),
                    priority: requeue_priority,
                    seq: entry.seq,
                };
                state
                    .entries
                    .insert(entry.computation.clone(), requeued.clone());
                state.computable.insert(requeued);
                shared.work_available.notify_all();
            }
        }
    }
}
