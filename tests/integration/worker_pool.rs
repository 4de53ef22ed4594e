#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nimbus::primitives::Queue;
use nimbus::scheduler::{
    ComputationStatistics, ComputationStatus, CreatedComputations,
    LocalComputationPriorityAndStatusChanged, WorkerThreadPool,
};
use nimbus::types::{ComputationId, ComputationPriority, Guid, MachineId};
use nimbus::values::MemoryPool;
use parking_lot::{Condvar, Mutex};

/// A computation that blocks inside `compute` until told to finish or
/// interrupted, mirroring a long-running user computation.
struct MockComputationState {
    flags: Mutex<MockFlags>,
    condition: Condvar,
}

#[derive(Default)]
struct MockFlags {
    computed: bool,
    computing: bool,
    interrupted: bool,
}

impl MockComputationState {
    fn new() -> Arc<Self> {
        Arc::new(MockComputationState {
            flags: Mutex::new(MockFlags::default()),
            condition: Condvar::new(),
        })
    }

    fn finish(&self) {
        let mut flags = self.flags.lock();
        flags.computed = true;
        self.condition.notify_all();
    }

    fn send_interrupt(&self) {
        let mut flags = self.flags.lock();
        flags.interrupted = true;
        self.condition.notify_all();
    }

    fn wait_until_computing(&self) {
        let mut flags = self.flags.lock();
        while !flags.computing {
            self.condition.wait(&mut flags);
        }
    }

    fn wait_until_not_computing(&self) {
        let mut flags = self.flags.lock();
        while flags.computing {
            self.condition.wait(&mut flags);
        }
    }

    fn is_computing(&self) -> bool {
        self.flags.lock().computing
    }

    fn is_computed(&self) -> bool {
        self.flags.lock().computed
    }
}

impl nimbus::scheduler::ComputationState for MockComputationState {
    fn compute(&self, _guid: Guid, _scratch: &Arc<MemoryPool>) -> CreatedComputations {
        let mut flags = self.flags.lock();
        if flags.computed {
            return CreatedComputations::none();
        }
        flags.computing = true;
        self.condition.notify_all();

        while !flags.interrupted && !flags.computed {
            self.condition.wait(&mut flags);
        }
        if flags.interrupted {
            flags.interrupted = false;
        }
        flags.computing = false;
        self.condition.notify_all();
        CreatedComputations::none()
    }

    fn interrupt(&self) {
        self.send_interrupt();
    }

    fn current_status(&self) -> ComputationStatus {
        if self.flags.lock().computed {
            ComputationStatus::Finished
        } else {
            ComputationStatus::Computable
        }
    }
}

/// Hands out one mock state per computation id.
#[derive(Default)]
struct MockActiveComputations {
    states: Mutex<BTreeMap<ComputationId, Arc<MockComputationState>>>,
    count_changed: Condvar,
}

impl MockActiveComputations {
    fn checkout(&self, id: &ComputationId) -> (Arc<MockComputationState>, Guid) {
        let mut states = self.states.lock();
        let state = states
            .entry(id.clone())
            .or_insert_with(MockComputationState::new);
        let state = Arc::clone(state);
        self.count_changed.notify_all();
        (state, Guid::of_u64(0))
    }

    fn wait_for_count(&self, count: usize) {
        let mut states = self.states.lock();
        while states.len() < count {
            self.count_changed.wait(&mut states);
        }
    }

    fn single_state(&self) -> Arc<MockComputationState> {
        let states = self.states.lock();
        assert_eq!(states.len(), 1);
        Arc::clone(states.values().next().unwrap())
    }

    fn finish_one_computing(&self) -> bool {
        let states = self.states.lock();
        for state in states.values() {
            if !state.is_computed() && state.is_computing() {
                state.finish();
                state.wait_until_not_computing();
                return true;
            }
        }
        false
    }

    fn interrupt_one_computing(&self) -> bool {
        let states = self.states.lock();
        for state in states.values() {
            if !state.is_computed() && state.is_computing() {
                state.send_interrupt();
                state.wait_until_not_computing();
                return true;
            }
        }
        false
    }
}

fn computable_event(
    id: ComputationId,
    level: u64,
) -> LocalComputationPriorityAndStatusChanged {
    LocalComputationPriorityAndStatusChanged::active(
        id,
        ComputationPriority::at_level(level),
        ComputationStatus::Computable,
        ComputationStatistics::default(),
    )
}

#[test]
fn start_and_stop_with_no_computations() {
    let active = Arc::new(MockActiveComputations::default());
    let checkout = Arc::clone(&active);
    let pool = WorkerThreadPool::new(
        4,
        move |id| checkout.checkout(id),
        |_, _| {},
        MachineId::for_testing(0),
    );
    pool.start_computations();
    pool.stop_computations();
}

#[test]
fn single_worker_runs_in_priority_order_with_fifo_ties() {
    let active = Arc::new(MockActiveComputations::default());
    let checkout = Arc::clone(&active);
    let pool = Arc::new(WorkerThreadPool::new(
        1,
        move |id: &ComputationId| checkout.checkout(id),
        |_, _| {},
        MachineId::for_testing(0),
    ));

    // expected execution order: level 5, then the two level-3 entries in
    // submission order, then level 1
    let first_tie = ComputationId::for_testing(10);
    let second_tie = ComputationId::for_testing(11);
    let expected = vec![
        (ComputationId::for_testing(1), 5u64),
        (first_tie.clone(), 3),
        (second_tie.clone(), 3),
        (ComputationId::for_testing(2), 1),
    ];

    let observed: Arc<Queue<ComputationId>> = Arc::new(Queue::new());
    let sink = Arc::clone(&observed);
    pool.set_computing_callback(move |computable| {
        sink.write(computable.computation.clone());
    });

    // enqueue before starting so selection is purely priority-driven;
    // the first level-3 submission must precede the second
    pool.on_computation_status_changed(computable_event(first_tie, 3));
    pool.on_computation_status_changed(computable_event(second_tie, 3));
    pool.on_computation_status_changed(computable_event(ComputationId::for_testing(2), 1));
    pool.on_computation_status_changed(computable_event(ComputationId::for_testing(1), 5));

    pool.start_computations();

    for (expected_id, _level) in &expected {
        active.wait_for_count(1);
        let selected = observed.get_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(&selected, expected_id);
        // let the running computation finish so the next can start
        loop {
            if active.finish_one_computing() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pool.stop_computations();
}

#[test]
fn higher_priority_submission_preempts_the_running_computation() {
    let active = Arc::new(MockActiveComputations::default());
    let checkins: Arc<Queue<ComputationId>> = Arc::new(Queue::new());

    let checkout = Arc::clone(&active);
    let checkin_sink = Arc::clone(&checkins);
    let pool = WorkerThreadPool::new(
        1,
        move |id: &ComputationId| checkout.checkout(id),
        move |id, _result| checkin_sink.write(id),
        MachineId::for_testing(0),
    );

    let low = ComputationId::for_testing(1);
    let high = ComputationId::for_testing(2);

    pool.on_computation_status_changed(computable_event(low.clone(), 2));
    pool.start_computations();

    active.wait_for_count(1);
    let low_state = active.single_state();
    low_state.wait_until_computing();

    // a stronger computation arrives: the running one must be interrupted,
    // checked in, and the newcomer checked out before it resumes
    pool.on_computation_status_changed(computable_event(high.clone(), 5));

    let first_checkin = checkins.get_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(first_checkin, low);

    active.wait_for_count(2);
    let states = {
        let guard = active.states.lock();
        guard.clone()
    };
    let high_state = Arc::clone(states.get(&high).unwrap());
    high_state.wait_until_computing();
    assert!(!low_state.is_computing());

    // finish the high-priority computation; the preempted one resumes
    high_state.finish();
    let second_checkin = checkins.get_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(second_checkin, high);

    low_state.wait_until_computing();
    low_state.finish();
    let third_checkin = checkins.get_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(third_checkin, low);

    pool.stop_computations();
}

#[test]
fn repeated_interrupts_requeue_the_computation() {
    let active = Arc::new(MockActiveComputations::default());
    let checkins: Arc<Queue<ComputationId>> = Arc::new(Queue::new());

    let checkout = Arc::clone(&active);
    let checkin_sink = Arc::clone(&checkins);
    let pool = WorkerThreadPool::new(
        1,
        move |id: &ComputationId| checkout.checkout(id),
        move |id, _result| checkin_sink.write(id),
        MachineId::for_testing(0),
    );

    let id = ComputationId::for_testing(7);
    pool.on_computation_status_changed(computable_event(id.clone(), 2));
    pool.start_computations();

    active.wait_for_count(1);
    let state = active.single_state();

    for _ in 0..5 {
        state.wait_until_computing();
        assert!(state.is_computing());
        state.send_interrupt();
        let checked_in = checkins.get_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(checked_in, id);
    }

    state.wait_until_computing();
    state.finish();
    let final_checkin = checkins.get_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(final_checkin, id);
    assert!(state.is_computed());

    pool.stop_computations();
}

#[test]
fn many_computations_drain_under_churn() {
    let active = Arc::new(MockActiveComputations::default());
    let checkout = Arc::clone(&active);
    let pool = WorkerThreadPool::new(
        8,
        move |id: &ComputationId| checkout.checkout(id),
        |_, _| {},
        MachineId::for_testing(0),
    );

    pool.start_computations();

    let mut created = 0u64;
    let mut computed = 0u64;
    while computed < 300 {
        while created < computed + 10 {
            pool.on_computation_status_changed(computable_event(
                ComputationId::for_testing(1000 + created),
                created,
            ));
            created += 1;
        }
        active.wait_for_count(5);

        if computed % 3 == 0 {
            active.interrupt_one_computing();
        }
        if active.finish_one_computing() {
            computed += 1;
        }
    }

    while computed < created {
        if active.finish_one_computing() {
            computed += 1;
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let metrics = pool.metrics();
    assert!(metrics.computations_started >= created);
    assert!(metrics.checkins >= created);

    pool.teardown();
}
