use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct SchedulerState {
    queue: VecDeque<Task>,
    executing: usize,
    stopping: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    work_available: Condvar,
    idle: Condvar,
}

/// Executes scheduled callbacks on a fixed set of background threads.
///
/// Publishers hand closures to `schedule` and return immediately; event
/// broadcasters use this to decouple delivery from publish. `block_until_idle`
/// waits for every scheduled callback to finish, which tests use to observe a
/// quiescent state.
pub struct CallbackScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CallbackScheduler {
    pub fn new(name: &str, thread_count: usize) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                executing: 0,
                stopping: false,
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(thread_count.max(1));
        for index in 0..thread_count.max(1) {
            let shared = Arc::clone(&shared);
            let thread_name = format!("{name}-{index}");
            threads.push(
                thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || run_loop(&shared))
                    .expect("spawning callback scheduler thread"),
            );
        }

        Arc::new(CallbackScheduler {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Enqueues a callback for execution on a scheduler thread.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        if state.stopping {
            debug!("callback scheduled after shutdown was dropped");
            return;
        }
        state.queue.push_back(Box::new(task));
        self.shared.work_available.notify_one();
    }

    /// Blocks until every scheduled callback has executed.
    pub fn block_until_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.executing > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Number of callbacks queued but not yet started.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

fn run_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.executing += 1;
                    break task;
                }
                if state.stopping {
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            debug!("scheduled callback panicked");
        }

        let mut state = shared.state.lock();
        state.executing -= 1;
        if state.queue.is_empty() && state.executing == 0 {
            shared.idle.notify_all();
        }
    }
}

impl Drop for CallbackScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            self.shared.work_available.notify_all();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
