use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Unbounded multi-producer multi-consumer FIFO.
///
/// Consumers may block (`get`), poll (`get_nonblock`), or wait with a
/// deadline (`get_timeout`, which returns `None` on expiry without consuming
/// anything).
pub struct Queue<T> {
    elements: Mutex<VecDeque<T>>,
    condition: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue {
            elements: Mutex::new(VecDeque::new()),
            condition: Condvar::new(),
        }
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, value: T) {
        let mut elements = self.elements.lock();
        elements.push_back(value);
        self.condition.notify_one();
    }

    /// Blocks until an element is available.
    pub fn get(&self) -> T {
        let mut elements = self.elements.lock();
        loop {
            if let Some(value) = elements.pop_front() {
                return value;
            }
            self.condition.wait(&mut elements);
        }
    }

    pub fn get_nonblock(&self) -> Option<T> {
        self.elements.lock().pop_front()
    }

    /// Waits up to `timeout` for an element.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let mut elements = self.elements.lock();
        if elements.is_empty() {
            self.condition.wait_for(&mut elements, timeout);
        }
        elements.pop_front()
    }

    /// Blocks until the queue is nonempty without consuming.
    pub fn wait(&self) {
        let mut elements = self.elements.lock();
        while elements.is_empty() {
            self.condition.wait(&mut elements);
        }
    }

    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }
}
