use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// A pool of reusable objects.
///
/// Objects are checked out through [`PoolHandle`]; dropping the last handle
/// returns the object to the pool's queue. The constructor runs lazily when
/// the queue is empty, so the pool grows to the peak number of concurrent
/// users and no further. Handles may outlive the pool itself.
pub struct ObjectPool<T: Send + 'static> {
    constructor: Box<dyn Fn() -> T + Send + Sync>,
    objects: Arc<Mutex<VecDeque<T>>>,
}

/// An exclusive handle to a pooled object.
pub struct PoolHandle<T: Send + 'static> {
    value: Option<T>,
    home: Arc<Mutex<VecDeque<T>>>,
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new(constructor: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ObjectPool {
            constructor: Box::new(constructor),
            objects: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn get(&self) -> PoolHandle<T> {
        let existing = self.objects.lock().pop_front();
        let value = existing.unwrap_or_else(|| (self.constructor)());
        PoolHandle {
            value: Some(value),
            home: Arc::clone(&self.objects),
        }
    }

    /// Number of idle objects currently queued for reuse.
    pub fn idle_count(&self) -> usize {
        self.objects.lock().len()
    }
}

impl<T: Send + 'static> Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pool handle already returned")
    }
}

impl<T: Send + 'static> DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pool handle already returned")
    }
}

impl<T: Send + 'static> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.home.lock().push_back(value);
        }
    }
}
