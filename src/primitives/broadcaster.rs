use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use crate::primitives::scheduler::CallbackScheduler;

type SubscriberFn<E> = Box<dyn Fn(&CallbackScheduler, &E) -> bool + Send>;

struct Inner<E> {
    subscribers: Vec<SubscriberFn<E>>,
    suspended: bool,
    held: VecDeque<E>,
}

/// Fanout of events to weakly-held subscribers.
///
/// `broadcast` is nonblocking: each delivery is scheduled onto the
/// [`CallbackScheduler`], so a slow subscriber never stalls the publisher. A
/// subscriber whose weak pointer has expired is dropped at the next fanout.
/// While suspended, events queue and replay in order on `resume`.
pub struct EventBroadcaster<E: Clone + Send + 'static> {
    name: String,
    scheduler: Arc<CallbackScheduler>,
    inner: Mutex<Inner<E>>,
    pending: Arc<AtomicUsize>,
}

impl<E: Clone + Send + 'static> EventBroadcaster<E> {
    pub fn new(scheduler: Arc<CallbackScheduler>, name: impl Into<String>) -> Self {
        EventBroadcaster {
            name: name.into(),
            scheduler,
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                suspended: false,
                held: VecDeque::new(),
            }),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stops delivery; subsequent broadcasts queue until `resume`.
    pub fn suspend(&self) {
        self.inner.lock().suspended = true;
    }

    /// Replays held events in order and reenables delivery.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.suspended = false;
        while let Some(event) = inner.held.pop_front() {
            self.fanout(&mut inner, event);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().suspended
    }

    /// Events broadcast but not yet delivered through the scheduler.
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Publishes an event to all live subscribers.
    pub fn broadcast(&self, event: E) {
        self.pending.fetch_add(1, Ordering::AcqRel);

        let mut inner = self.inner.lock();
        if inner.suspended {
            inner.held.push_back(event);
            return;
        }
        self.fanout(&mut inner, event);
    }

    fn fanout(&self, inner: &mut Inner<E>, event: E) {
        inner
            .subscribers
            .retain(|subscriber| subscriber(&self.scheduler, &event));

        let pending = Arc::clone(&self.pending);
        self.scheduler.schedule(move || {
            pending.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Subscribes a weakly-held receiver. Delivery stops (and the
    /// subscription is reaped) once the receiver is dropped.
    pub fn subscribe_weak<T>(&self, receiver: Weak<T>, callback: impl Fn(&T, E) + Send + Sync + 'static)
    where
        T: Send + Sync + 'static,
    {
        let name = self.name.clone();
        let callback = Arc::new(callback);
        self.subscribe_raw(Box::new(move |scheduler, event| {
            let Some(receiver) = receiver.upgrade() else {
                return false;
            };
            let callback = Arc::clone(&callback);
            let event = event.clone();
            let name = name.clone();
            scheduler.schedule(move || {
                let delivery = catch_unwind(AssertUnwindSafe(|| callback(&receiver, event)));
                if delivery.is_err() {
                    error!(broadcaster = %name, "subscriber callback panicked during delivery");
                }
            });
            true
        }));
    }

    /// Subscribes a callback that lives as long as the broadcaster.
    pub fn subscribe_forever(&self, callback: impl Fn(E) + Send + Sync + 'static) {
        let name = self.name.clone();
        let callback = Arc::new(callback);
        self.subscribe_raw(Box::new(move |scheduler, event| {
            let callback = Arc::clone(&callback);
            let event = event.clone();
            let name = name.clone();
            scheduler.schedule(move || {
                let delivery = catch_unwind(AssertUnwindSafe(|| callback(event)));
                if delivery.is_err() {
                    error!(broadcaster = %name, "subscriber callback panicked during delivery");
                }
            });
            true
        }));
    }

    fn subscribe_raw(&self, subscriber: SubscriberFn<E>) {
        self.inner.lock().subscribers.push(subscriber);
    }
}
