//! Deferred completions
//!
//! Tests that exercise suspended computations hand out [`Pending`] values,
//! queue the value each one should eventually receive, and then call
//! [`DeferredQueue::drain_all`]. Completing one pending value commonly
//! resumes code that blocks on another, so draining keeps going until the
//! queue stays empty. Resumption chains must be finite.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

type Callback<T> = Box<dyn FnOnce(&T)>;

struct PendingState<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

/// A value that becomes available once someone completes it
pub struct Pending<T> {
    state: Rc<RefCell<PendingState<T>>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: Clone + 'static> Pending<T> {
    /// A value not yet completed
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(PendingState {
                value: None,
                callbacks: Vec::new(),
            })),
        }
    }

    /// A value that is already complete
    pub fn completed(value: T) -> Self {
        let pending = Self::new();
        pending.complete(value);
        pending
    }

    /// Supply the value
    ///
    /// Returns `false`, leaving the first value in place, if already
    /// completed. Callbacks run after the state is updated, so they may
    /// freely inspect this handle or register further callbacks.
    pub fn complete(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Check whether a value was supplied
    pub fn is_completed(&self) -> bool {
        self.state.borrow().value.is_some()
    }

    /// The supplied value, if any
    pub fn value(&self) -> Option<T> {
        self.state.borrow().value.clone()
    }

    /// Run `f` with the value once it is available
    ///
    /// Runs immediately when already completed; otherwise callbacks run in
    /// registration order.
    pub fn on_complete(&self, f: impl FnOnce(&T) + 'static) {
        let mut state = self.state.borrow_mut();
        match state.value.clone() {
            Some(value) => {
                drop(state);
                f(&value);
            }
            None => state.callbacks.push(Box::new(f)),
        }
    }

    /// A pending value completed with `f` of this one
    pub fn map<U, F>(&self, f: F) -> Pending<U>
    where
        U: Clone + 'static,
        F: FnOnce(&T) -> U + 'static,
    {
        let mapped = Pending::new();
        let target = mapped.clone();
        self.on_complete(move |value| {
            target.complete(f(value));
        });
        mapped
    }
}

impl<T: Clone + 'static> Default for Pending<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Pending")
            .field("value", &state.value)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

/// FIFO of pending values and the values that will complete them
///
/// Clones share the same queue, so a completion callback can hold a clone
/// and enqueue more work while the queue is being drained.
pub struct DeferredQueue<T> {
    items: Rc<RefCell<VecDeque<(Pending<T>, T)>>>,
}

impl<T> Clone for DeferredQueue<T> {
    fn clone(&self) -> Self {
        Self {
            items: Rc::clone(&self.items),
        }
    }
}

impl<T: Clone + 'static> DeferredQueue<T> {
    /// Empty queue
    pub fn new() -> Self {
        Self {
            items: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Queue `pending` to be completed with `value`
    pub fn enqueue(&self, pending: Pending<T>, value: T) {
        self.items.borrow_mut().push_back((pending, value));
    }

    /// A new pending value, queued for completion with `value`
    pub fn blocked(&self, value: T) -> Pending<T> {
        let pending = Pending::new();
        self.enqueue(pending.clone(), value);
        pending
    }

    /// A new pending value, queued for completion with `T::default()`
    pub fn blocked_default(&self) -> Pending<T>
    where
        T: Default,
    {
        self.blocked(T::default())
    }

    /// Number of queued pairs
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Complete queued pairs front to back until the queue is empty
    ///
    /// Pairs enqueued by completion callbacks are drained too. Returns the
    /// number of pairs taken off the queue.
    pub fn drain_all(&self) -> usize {
        let mut drained = 0;
        loop {
            // The borrow ends before completing, so callbacks can enqueue
            let next = self.items.borrow_mut().pop_front();
            let Some((pending, value)) = next else {
                break;
            };
            let completed = pending.complete(value);
            drained += 1;
            trace!(completed, remaining = self.len(), "drained deferred completion");
        }
        drained
    }
}

impl<T: Clone + 'static> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DeferredQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("len", &self.items.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_complete_once() {
        let pending = Pending::new();
        assert!(!pending.is_completed());
        assert!(pending.complete(1));
        assert!(!pending.complete(2));
        assert_eq!(pending.value(), Some(1));
    }

    #[test]
    fn test_callbacks_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let pending = Pending::new();
        for tag in ["first", "second"] {
            let log = log.clone();
            pending.on_complete(move |v: &i32| log.borrow_mut().push(format!("{tag}:{v}")));
        }
        pending.complete(7);
        assert_eq!(*log.borrow(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn test_on_complete_after_completion_runs_now() {
        let hit = Rc::new(Cell::new(false));
        let pending = Pending::completed("done".to_string());
        let flag = hit.clone();
        pending.on_complete(move |_| flag.set(true));
        assert!(hit.get());
    }

    #[test]
    fn test_callback_can_reenter_handle() {
        let pending = Pending::new();
        let inner = pending.clone();
        let seen = Rc::new(Cell::new(0));
        let seen_inner = seen.clone();
        pending.on_complete(move |_: &i32| {
            assert!(inner.is_completed());
            let seen = seen_inner.clone();
            inner.on_complete(move |v| seen.set(*v));
        });
        pending.complete(5);
        assert_eq!(seen.get(), 5);
    }

    #[test]
    fn test_map() {
        let pending = Pending::new();
        let doubled = pending.map(|v: &i32| v * 2);
        assert!(!doubled.is_completed());
        pending.complete(21);
        assert_eq!(doubled.value(), Some(42));
    }

    #[test]
    fn test_drain_empty_is_noop() {
        let queue: DeferredQueue<i32> = DeferredQueue::new();
        assert_eq!(queue.drain_all(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_in_order() {
        let queue = DeferredQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let p1 = queue.blocked("a");
        let p2 = queue.blocked("b");
        for pending in [&p1, &p2] {
            let order = order.clone();
            pending.on_complete(move |v| order.borrow_mut().push(*v));
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain_all(), 2);
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_reaches_fixed_point() {
        let queue = DeferredQueue::new();
        let p1 = queue.blocked("x".to_string());
        let p2: Pending<String> = Pending::new();

        let requeue = queue.clone();
        let next = p2.clone();
        p1.on_complete(move |_| requeue.enqueue(next.clone(), "y".to_string()));

        assert_eq!(queue.drain_all(), 2);
        assert_eq!(p1.value().as_deref(), Some("x"));
        assert_eq!(p2.value().as_deref(), Some("y"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_already_completed_pair_is_still_drained() {
        let queue = DeferredQueue::new();
        let pending = Pending::completed(1);
        queue.enqueue(pending.clone(), 2);
        assert_eq!(queue.drain_all(), 1);
        assert_eq!(pending.value(), Some(1));
    }

    #[test]
    fn test_blocked_default() {
        let queue: DeferredQueue<Option<u8>> = DeferredQueue::new();
        let pending = queue.blocked_default();
        queue.drain_all();
        assert_eq!(pending.value(), Some(None));
    }
}
