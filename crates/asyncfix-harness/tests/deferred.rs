//! Deferred completion scenarios driven the way fixture tests use them

use asyncfix_harness::{DeferredQueue, Pending};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_many_pairs_complete_in_queue_order() {
    let queue = DeferredQueue::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let pending: Vec<Pending<u32>> = (0..16).map(|i| queue.blocked(i)).collect();
    for p in &pending {
        let log = log.clone();
        p.on_complete(move |v| log.borrow_mut().push(*v));
    }

    assert_eq!(queue.drain_all(), 16);
    assert_eq!(*log.borrow(), (0..16).collect::<Vec<_>>());
    assert!(pending.iter().all(Pending::is_completed));
}

#[test]
fn test_chain_of_suspensions() {
    // Each completion resumes a step that blocks on the next value
    fn step(queue: DeferredQueue<u32>, remaining: u32, seen: Rc<RefCell<Vec<u32>>>) {
        let next = queue.blocked(remaining);
        let requeue = queue.clone();
        next.on_complete(move |v| {
            seen.borrow_mut().push(*v);
            if *v > 0 {
                step(requeue, v - 1, seen);
            }
        });
    }

    let queue = DeferredQueue::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    step(queue.clone(), 3, seen.clone());

    assert_eq!(queue.drain_all(), 4);
    assert_eq!(*seen.borrow(), vec![3, 2, 1, 0]);
    assert!(queue.is_empty());
}

#[test]
fn test_mapped_value_follows_drain() {
    let queue = DeferredQueue::new();
    let source = queue.blocked("ready".to_string());
    let length = source.map(|s: &String| s.len());

    assert_eq!(length.value(), None);
    queue.drain_all();
    assert_eq!(length.value(), Some(5));
}
