//! Choice resolution and join atomicity.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use common::{assert_eventually, init_logging, wait_until};
use conflux::{
    arbiter, joined_receive, multiple_item_receive, multiple_port_receive, ArbiterError, Choice,
    Dispatcher, DispatcherQueue, Port,
};
use std::time::Duration;

fn runtime(name: &str) -> (Dispatcher, DispatcherQueue) {
    init_logging();
    let dispatcher = Dispatcher::new(2, name);
    let queue = DispatcherQueue::new("main", &dispatcher).expect("queue");
    (dispatcher, queue)
}

#[test]
fn choice_commits_exactly_one_branch() {
    let (dispatcher, queue) = runtime("choice-one");
    let left: Port<u32> = Port::new();
    let right: Port<&str> = Port::new();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let (l, r) = (Arc::clone(&fired), Arc::clone(&fired));
    Choice::activate(
        &queue,
        vec![
            arbiter::receive(false, &left, move |n| l.lock().push(format!("left {n}"))),
            arbiter::receive(false, &right, move |s| r.lock().push(format!("right {s}"))),
        ],
    )
    .expect("activate");

    left.post(1);
    assert_eventually("winner ran", || !fired.lock().is_empty());
    // the loser is retired; its messages stay put
    right.post("late");
    left.post(2);
    assert!(wait_until(Duration::from_millis(200), || {
        right.len() == 1 && left.len() == 1
    }));
    assert_eq!(*fired.lock(), vec!["left 1".to_owned()]);
    dispatcher.dispose();
}

#[test]
fn choice_with_backlog_resolves_on_activation() {
    let (dispatcher, queue) = runtime("choice-backlog");
    let left: Port<u32> = Port::new();
    let right: Port<u32> = Port::new();
    left.post(5);
    let count = Arc::new(AtomicUsize::new(0));
    let (l, r) = (Arc::clone(&count), Arc::clone(&count));
    Choice::activate(
        &queue,
        vec![
            arbiter::receive(false, &left, move |_| {
                l.fetch_add(1, Ordering::SeqCst);
            }),
            arbiter::receive(false, &right, move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        ],
    )
    .expect("activate");
    assert_eventually("resolved from backlog", || count.load(Ordering::SeqCst) == 1);
    dispatcher.dispose();
}

#[test]
fn choice_rejects_bad_shapes() {
    let (dispatcher, queue) = runtime("choice-shapes");
    let port: Port<u32> = Port::new();
    assert!(matches!(
        Choice::activate(&queue, Vec::new()),
        Err(ArbiterError::EmptyChoice)
    ));
    assert!(matches!(
        Choice::activate(&queue, vec![arbiter::receive(true, &port, |_| {})]),
        Err(ArbiterError::PersistentChoiceBranch)
    ));
    dispatcher.dispose();
}

#[test]
fn join_waits_for_both_ports() {
    let (dispatcher, queue) = runtime("join-both");
    let numbers: Port<u32> = Port::new();
    let labels: Port<String> = Port::new();
    let joined = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&joined);
    arbiter::activate(
        &queue,
        [joined_receive(false, &numbers, &labels, move |n, s| {
            sink.lock().push((n, s));
        })],
    )
    .expect("activate");

    numbers.post(9);
    // half a set is not enough
    assert!(!wait_until(Duration::from_millis(100), || {
        !joined.lock().is_empty()
    }));
    labels.post("nine".to_owned());
    assert_eventually("join fired", || joined.lock().len() == 1);
    assert_eq!(joined.lock()[0], (9, "nine".to_owned()));
    assert!(numbers.is_empty());
    assert!(labels.is_empty());
    dispatcher.dispose();
}

#[test]
fn persistent_join_fires_per_complete_set() {
    let (dispatcher, queue) = runtime("join-persistent");
    let a: Port<u32> = Port::new();
    let b: Port<u32> = Port::new();
    let sums = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sums);
    arbiter::activate(
        &queue,
        [joined_receive(true, &a, &b, move |x, y| {
            sink.lock().push(x + y);
        })],
    )
    .expect("activate");

    for n in 0..5 {
        a.post(n);
        b.post(n * 10);
    }
    assert_eventually("five sets", || sums.lock().len() == 5);
    let mut sums = sums.lock().clone();
    sums.sort_unstable();
    assert_eq!(sums, vec![0, 11, 22, 33, 44]);
    assert!(a.is_empty());
    assert!(b.is_empty());
    dispatcher.dispose();
}

#[test]
fn multiple_port_join_preserves_port_order() {
    let (dispatcher, queue) = runtime("join-vec");
    let ports: Vec<Port<u32>> = (0..4).map(|_| Port::new()).collect();
    let result = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&result);
    arbiter::activate(
        &queue,
        [multiple_port_receive(false, &ports, move |values| {
            *sink.lock() = Some(values);
        })
        .expect("build")],
    )
    .expect("activate");

    // arrival order deliberately scrambled
    ports[2].post(20);
    ports[0].post(0);
    ports[3].post(30);
    ports[1].post(10);
    assert_eventually("join fired", || result.lock().is_some());
    assert_eq!(result.lock().clone(), Some(vec![0, 10, 20, 30]));
    dispatcher.dispose();
}

#[test]
fn multiple_item_join_counts_messages() {
    let (dispatcher, queue) = runtime("join-count");
    let port: Port<u32> = Port::new();
    let batch = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&batch);
    arbiter::activate(
        &queue,
        [multiple_item_receive(false, &port, 3, move |values| {
            *sink.lock() = Some(values);
        })
        .expect("build")],
    )
    .expect("activate");

    port.post(1);
    port.post(2);
    assert!(!wait_until(Duration::from_millis(100), || {
        batch.lock().is_some()
    }));
    port.post(3);
    port.post(4);
    assert_eventually("batch fired", || batch.lock().is_some());
    assert_eq!(batch.lock().clone(), Some(vec![1, 2, 3]));
    // the fourth message is untouched
    assert_eventually("leftover stays", || port.len() == 1);
    dispatcher.dispose();
}

#[test]
fn competing_joins_over_shared_ports_make_progress() {
    let (dispatcher, queue) = runtime("join-compete");
    let a: Port<u32> = Port::new();
    let b: Port<u32> = Port::new();
    let total = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let sink = Arc::clone(&total);
        arbiter::activate(
            &queue,
            [joined_receive(true, &a, &b, move |_, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            })],
        )
        .expect("activate");
    }
    for n in 0..20 {
        a.post(n);
        b.post(n);
    }
    assert_eventually("all sets consumed", || {
        total.load(Ordering::SeqCst) == 20 && a.is_empty() && b.is_empty()
    });
    dispatcher.dispose();
}
