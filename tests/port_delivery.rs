//! End-to-end delivery through ports, receivers, and the dispatcher.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use common::{assert_eventually, init_logging};
use conflux::{
    arbiter, Dispatcher, DispatcherQueue, Port, PortMode, Task, TaskSequence,
};

fn runtime(name: &str) -> (Dispatcher, DispatcherQueue) {
    init_logging();
    let dispatcher = Dispatcher::new(2, name);
    let queue = DispatcherQueue::new("main", &dispatcher).expect("queue");
    (dispatcher, queue)
}

#[test]
fn persistent_receiver_sees_every_message_in_order() {
    let (dispatcher, queue) = runtime("delivery-order");
    let port: Port<u32> = Port::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    arbiter::activate(
        &queue,
        [arbiter::receive(true, &port, move |n| sink.lock().push(n))],
    )
    .expect("activate");

    for n in 0..100 {
        port.post(n);
    }
    assert_eventually("all messages received", || seen.lock().len() == 100);
    let seen = seen.lock();
    assert_eq!(*seen, (0..100).collect::<Vec<u32>>());
    drop(seen);
    dispatcher.dispose();
}

#[test]
fn backlog_drains_on_activation() {
    let (dispatcher, queue) = runtime("delivery-backlog");
    let port: Port<&str> = Port::new();
    port.post("early");
    port.post("earlier still");
    assert_eq!(port.len(), 2);

    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    arbiter::activate(
        &queue,
        [arbiter::receive(true, &port, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })],
    )
    .expect("activate");

    assert_eventually("backlog drained", || count.load(Ordering::SeqCst) == 2);
    assert!(port.is_empty());
    dispatcher.dispose();
}

#[test]
fn oneshot_receiver_fires_once_and_leaves_the_rest() {
    let (dispatcher, queue) = runtime("delivery-oneshot");
    let port: Port<u32> = Port::new();
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    arbiter::activate(
        &queue,
        [arbiter::receive(false, &port, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })],
    )
    .expect("activate");

    port.post(1);
    assert_eventually("one firing", || count.load(Ordering::SeqCst) == 1);
    port.post(2);
    port.post(3);
    // the receiver is gone; later messages queue up
    assert_eventually("messages parked", || port.len() == 2);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    dispatcher.dispose();
}

#[test]
fn predicate_filters_without_consuming() {
    let (dispatcher, queue) = runtime("delivery-predicate");
    let port: Port<u32> = Port::new();
    let evens = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&evens);
    arbiter::activate(
        &queue,
        [arbiter::receive_filtered(
            true,
            &port,
            |n: &u32| n % 2 == 0,
            move |n| sink.lock().push(n),
        )],
    )
    .expect("activate");

    for n in 0..10 {
        port.post(n);
    }
    assert_eventually("evens received", || evens.lock().len() == 5);
    assert_eq!(*evens.lock(), vec![0, 2, 4, 6, 8]);
    // odds stay in the port for someone else
    assert_eq!(port.len(), 5);
    assert_eq!(port.try_take(), Some(1));
    dispatcher.dispose();
}

#[test]
fn optimized_mode_delivers_to_single_receiver() {
    let (dispatcher, queue) = runtime("delivery-optimized");
    let port: Port<u32> = Port::new();
    port.set_mode(PortMode::OptimizedSingleReissueReceiver)
        .expect("mode");
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    arbiter::activate(
        &queue,
        [arbiter::receive(true, &port, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })],
    )
    .expect("activate");

    for n in 0..50 {
        port.post(n);
    }
    assert_eventually("all delivered", || count.load(Ordering::SeqCst) == 50);
    dispatcher.dispose();
}

#[test]
fn optimized_mode_rejects_second_receiver() {
    let (dispatcher, queue) = runtime("delivery-optimized-reject");
    let port: Port<u32> = Port::new();
    port.set_mode(PortMode::OptimizedSingleReissueReceiver)
        .expect("mode");
    arbiter::activate(&queue, [arbiter::receive(true, &port, |_| {})]).expect("first");
    let second = arbiter::activate(&queue, [arbiter::receive(true, &port, |_| {})]);
    assert!(second.is_err());
    // one-shot receivers cannot use the consume fast path either
    let port2: Port<u32> = Port::new();
    port2
        .set_mode(PortMode::OptimizedSingleReissueReceiver)
        .expect("mode");
    assert!(arbiter::activate(&queue, [arbiter::receive(false, &port2, |_| {})]).is_err());
    dispatcher.dispose();
}

#[test]
fn staged_handler_advances_one_step_per_quantum() {
    let (dispatcher, queue) = runtime("delivery-staged");
    let port: Port<u32> = Port::new();
    let trail = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&trail);
    arbiter::activate(
        &queue,
        [arbiter::receive_staged(true, &port, move |n| {
            let sink = Arc::clone(&sink);
            let steps: Vec<Task> = (0..3)
                .map(|step| {
                    let sink = Arc::clone(&sink);
                    Task::new(move || sink.lock().push((n, step)))
                })
                .collect();
            Box::new(steps.into_iter()) as TaskSequence
        })],
    )
    .expect("activate");

    port.post(7);
    assert_eventually("all stages ran", || trail.lock().len() == 3);
    assert_eq!(*trail.lock(), vec![(7, 0), (7, 1), (7, 2)]);
    dispatcher.dispose();
}
