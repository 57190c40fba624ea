//! Admission policies, suspension, timers, and disposal.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{assert_eventually, init_logging, wait_until};
use conflux::{
    Dispatcher, DispatcherOptions, DispatcherQueue, Port, PolicyNotification, QueueError, Task,
    TaskExecutionPolicy,
};

fn dispatcher(name: &str) -> Dispatcher {
    init_logging();
    Dispatcher::new(2, name)
}

fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
    let counter = Arc::clone(counter);
    Task::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn depth_discard_drops_the_oldest_task() {
    let dispatcher = dispatcher("policy-depth-discard");
    let queue = DispatcherQueue::with_policy(
        "bounded",
        &dispatcher,
        TaskExecutionPolicy::ConstrainQueueDepthDiscardTasks { maximum_depth: 2 },
    )
    .expect("queue");
    let notifications: Port<PolicyNotification> = Port::new();
    queue.set_policy_notification_port(notifications.clone());
    queue.suspend();

    let ran = Arc::new(AtomicUsize::new(0));
    assert_eq!(queue.enqueue(counting_task(&ran)), Ok(true));
    assert_eq!(queue.enqueue(counting_task(&ran)), Ok(true));
    // at the bound: admitting a third evicts the oldest
    assert_eq!(queue.enqueue(counting_task(&ran)), Ok(false));
    assert_eq!(queue.count(), 2);
    assert_eq!(notifications.len(), 1);
    assert!(matches!(
        notifications.try_take(),
        Some(PolicyNotification::Discarded(_))
    ));

    queue.resume();
    assert_eventually("survivors ran", || ran.load(Ordering::SeqCst) == 2);
    dispatcher.dispose();
}

#[test]
fn depth_throttle_stalls_the_producer_until_resume() {
    let dispatcher = dispatcher("policy-depth-throttle");
    let queue = DispatcherQueue::with_policy(
        "throttled",
        &dispatcher,
        TaskExecutionPolicy::ConstrainQueueDepthThrottleExecution { maximum_depth: 1 },
    )
    .expect("queue");
    queue.set_throttle_interval(Duration::from_millis(1));
    let notifications: Port<PolicyNotification> = Port::new();
    queue.set_policy_notification_port(notifications.clone());
    queue.suspend();

    let ran = Arc::new(AtomicUsize::new(0));
    assert_eq!(queue.enqueue(counting_task(&ran)), Ok(true));

    let producer = {
        let queue = queue.clone();
        let task = counting_task(&ran);
        std::thread::spawn(move || queue.enqueue(task))
    };
    // the producer is stuck behind the backlog bound
    std::thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());
    assert_eq!(queue.count(), 1);

    queue.resume();
    let admitted = producer.join().expect("producer");
    assert_eq!(admitted, Ok(true));
    assert_eventually("both ran", || ran.load(Ordering::SeqCst) == 2);
    assert!(matches!(
        notifications.try_take(),
        Some(PolicyNotification::Throttled)
    ));
    dispatcher.dispose();
}

#[test]
fn rate_discard_evicts_when_the_rate_is_exceeded() {
    let dispatcher = dispatcher("policy-rate-discard");
    let queue = DispatcherQueue::with_policy(
        "rated",
        &dispatcher,
        TaskExecutionPolicy::ConstrainSchedulingRateDiscardTasks { maximum_rate: 1e-6 },
    )
    .expect("queue");
    let notifications: Port<PolicyNotification> = Port::new();
    queue.set_policy_notification_port(notifications.clone());
    queue.suspend();
    // let the clock move so the rate is well defined
    std::thread::sleep(Duration::from_millis(20));

    let ran = Arc::new(AtomicUsize::new(0));
    // nothing admitted yet: rate is zero, under any bound
    assert_eq!(queue.enqueue(counting_task(&ran)), Ok(true));
    // now the average rate dwarfs the bound
    assert_eq!(queue.enqueue(counting_task(&ran)), Ok(false));
    assert_eq!(queue.count(), 1);
    assert!(matches!(
        notifications.try_take(),
        Some(PolicyNotification::Discarded(_))
    ));
    queue.resume();
    assert_eventually("survivor ran", || ran.load(Ordering::SeqCst) == 1);
    dispatcher.dispose();
}

#[test]
fn rate_throttle_unblocks_as_the_average_decays() {
    let dispatcher = dispatcher("policy-rate-throttle");
    let queue = DispatcherQueue::with_policy(
        "rated",
        &dispatcher,
        TaskExecutionPolicy::ConstrainSchedulingRateThrottleExecution { maximum_rate: 50.0 },
    )
    .expect("queue");
    queue.set_throttle_interval(Duration::from_millis(1));

    let ran = Arc::new(AtomicUsize::new(0));
    // the average rate spikes past 50/s, stalling, then decays with time
    for _ in 0..5 {
        assert_eq!(queue.enqueue(counting_task(&ran)), Ok(true));
    }
    assert_eventually("all ran", || ran.load(Ordering::SeqCst) == 5);
    assert_eq!(queue.scheduled_task_count(), 5);
    dispatcher.dispose();
}

#[test]
fn suspended_queue_holds_tasks_until_resume() {
    let dispatcher = dispatcher("queue-suspend");
    let queue = DispatcherQueue::new("main", &dispatcher).expect("queue");
    queue.suspend();
    assert!(queue.is_suspended());

    let ran = Arc::new(AtomicUsize::new(0));
    queue.enqueue(counting_task(&ran)).expect("enqueue");
    assert!(!wait_until(Duration::from_millis(100), || {
        ran.load(Ordering::SeqCst) > 0
    }));

    queue.resume();
    assert!(!queue.is_suspended());
    assert_eventually("task ran after resume", || ran.load(Ordering::SeqCst) == 1);
    dispatcher.dispose();
}

#[test]
fn timer_posts_the_deadline() {
    let dispatcher = dispatcher("queue-timer");
    let queue = DispatcherQueue::new("main", &dispatcher).expect("queue");
    let expiry: Port<Instant> = Port::new();

    let scheduled_at = Instant::now();
    queue.enqueue_timer(Duration::from_millis(20), &expiry);
    assert_eventually("timer fired", || !expiry.is_empty());
    let fired = expiry.try_take().expect("deadline");
    assert!(fired >= scheduled_at + Duration::from_millis(20));
    dispatcher.dispose();
}

#[test]
fn timers_keep_relative_order() {
    let dispatcher = dispatcher("queue-timer-order");
    let queue = DispatcherQueue::new("main", &dispatcher).expect("queue");
    let slow: Port<Instant> = Port::new();
    let fast: Port<Instant> = Port::new();

    queue.enqueue_timer(Duration::from_millis(200), &slow);
    queue.enqueue_timer(Duration::from_millis(10), &fast);
    assert_eventually("fast timer fired", || !fast.is_empty());
    assert!(slow.is_empty());
    assert_eventually("slow timer fired", || !slow.is_empty());
    dispatcher.dispose();
}

#[test]
fn disposed_queue_rejects_new_work() {
    let dispatcher = dispatcher("queue-disposed");
    let queue = DispatcherQueue::new("main", &dispatcher).expect("queue");
    queue.suspend();
    let ran = Arc::new(AtomicUsize::new(0));
    queue.enqueue(counting_task(&ran)).expect("enqueue");
    queue.dispose();

    assert!(queue.is_disposed());
    assert_eq!(queue.count(), 0);
    assert!(matches!(
        queue.enqueue(counting_task(&ran)),
        Err(QueueError::Disposed(_))
    ));
    // the queued task was dropped, not run
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    dispatcher.dispose();
}

#[test]
fn suppressed_dispose_errors_turn_into_quiet_rejection() {
    init_logging();
    let dispatcher = Dispatcher::with_options(
        2,
        "queue-disposed-quiet",
        DispatcherOptions {
            suppress_dispose_exceptions: true,
            ..DispatcherOptions::default()
        },
    );
    let queue = DispatcherQueue::new("main", &dispatcher).expect("queue");
    queue.dispose();
    let ran = Arc::new(AtomicUsize::new(0));
    assert_eq!(queue.enqueue(counting_task(&ran)), Ok(false));
    dispatcher.dispose();
}

#[test]
fn duplicate_queue_names_are_rejected() {
    let dispatcher = dispatcher("queue-dup");
    let _first = DispatcherQueue::new("main", &dispatcher).expect("queue");
    assert!(matches!(
        DispatcherQueue::new("main", &dispatcher),
        Err(QueueError::DuplicateName(_))
    ));
    assert_eq!(dispatcher.queue_names(), vec!["main".to_owned()]);
    dispatcher.dispose();
}
