use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use pcp::harness::scenario::{self, A, B, C};
use pcp::{Arbiter, ArbiterError, ArbiterEvent, MemorySink, ResourceId, SimulatedPriority};

fn arbiter() -> (Arbiter, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let arbiter = Arbiter::with_sink(scenario::registry().unwrap(), sink.clone());
    (arbiter, sink)
}

#[test]
fn low_task_blocks_high_task_until_release() {
    let (arbiter, sink) = arbiter();
    let task1 = arbiter.register_task("Task1", SimulatedPriority::new(5));
    let task4 = arbiter.register_task("Task4", SimulatedPriority::new(2));

    arbiter.acquire(A, task4, None).unwrap();
    assert_eq!(arbiter.priority(task4).unwrap(), 4);
    arbiter.acquire(B, task4, None).unwrap();
    assert_eq!(arbiter.priority(task4).unwrap(), 5);

    let (tx, rx) = channel::unbounded();
    thread::scope(|s| {
        let arbiter = &arbiter;
        s.spawn(move || {
            arbiter.acquire(B, task1, None).unwrap();
            tx.send(arbiter.priority(task1).unwrap()).unwrap();
            arbiter.release(B, task1).unwrap();
        });

        // Task1 stays blocked while Task4 holds B
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(arbiter.owner(B).unwrap(), Some(task4));

        arbiter.release(B, task4).unwrap();
        assert_eq!(arbiter.priority(task4).unwrap(), 4);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
    });

    arbiter.release(A, task4).unwrap();
    assert_eq!(arbiter.priority(task4).unwrap(), 2);
    assert_eq!(arbiter.priority(task1).unwrap(), 5);

    for res in [A, B, C] {
        assert_eq!(arbiter.owner(res).unwrap(), None);
    }

    let task4_events: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.task() == task4)
        .collect();
    assert_eq!(task4_events.len(), 4);
    assert!(task4_events.iter().all(|e| e.changes_priority()));
}

#[test]
fn priority_equal_to_ceiling_is_not_changed() {
    let (arbiter, sink) = arbiter();
    let task2 = arbiter.register_task("Task2", SimulatedPriority::new(4));

    arbiter.acquire(A, task2, None).unwrap();
    assert_eq!(arbiter.priority(task2).unwrap(), 4);
    arbiter.release(A, task2).unwrap();
    assert_eq!(arbiter.priority(task2).unwrap(), 4);

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| !e.changes_priority()));
    assert!(matches!(
        events[0],
        ArbiterEvent::Acquired { from: 4, to: 4, ceiling: 4, .. }
    ));
    assert!(matches!(events[1], ArbiterEvent::Released { from: 4, to: 4, .. }));
}

#[test]
fn release_restores_priority_seen_before_acquire() {
    let (arbiter, _) = arbiter();

    for base in 1..=6 {
        let task = arbiter.register_task("sampler", SimulatedPriority::new(base));
        for res in [A, B, C] {
            let before = arbiter.priority(task).unwrap();
            arbiter.acquire(res, task, None).unwrap();
            let ceiling = arbiter.registry().ceiling(res).unwrap();
            assert!(arbiter.priority(task).unwrap() >= ceiling);
            arbiter.release(res, task).unwrap();
            assert_eq!(arbiter.priority(task).unwrap(), before);
        }
    }
}

#[test]
fn contended_acquire_times_out_cleanly() {
    let (arbiter, sink) = arbiter();
    let owner = arbiter.register_task("Task4", SimulatedPriority::new(2));
    let waiter = arbiter.register_task("Task1", SimulatedPriority::new(5));

    arbiter.acquire(C, owner, None).unwrap();
    sink.take();

    let start = std::time::Instant::now();
    let err = thread::scope(|s| {
        s.spawn(|| arbiter.acquire(C, waiter, Some(Duration::from_millis(50))))
            .join()
            .unwrap()
            .unwrap_err()
    });

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(matches!(err, ArbiterError::TimedOut { resource, .. } if resource == C));
    assert_eq!(arbiter.owner(C).unwrap(), Some(owner));
    assert_eq!(arbiter.priority(waiter).unwrap(), 5);
    assert!(sink.events().is_empty());
}

#[test]
fn faults_are_reported_not_absorbed() {
    let (arbiter, _) = arbiter();
    let task = arbiter.register_task("Task3", SimulatedPriority::new(3));
    let other = arbiter.register_task("Task2", SimulatedPriority::new(4));

    assert!(matches!(
        arbiter.acquire(ResourceId::new("D"), task, None),
        Err(ArbiterError::InvalidResource(_))
    ));

    arbiter.acquire(B, task, None).unwrap();
    arbiter.acquire(A, task, None).unwrap();

    assert!(matches!(
        arbiter.acquire(A, task, Some(Duration::ZERO)),
        Err(ArbiterError::AlreadyOwned { .. })
    ));
    assert!(matches!(
        arbiter.release(B, task),
        Err(ArbiterError::OutOfOrder { .. })
    ));
    assert!(matches!(
        arbiter.release(A, other),
        Err(ArbiterError::NotOwner { .. })
    ));

    assert_eq!(arbiter.held(task).unwrap(), vec![B, A]);
    arbiter.release(A, task).unwrap();
    arbiter.release(B, task).unwrap();
    assert_eq!(arbiter.priority(task).unwrap(), 3);
}

#[test]
fn independent_arbiters_do_not_interfere() {
    let (first, _) = arbiter();
    let (second, _) = arbiter();
    let t1 = first.register_task("Task4", SimulatedPriority::new(2));
    let t2 = second.register_task("Task4", SimulatedPriority::new(2));

    first.acquire(A, t1, None).unwrap();
    second.acquire(A, t2, Some(Duration::ZERO)).unwrap();

    first.release(A, t1).unwrap();
    second.release(A, t2).unwrap();
}
