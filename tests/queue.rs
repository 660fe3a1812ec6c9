#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use slotflow::{
    handoff::CountingSync,
    queue::{Task, TaskKind, TaskQueue, TaskWrapper},
    types::{NodeId, UnitType},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

#[test]
fn try_operations_respect_capacity() {
    let queue = TaskQueue::new(2);
    assert_eq!(queue.capacity(), 2);
    assert!(queue.is_empty());

    assert_eq!(queue.try_enqueue(1), Ok(()));
    assert_eq!(queue.try_enqueue(2), Ok(()));
    assert_eq!(queue.try_enqueue(3), Err(3));
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.try_dequeue(), Some(1));
    assert_eq!(queue.try_enqueue(3), Ok(()));
    assert_eq!(queue.try_dequeue(), Some(2));
    assert_eq!(queue.try_dequeue(), Some(3));
    assert_eq!(queue.try_dequeue(), None);
}

#[test]
fn zero_capacity_is_raised_to_one() {
    let queue = TaskQueue::new(0);
    assert_eq!(queue.capacity(), 1);
    assert_eq!(queue.try_enqueue('a'), Ok(()));
    assert_eq!(queue.try_enqueue('b'), Err('b'));
}

#[test]
fn fifo_across_many_laps() {
    let queue = TaskQueue::new(3);
    for value in 0..100 {
        queue.enqueue(value);
        assert_eq!(queue.dequeue(), value);
    }
}

#[test]
fn single_producer_single_consumer_preserves_order() {
    let queue = Arc::new(TaskQueue::new(4));
    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for value in 0..1_000u32 {
                queue.enqueue(value);
            }
        })
    };
    let received: Vec<u32> = (0..1_000).map(|_| queue.dequeue()).collect();
    producer.join().expect("producer panicked");
    assert_eq!(received, (0..1_000).collect::<Vec<_>>());
}

#[test]
fn enqueue_blocks_while_full() {
    let queue = Arc::new(TaskQueue::new(1));
    queue.enqueue(1u32);

    let enqueued = Arc::new(AtomicBool::new(false));
    let producer = {
        let queue = queue.clone();
        let enqueued = enqueued.clone();
        thread::spawn(move || {
            queue.enqueue(2);
            enqueued.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!enqueued.load(Ordering::SeqCst), "enqueue must wait for room");

    assert_eq!(queue.dequeue(), 1);
    producer.join().expect("producer panicked");
    assert!(enqueued.load(Ordering::SeqCst));
    assert_eq!(queue.dequeue(), 2);
}

#[test]
fn many_producers_many_consumers_deliver_each_item_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 500;

    let queue = Arc::new(TaskQueue::new(8));
    let sum = Arc::new(AtomicUsize::new(0));
    let count = Arc::new(AtomicUsize::new(0));

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            let sum = sum.clone();
            let count = count.clone();
            thread::spawn(move || {
                while let Some(value) = queue.dequeue() {
                    sum.fetch_add(value, Ordering::Relaxed);
                    count.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue(Some(p * PER_PRODUCER + i));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer panicked");
    }
    for _ in 0..consumers.len() {
        queue.enqueue(None);
    }
    for consumer in consumers {
        consumer.join().expect("consumer panicked");
    }

    let total = PRODUCERS * PER_PRODUCER;
    assert_eq!(count.load(Ordering::Relaxed), total);
    assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
}

#[test]
fn join_sentinel_stops_workers() {
    let queue = Arc::new(TaskQueue::new(4));
    let barrier = Arc::new(CountingSync::new(3));
    let node = NodeId::new(UnitType::Elementwise, 0);
    let ran = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        let worker = scope.spawn(|| {
            let mut handled = 0;
            loop {
                match queue.dequeue() {
                    Task::Join => break handled,
                    Task::Run(task) => {
                        assert_eq!(task.kind(), TaskKind::ComputeHidden);
                        assert_eq!(task.node(), node);
                        task.execute().expect("task must not panic");
                        handled += 1;
                    }
                }
            }
        });

        for _ in 0..3 {
            let ran = ran.clone();
            let task = TaskWrapper::new(TaskKind::ComputeHidden, node, barrier.clone(), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            queue.enqueue(Task::Run(task));
        }
        barrier.wait_until_ready();
        queue.enqueue(Task::Join);

        assert_eq!(worker.join().expect("worker panicked"), 3);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 3);
}

#[test]
fn panicking_task_still_notifies_barrier() {
    let barrier = Arc::new(CountingSync::new(1));
    let node = NodeId::new(UnitType::Copy, 7);
    let task = TaskWrapper::new(TaskKind::Copy, node, barrier.clone(), || {
        panic!("kernel exploded");
    });

    let message = task.execute().expect_err("panic must be reported");
    assert_eq!(message, "kernel exploded");
    assert!(barrier.is_ready());
}

#[test]
fn dropping_queue_drops_pending_items() {
    let marker = Arc::new(());
    {
        let queue = TaskQueue::new(4);
        queue.enqueue(marker.clone());
        queue.enqueue(marker.clone());
        assert_eq!(Arc::strong_count(&marker), 3);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}
