#![allow(missing_docs)]
#![cfg(feature = "loom")]

use loom::{sync::Arc, thread};
use slotflow::{
    handoff::{CountingSync, Mailbox, Outcome, completion},
    queue::TaskQueue,
};

#[test]
fn loom_queue_spsc_preserves_order() {
    loom::model(|| {
        let queue = Arc::new(TaskQueue::new(2));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for value in 1..=3u32 {
                    queue.enqueue(value);
                }
            })
        };

        // Capacity 2 with 3 items forces the producer to wait for a dequeue.
        let received: Vec<u32> = (0..3).map(|_| queue.dequeue()).collect();
        producer.join().unwrap();

        assert_eq!(received, vec![1, 2, 3]);
        assert!(queue.try_dequeue().is_none());
    });
}

#[test]
fn loom_queue_two_producers_deliver_each_item_once() {
    loom::model(|| {
        let queue = Arc::new(TaskQueue::new(2));

        let producers: Vec<_> = [10u32, 20]
            .into_iter()
            .map(|value| {
                let queue = queue.clone();
                thread::spawn(move || queue.enqueue(value))
            })
            .collect();

        let mut received = vec![queue.dequeue(), queue.dequeue()];
        for producer in producers {
            producer.join().unwrap();
        }
        received.sort_unstable();

        assert_eq!(received, vec![10, 20]);
        assert!(queue.is_empty());
    });
}

#[test]
fn loom_mailbox_hands_value_across_threads() {
    loom::model(|| {
        let mailbox = Arc::new(Mailbox::new());

        let producer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                mailbox.put(vec![1u8, 2, 3]);
                // Second put waits until the consumer takes the first.
                mailbox.put(vec![4u8]);
            })
        };

        let first = mailbox.take();
        let second = mailbox.take();
        producer.join().unwrap();

        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![4]);
        assert!(!mailbox.is_occupied());
    });
}

#[test]
fn loom_counting_sync_ready_after_all_deliveries() {
    loom::model(|| {
        let barrier = Arc::new(CountingSync::new(2));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || barrier.notify_finish())
            })
            .collect();

        barrier.wait_until_ready();
        let finishers = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .filter(|&last| last)
            .count();

        assert_eq!(barrier.delivered(), 2);
        // Exactly one delivery observes the barrier becoming ready.
        assert_eq!(finishers, 1);
    });
}

#[test]
fn loom_completion_reports_outcome() {
    loom::model(|| {
        let (done, handle) = completion();

        let worker = thread::spawn(move || done.finish());

        assert_eq!(handle.wait(), Outcome::Finished);
        worker.join().unwrap();
    });
}
