#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use slotflow::{
    handoff::{CountingSync, Mailbox, Outcome, completion},
    slot::{Slot, StateCounter},
    tensor::{Shape, Tensor},
};
use std::{sync::Arc, thread};

#[test]
fn mailbox_rejects_second_value_until_taken() {
    let mailbox = Mailbox::new();
    assert!(!mailbox.is_occupied());
    assert_eq!(mailbox.try_take(), None::<u32>);

    assert_eq!(mailbox.try_put(1), Ok(()));
    assert!(mailbox.is_occupied());
    assert_eq!(mailbox.try_put(2), Err(2));

    assert_eq!(mailbox.try_take(), Some(1));
    assert_eq!(mailbox.try_put(2), Ok(()));
    assert_eq!(mailbox.take(), 2);
}

#[test]
fn mailbox_drops_unclaimed_value() {
    let marker = Arc::new(());
    {
        let mailbox = Mailbox::new();
        mailbox.put(marker.clone());
        assert_eq!(Arc::strong_count(&marker), 2);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}

#[test]
fn mailbox_put_waits_for_consumer() {
    let mailbox = Arc::new(Mailbox::new());
    let producer = {
        let mailbox = mailbox.clone();
        thread::spawn(move || {
            for value in 0..100u32 {
                mailbox.put(value);
            }
        })
    };
    let received: Vec<u32> = (0..100).map(|_| mailbox.take()).collect();
    producer.join().expect("producer panicked");
    assert_eq!(received, (0..100).collect::<Vec<_>>());
}

#[test]
fn counting_sync_flips_on_last_delivery() {
    let barrier = CountingSync::new(3);
    assert_eq!(barrier.expected(), 3);
    assert!(!barrier.notify_finish());
    assert!(!barrier.notify_finish());
    assert!(!barrier.is_ready());
    assert!(barrier.notify_finish());
    assert!(barrier.is_ready());
    assert_eq!(barrier.delivered(), 3);

    barrier.reset();
    assert!(!barrier.is_ready());
    assert_eq!(barrier.delivered(), 0);
}

#[test]
fn counting_sync_with_zero_expected_is_ready() {
    let barrier = CountingSync::new(0);
    assert!(barrier.is_ready());
    barrier.wait_until_ready();
}

#[test]
fn counting_sync_waits_for_threads() {
    let barrier = Arc::new(CountingSync::new(4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.notify_finish();
            })
        })
        .collect();
    barrier.wait_until_ready();
    assert_eq!(barrier.delivered(), 4);
    for worker in workers {
        worker.join().expect("worker panicked");
    }
}

#[test]
fn completion_outcomes() {
    let (done, handle) = completion();
    assert!(!handle.is_complete());
    done.finish();
    assert!(handle.is_complete());
    assert_eq!(handle.wait(), Outcome::Finished);

    let (done, handle) = completion();
    done.fail("out of memory");
    assert_eq!(
        handle.wait().into_result(),
        Err("out of memory".to_owned())
    );

    let (done, handle) = completion();
    drop(done);
    assert_eq!(handle.try_wait(), Some(Outcome::Abandoned));
    assert!(Outcome::Abandoned.into_result().is_err());
}

#[test]
fn completion_across_threads() {
    let (done, handle) = completion();
    let worker = thread::spawn(move || done.finish());
    assert_eq!(handle.wait(), Outcome::Finished);
    worker.join().expect("worker panicked");
}

#[test]
fn slot_versions_advance_once_per_write() {
    let counter = StateCounter::new();
    assert_eq!(counter.get(), 0);
    assert_eq!(counter.increment(), 1);
    assert_eq!(counter.get(), 1);

    let shape = Shape::from([2, 3]);
    let mut slot = Slot::new(Tensor::<f32>::zeros(shape.clone(), 1, Default::default()));
    assert_eq!(slot.version(), 0);

    let data = Tensor::from_vec(shape.clone(), 1, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(slot.copy_from(&data), 1);
    let (tensor, version) = slot.read();
    assert_eq!(tensor, &data);
    assert_eq!(version, 1);

    assert_eq!(slot.write(Tensor::zeros(shape, 1, Default::default())), 2);
    assert!(slot.tensor().data().iter().all(|&x| x == 0.0));

    slot.tensor_mut().fill(7.0);
    assert_eq!(slot.version(), 2, "in-place edits do not publish");
    assert_eq!(slot.publish(), 3);

    let seed = Slot::<f32>::seed();
    assert!(seed.tensor().data().is_empty());
    assert_eq!(seed.publish(), 1);
}
