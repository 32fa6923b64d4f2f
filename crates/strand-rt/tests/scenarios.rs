//! Cross-primitive scenarios on the shared process-wide runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use strand_rt::sync::{AsyncMutex, Channel, ChannelError};
use strand_rt::Deadline;

#[test]
fn mutex_excludes_and_counts_across_tasks() {
    strand_rt::init(4);

    let mutex = Arc::new(AsyncMutex::new());
    let counter = Arc::new(AtomicU64::new(0));
    let in_critical = Arc::new(AtomicBool::new(false));

    let tasks = 4u64;
    let iters = 10_000u64;
    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            let in_critical = Arc::clone(&in_critical);
            strand_rt::spawn(move || {
                for _ in 0..iters {
                    let _guard = mutex.lock();
                    // Overlapping critical sections would trip this flag.
                    assert!(!in_critical.swap(true, Ordering::SeqCst));
                    counter.fetch_add(1, Ordering::SeqCst);
                    in_critical.store(false, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join();
    }
    assert_eq!(counter.load(Ordering::SeqCst), tasks * iters);
}

#[test]
fn channel_terminator_fans_in_exactly_once() {
    strand_rt::init(4);

    let chan = Channel::with_terminator(4, 0i64);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let chan = chan.clone();
            let seen = Arc::clone(&seen);
            strand_rt::spawn(move || loop {
                match chan.receive(Deadline::Inf) {
                    Ok(v) => seen.lock().push(v),
                    Err(ChannelError::Closed) => break,
                    Err(e) => panic!("unexpected receive failure: {}", e),
                }
            })
        })
        .collect();

    let producer = {
        let chan = chan.clone();
        strand_rt::spawn(move || {
            for i in 1..=20i64 {
                chan.publish(i).unwrap();
            }
            // The terminator value closes the stream for every reader.
            chan.publish(0).unwrap();
        })
    };

    producer.join();
    for consumer in consumers {
        consumer.join();
    }

    let mut values = seen.lock().clone();
    values.sort_unstable();
    assert_eq!(values, (1..=20).collect::<Vec<i64>>());
}

#[test]
fn sleeping_tasks_share_workers_with_busy_ones() {
    let sched = strand_rt::init(4);

    let finished = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for i in 0..20 {
        let finished = Arc::clone(&finished);
        handles.push(strand_rt::spawn(move || {
            if i % 2 == 0 {
                strand_rt::sleep(std::time::Duration::from_millis(20));
            } else {
                for _ in 0..10 {
                    strand_rt::yield_now();
                }
            }
            finished.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.join();
    }
    assert_eq!(finished.load(Ordering::SeqCst), 20);
    assert_eq!(sched.active_count(), 0);
}
