#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use revstat::JobQueue;

#[test]
fn producer_never_blocks_and_backpressure_gates_workers() {
    let queue: Arc<JobQueue<u32, u32>> = Arc::new(JobQueue::new(4));

    // Putting 100 keys must not block before any consumer starts.
    queue.put(0..100);

    let worker = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut processed = 0u32;
            while let Some(key) = queue.get_arg() {
                queue.done(key, key + 1);
                processed += 1;
            }
            processed
        })
    };

    // With nobody reading results the worker stalls near the bound
    // instead of racing through all 100 keys.
    thread::sleep(Duration::from_millis(100));
    let done_early = worker.is_finished();
    assert!(!done_early, "worker ran past the backpressure bound");

    // Reading results releases the worker one slot at a time.
    for key in 0..100 {
        assert_eq!(queue.get_result(&key), Some(key + 1));
    }
    queue.stop();
    assert_eq!(worker.join().unwrap(), 100);
}

#[test]
fn many_consumers_block_until_their_key_resolves() {
    let queue: Arc<JobQueue<String, String>> = Arc::new(JobQueue::default());
    queue.put((0..16).map(|i| format!("key-{i}")));

    let consumers: Vec<_> = (0..16)
        .map(|i| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get_result(&format!("key-{i}")))
        })
        .collect();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                while let Some(key) = queue.get_arg() {
                    if key == "key-13" {
                        queue.failed(key);
                    } else {
                        let value = format!("value for {key}");
                        queue.done(key, value);
                    }
                }
            })
        })
        .collect();

    for (i, consumer) in consumers.into_iter().enumerate() {
        let result = consumer.join().unwrap();
        if i == 13 {
            assert_eq!(result, None);
        } else {
            assert_eq!(result, Some(format!("value for key-{i}")));
        }
    }

    queue.stop();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn stop_wakes_result_waiters_with_a_cancel() {
    let queue: Arc<JobQueue<u32, u32>> = Arc::new(JobQueue::default());
    queue.put([7u32]);

    let waiter = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.get_result(&7))
    };
    thread::sleep(Duration::from_millis(20));
    queue.stop();
    assert_eq!(waiter.join().unwrap(), None);
}
