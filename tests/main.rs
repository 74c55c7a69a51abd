//! Integration tests exercising the scheduler the way a real caller would:
//! through a freshly opened [`Scheduler`], never by poking the store
//! directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use crawlqueue::{Job, QueueError, QueueOpts, Scheduler};

#[test]
fn priority_then_fifo_ordering() {
    let scheduler = Scheduler::open(QueueOpts::default()).unwrap();
    scheduler
        .put_many(vec![
            Job::new("low-a", "https://a.example").with_priority(10),
            Job::new("high", "https://b.example").with_priority(0),
            Job::new("low-b", "https://c.example").with_priority(10),
        ])
        .unwrap();

    let first = scheduler.get_nowait().unwrap();
    assert_eq!(first.id, "high");

    let second = scheduler.get_nowait().unwrap();
    assert_eq!(second.id, "low-a");

    let third = scheduler.get_nowait().unwrap();
    assert_eq!(third.id, "low-b");
}

#[test]
fn lifo_reverses_same_priority_tiebreak() {
    let scheduler = Scheduler::open(QueueOpts::default().lifo()).unwrap();
    scheduler
        .put_many(vec![
            Job::new("first", "https://a.example"),
            Job::new("second", "https://b.example"),
        ])
        .unwrap();

    let job = scheduler.get_nowait().unwrap();
    assert_eq!(job.id, "second");
}

#[test]
fn group_parallelism_blocks_until_a_slot_frees() {
    let opts = QueueOpts::default().with_group_parallelism(2);
    let scheduler = Scheduler::open(opts).unwrap();
    scheduler
        .put_many((0..3).map(|i| Job::new(format!("{i}"), "https://a.example").with_group("g")))
        .unwrap();

    let a = scheduler.get_nowait().unwrap();
    let _b = scheduler.get_nowait().unwrap();
    assert!(scheduler.try_get().unwrap().is_none());

    scheduler.task_done(&a).unwrap();
    let c = scheduler.get_nowait().unwrap();
    assert_eq!(c.id, "2");
}

#[test]
fn throttle_delays_same_group_reselection() {
    let opts = QueueOpts::default().with_throttle(0.2);
    let scheduler = Scheduler::open(opts).unwrap();
    scheduler
        .put_many(vec![
            Job::new("1", "https://a.example").with_group("g"),
            Job::new("2", "https://a.example").with_group("g"),
        ])
        .unwrap();

    let first = scheduler.get_nowait().unwrap();
    scheduler.task_done(&first).unwrap();

    let started = std::time::Instant::now();
    let second = scheduler.get_nowait().unwrap();
    assert_eq!(second.id, "2");
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[test]
fn requeue_allows_a_retried_job_to_be_picked_up_again() {
    let scheduler = Scheduler::open(QueueOpts::default()).unwrap();
    scheduler.put(Job::new("1", "https://example.com")).unwrap();

    let job = scheduler.get_nowait().unwrap();
    scheduler.requeue(&job).unwrap();

    let retried = scheduler.get_nowait().unwrap();
    assert_eq!(retried.attempts, 1);
    scheduler.task_done(&retried).unwrap();
    assert!(scheduler.is_drained().unwrap());
}

#[test]
fn blocked_consumer_wakes_when_a_slot_frees_via_task_done() {
    let opts = QueueOpts::default().with_group_parallelism(1);
    let scheduler = Arc::new(Scheduler::open(opts).unwrap());
    scheduler
        .put_many(vec![
            Job::new("1", "https://a.example").with_group("g"),
            Job::new("2", "https://a.example").with_group("g"),
        ])
        .unwrap();

    let held = scheduler.get_nowait().unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let scheduler = Arc::clone(&scheduler);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let job = scheduler.get_nowait().unwrap();
            done.store(1, Ordering::SeqCst);
            job
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(done.load(Ordering::SeqCst), 0);

    scheduler.task_done(&held).unwrap();
    let job = waiter.join().unwrap();
    assert_eq!(job.id, "2");
}

#[test]
fn resume_recovers_unfinished_work_after_reopen() {
    let dir = tempdir().unwrap();
    let opts = QueueOpts::default().with_path(dir.path());

    {
        let scheduler = Scheduler::open(opts.clone()).unwrap();
        scheduler
            .put_many(vec![
                Job::new("a", "https://example.com"),
                Job::new("b", "https://example.com"),
            ])
            .unwrap();
        let _in_flight = scheduler.get_nowait().unwrap(); // never finished, simulating a crash
    }

    let resumed = Scheduler::open(opts.resuming()).unwrap();
    assert_eq!(resumed.qsize().unwrap(), 2);
}

#[test]
fn concurrent_producers_and_consumers_drain_exactly_once_each() {
    let scheduler = Arc::new(Scheduler::open(QueueOpts::default()).unwrap());
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let total = 40;

    let ids: Vec<String> = (0..total).map(|i| format!("job-{i}")).collect();
    let mut shuffled = ids.clone();
    {
        use rand::seq::SliceRandom;
        shuffled.shuffle(&mut rng);
    }

    scheduler
        .put_many(shuffled.into_iter().map(|id| Job::new(id, "https://example.com")))
        .unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let seen = Arc::clone(&seen);
            thread::spawn(move || loop {
                match scheduler.get_nowait() {
                    Ok(job) => {
                        seen.lock().unwrap().push(job.id.clone());
                        scheduler.task_done(&job).unwrap();
                    }
                    Err(QueueError::Drained) => break,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            })
        })
        .collect();

    for consumer in consumers {
        consumer.join().unwrap();
    }

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    let mut expected = ids;
    expected.sort();
    assert_eq!(seen, expected);
    assert!(scheduler.is_drained().unwrap());
}
