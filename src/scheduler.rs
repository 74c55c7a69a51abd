//! The thread-safe scheduler.
//!
//! Two [`rusqlite::Connection`]s to the same database file are held behind
//! two separate [`Mutex`]es — one guarding producer (`put`) access, one
//! guarding consumer (`get`) access — so a burst of inserts never blocks a
//! waiting consumer thread, and vice versa. Admin operations that touch
//! both sides of the schema (`requeue`, `clear`, `cleanup`, `close`) take
//! both locks, always in the fixed order producer-then-consumer, to rule
//! out deadlock against any other caller.
//!
//! Consumers block on a [`Condvar`] rather than busy-polling. Every state
//! change that could make a blocked consumer eligible — an insert, a
//! `task_done`, a throttle expiring — ends with `notify_all` so no wakeup
//! is lost.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use rusqlite::Connection;

use crate::config::QueueOpts;
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::store::{self, Opened};
use crate::time::{now, TIMER_EPSILON};

struct ProducerState {
    conn: Connection,
    counter: i64,
}

struct ConsumerState {
    conn: Connection,
}

/// Bookkeeping for a job handed out by `get_nowait`/`try_get` but not yet
/// reported done: its queue `index` (for deletion) and the wall-clock time
/// it was dequeued (for the elapsed-time log at `task_done`).
struct Reservation {
    index: i64,
    started: f64,
}

/// A durable, concurrent job queue backed by an embedded SQLite store.
pub struct Scheduler {
    producer: Mutex<ProducerState>,
    consumer: Mutex<ConsumerState>,
    condvar: Condvar,
    opts: QueueOpts,
    // `Job`'s `Hash`/`Eq` depend only on `id`, which never changes after
    // construction, so the interior-mutable `domain` cache clippy warns
    // about here cannot affect map ordering.
    #[allow(clippy::mutable_key_type)]
    in_flight: Mutex<std::collections::HashMap<Job, Reservation>>,
    done_count: AtomicI64,
    closed: AtomicBool,
}

impl Scheduler {
    /// Opens, creates, or resumes the store described by `opts`.
    pub fn open(opts: QueueOpts) -> QueueResult<Self> {
        let Opened {
            put_conn,
            task_conn,
            counter,
        } = store::open(&opts)?;

        Ok(Self {
            producer: Mutex::new(ProducerState {
                conn: put_conn,
                counter,
            }),
            consumer: Mutex::new(ConsumerState { conn: task_conn }),
            condvar: Condvar::new(),
            opts,
            in_flight: Mutex::new(std::collections::HashMap::new()),
            done_count: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Enqueue a single job.
    pub fn put(&self, job: Job) -> QueueResult<()> {
        self.put_many(std::iter::once(job))
    }

    /// Enqueue many jobs in one transaction, each getting a fresh,
    /// monotonically increasing `index` for FIFO/LIFO tiebreaking.
    pub fn put_many(&self, jobs: impl IntoIterator<Item = Job>) -> QueueResult<()> {
        self.check_open()?;
        let mut state = self.producer.lock().unwrap();

        let start = state.counter;
        let mut count = 0i64;
        {
            let tx = state.conn.transaction()?;
            for (offset, job) in jobs.into_iter().enumerate() {
                store::insert_one(&tx, start + offset as i64, &job)?;
                count += 1;
            }
            tx.commit()?;
        }
        state.counter = start + count;
        drop(state);

        if count > 0 {
            tracing::debug!(count, "put_many enqueued jobs");
            self.condvar.notify_all();
        }
        Ok(())
    }

    /// Block until a job is eligible, or the queue is durably empty and
    /// nothing is in flight. Returns [`QueueError::Drained`] in
    /// the latter case, or [`QueueError::Closed`] if `close()` was called
    /// while waiting.
    pub fn get_nowait(&self) -> QueueResult<Job> {
        self.check_open()?;
        let mut consumer = self.consumer.lock().unwrap();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }

            if let Some((index, job)) = store::select_eligible(
                &consumer.conn,
                now(),
                self.opts.group_parallelism,
                self.opts.lifo,
            )? {
                store::mark_in_flight(&consumer.conn, index)?;
                if let Some(group) = &job.group {
                    store::increment_parallelism(&consumer.conn, group)?;
                }
                self.in_flight.lock().unwrap().insert(
                    job.clone(),
                    Reservation {
                        index,
                        started: now(),
                    },
                );
                tracing::debug!(id = %job.id, group = ?job.group, "selected job");
                return Ok(job);
            }

            let ready = store::count_ready(&consumer.conn)?;
            if ready == 0 {
                return Err(QueueError::Drained);
            }

            let wait = match store::min_throttle_timestamp(&consumer.conn)? {
                Some(ts) if ready > 0 => {
                    let delta = (ts - now()) + TIMER_EPSILON;
                    Some(Duration::from_secs_f64(delta.max(0.0)))
                }
                _ => None,
            };

            consumer = match wait {
                Some(d) => self.condvar.wait_timeout(consumer, d).unwrap().0,
                None => self.condvar.wait(consumer).unwrap(),
            };
        }
    }

    /// Non-blocking selection: returns `Ok(None)` immediately instead of
    /// waiting when pending-but-ineligible work remains, and still fails
    /// with [`QueueError::Drained`] once nothing is pending at all.
    pub fn try_get(&self) -> QueueResult<Option<Job>> {
        self.check_open()?;
        let consumer = self.consumer.lock().unwrap();

        if let Some((index, job)) = store::select_eligible(
            &consumer.conn,
            now(),
            self.opts.group_parallelism,
            self.opts.lifo,
        )? {
            store::mark_in_flight(&consumer.conn, index)?;
            if let Some(group) = &job.group {
                store::increment_parallelism(&consumer.conn, group)?;
            }
            self.in_flight.lock().unwrap().insert(
                job.clone(),
                Reservation {
                    index,
                    started: now(),
                },
            );
            tracing::debug!(id = %job.id, group = ?job.group, "selected job");
            return Ok(Some(job));
        }

        if store::count_ready(&consumer.conn)? == 0 {
            return Err(QueueError::Drained);
        }
        Ok(None)
    }

    /// Mark a job handed out by [`Scheduler::get_nowait`] or
    /// [`Scheduler::try_get`] as complete, releasing its parallelism slot
    /// and arming its group's throttle.
    pub fn task_done(&self, job: &Job) -> QueueResult<()> {
        self.check_open()?;
        let reservation = self
            .in_flight
            .lock()
            .unwrap()
            .remove(job)
            .ok_or(QueueError::NotInFlight)?;

        let consumer = self.consumer.lock().unwrap();
        store::delete_row(&consumer.conn, reservation.index)?;
        if let Some(group) = &job.group {
            store::decrement_parallelism(&consumer.conn, group)?;
            if self.opts.throttle > 0.0 {
                store::upsert_throttle(&consumer.conn, group, now() + self.opts.throttle)?;
            }
        }

        let done = self.done_count.fetch_add(1, Ordering::Relaxed) + 1;
        let ran_cleanup =
            self.opts.cleanup_interval > 0 && done % self.opts.cleanup_interval as i64 == 0;
        if ran_cleanup {
            store::cleanup(&consumer.conn)?;
        }
        drop(consumer);

        tracing::debug!(
            id = %job.id,
            elapsed_secs = now() - reservation.started,
            ran_cleanup,
            "task done"
        );
        self.condvar.notify_all();
        Ok(())
    }

    /// Return a job to the queue for another attempt, bumping `attempts`
    /// and assigning it a fresh index, instead of discarding it as
    /// [`Scheduler::task_done`] would. Takes both locks, in the fixed
    /// producer-then-consumer order, since it both frees in-flight state
    /// and allocates a new index.
    pub fn requeue(&self, job: &Job) -> QueueResult<()> {
        self.check_open()?;
        let mut producer = self.producer.lock().unwrap();
        let consumer = self.consumer.lock().unwrap();

        let reservation = self
            .in_flight
            .lock()
            .unwrap()
            .remove(job)
            .ok_or(QueueError::NotInFlight)?;

        store::delete_row(&consumer.conn, reservation.index)?;
        if let Some(group) = &job.group {
            store::decrement_parallelism(&consumer.conn, group)?;
        }

        let mut retried = job.clone();
        retried.attempts += 1;

        let new_index = producer.counter;
        store::insert_one(&producer.conn, new_index, &retried)?;
        producer.counter += 1;

        drop(consumer);
        drop(producer);

        self.condvar.notify_all();
        Ok(())
    }

    /// Number of ready (not in-flight) jobs.
    pub fn qsize(&self) -> QueueResult<i64> {
        self.check_open()?;
        let consumer = self.consumer.lock().unwrap();
        store::count_ready(&consumer.conn)
    }

    /// `true` once neither a ready job nor an in-flight job remains.
    pub fn is_drained(&self) -> QueueResult<bool> {
        Ok(self.qsize()? == 0 && self.in_flight.lock().unwrap().is_empty())
    }

    /// Groups with at least one job currently in flight, and their count.
    pub fn worked_groups(&self) -> QueueResult<Vec<(String, i64)>> {
        self.check_open()?;
        let consumer = self.consumer.lock().unwrap();
        store::worked_groups(&consumer.conn)
    }

    /// Clears throttle and parallelism bookkeeping without touching queued
    /// or in-flight jobs. Takes both locks since it is an admin
    /// operation in the same sense `requeue` is.
    pub fn clear(&self) -> QueueResult<()> {
        self.check_open()?;
        let producer = self.producer.lock().unwrap();
        let consumer = self.consumer.lock().unwrap();
        store::clear(&consumer.conn)?;
        drop(consumer);
        drop(producer);
        self.condvar.notify_all();
        Ok(())
    }

    /// Prunes expired throttle rows, zeroed parallelism counters, and
    /// vacuums the store. Normally triggered automatically every
    /// `cleanup_interval` completions, but exposed for callers that want
    /// to force it.
    pub fn cleanup(&self) -> QueueResult<()> {
        self.check_open()?;
        let producer = self.producer.lock().unwrap();
        let consumer = self.consumer.lock().unwrap();
        store::cleanup(&consumer.conn)?;
        drop(consumer);
        drop(producer);
        Ok(())
    }

    /// Wakes every thread blocked in [`Scheduler::get_nowait`]; subsequent
    /// calls to any operation return [`QueueError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOpts;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_then_get_round_trip() {
        let scheduler = Scheduler::open(QueueOpts::default()).unwrap();
        scheduler.put(Job::new("1", "https://example.com")).unwrap();

        let job = scheduler.get_nowait().unwrap();
        assert_eq!(job.id, "1");
        scheduler.task_done(&job).unwrap();
        assert!(scheduler.is_drained().unwrap());
    }

    #[test]
    fn drains_when_empty() {
        let scheduler = Scheduler::open(QueueOpts::default()).unwrap();
        assert!(matches!(scheduler.get_nowait(), Err(QueueError::Drained)));
    }

    #[test]
    fn try_get_fails_drained_when_nothing_pending() {
        let scheduler = Scheduler::open(QueueOpts::default()).unwrap();
        assert!(matches!(scheduler.try_get(), Err(QueueError::Drained)));
    }

    #[test]
    fn try_get_returns_none_without_blocking_when_ineligible() {
        let opts = QueueOpts::default().with_group_parallelism(1);
        let scheduler = Scheduler::open(opts).unwrap();
        scheduler
            .put_many(vec![
                Job::new("1", "https://a.example").with_group("g"),
                Job::new("2", "https://a.example").with_group("g"),
            ])
            .unwrap();

        scheduler.get_nowait().unwrap();
        assert!(scheduler.try_get().unwrap().is_none());
    }

    #[test]
    fn group_parallelism_caps_concurrent_in_flight() {
        let opts = QueueOpts::default().with_group_parallelism(1);
        let scheduler = Scheduler::open(opts).unwrap();
        scheduler
            .put_many(vec![
                Job::new("1", "https://a.example").with_group("g"),
                Job::new("2", "https://a.example").with_group("g"),
            ])
            .unwrap();

        let first = scheduler.get_nowait().unwrap();
        assert!(scheduler.try_get().unwrap().is_none());

        scheduler.task_done(&first).unwrap();
        let second = scheduler.try_get().unwrap().unwrap();
        assert_eq!(second.id, "2");
    }

    #[test]
    fn requeue_increments_attempts_and_reinserts() {
        let scheduler = Scheduler::open(QueueOpts::default()).unwrap();
        scheduler.put(Job::new("1", "https://example.com")).unwrap();

        let job = scheduler.get_nowait().unwrap();
        assert_eq!(job.attempts, 0);
        scheduler.requeue(&job).unwrap();

        let retried = scheduler.get_nowait().unwrap();
        assert_eq!(retried.id, "1");
        assert_eq!(retried.attempts, 1);
    }

    #[test]
    fn task_done_on_unknown_job_is_not_in_flight() {
        let scheduler = Scheduler::open(QueueOpts::default()).unwrap();
        let stray = Job::new("ghost", "https://example.com");
        assert!(matches!(
            scheduler.task_done(&stray),
            Err(QueueError::NotInFlight)
        ));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let opts = QueueOpts::default().with_group_parallelism(1);
        let scheduler = Arc::new(Scheduler::open(opts).unwrap());
        scheduler
            .put_many(vec![
                Job::new("1", "https://a.example").with_group("g"),
                Job::new("2", "https://a.example").with_group("g"),
            ])
            .unwrap();
        scheduler.get_nowait().unwrap(); // holds the only parallelism slot for "g"

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.get_nowait())
        };

        thread::sleep(Duration::from_millis(50));
        scheduler.close();

        assert!(matches!(waiter.join().unwrap(), Err(QueueError::Closed)));
    }
}
