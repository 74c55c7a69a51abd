//! Error types surfaced by the queue.

/// Failure modes a caller of [`crate::scheduler::Scheduler`] may observe.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No pending work remains; the caller should stop polling.
    #[error("queue is drained")]
    Drained,

    /// `task_done`/`requeue` was called with a job the scheduler never handed out.
    #[error("job is not in flight")]
    NotInFlight,

    /// An operation was attempted after `close()`.
    #[error("queue is closed")]
    Closed,

    /// The embedded store returned an error; the enclosing transaction was aborted.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Opaque `data` payload failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Directory/file setup for a persistent store failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;
