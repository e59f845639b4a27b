use uuid::Uuid;

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Integrity and storage failures raised by the process repository.
///
/// Lifecycle transitions never produce these; an execution failure is an
/// [`ExecutionOutcome`](super::execution::ExecutionOutcome), not an error.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("client process not found: {0}")]
    NotFound(Uuid),

    #[error("client process already exists: {0}")]
    DuplicateId(Uuid),

    /// The stored row was deleted, already finalized with another outcome, or
    /// holds more attempts than the write. Single-writer-per-job is broken.
    #[error("client process {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
