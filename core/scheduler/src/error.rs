use thiserror::Error;

/// Scheduler error taxonomy
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("wrong status: {0}")]
    WrongStatus(&'static str),

    #[error("invalid block number {number}, expected {expected}")]
    InvalidBlockNumber { number: u64, expected: u64 },

    #[error("no blocks queued for commit")]
    InvalidBlocks,

    #[error("key lock table invariant violated: {0}")]
    UnexpectedKeyLock(String),

    #[error("batch finished with {failed} failed transaction(s)")]
    Batch { failed: usize },

    #[error("deadlock detected between waiting contexts")]
    DeadlockDetected,

    #[error("executor already registered: {0}")]
    DuplicateExecutor(String),

    #[error("executor not found: {0}")]
    ExecutorNotFound(String),

    #[error("no executor registered")]
    NoExecutor,

    #[error("next block notification failed: {0}")]
    NextBlock(String),

    #[error("prepare failed: {0}")]
    Prewrite(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown scheduler error: {0}")]
    Unknown(String),
}
