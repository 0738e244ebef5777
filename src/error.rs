use thiserror::Error;

use crate::browser::BrowserError;
use crate::scheduler::callbacks::{CallbackRef, HandlerKind};
use crate::scheduler::job::JobId;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool has been shut down")]
    AlreadyShutdown,

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job has been marked as done: {0}")]
    AlreadyDone(JobId),

    #[error("Unknown engine: {0} (supported engines: chrome, firefox)")]
    UnknownEngine(String),

    #[error("Callback could not be resolved: {0}")]
    UnknownCallback(CallbackRef),

    #[error("Callback {callback} is a {found}, expected a {expected}")]
    CallbackKind {
        callback: CallbackRef,
        expected: HandlerKind,
        found: HandlerKind,
    },

    /// A spilled job could not be read back from disk.
    #[error("Queued job {id} is unreadable: {reason}")]
    LostJob { id: JobId, reason: String },

    #[error("Could not start the engine process: {0}")]
    Spawn(String),

    #[error("Worker {id} failed: {reason}")]
    Worker { id: usize, reason: String },

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
