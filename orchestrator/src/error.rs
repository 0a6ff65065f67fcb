use std::{fmt, io};

use results::ResultErr;
use worker::WorkerErr;

/// The orchestrator's result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All errors that can occur in the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before any worker is spawned.
    InvalidConfig(String),
    /// Failed to open the rendezvous address.
    ConnectionFailed { addr: String, source: io::Error },
    /// A worker went away without reporting `Done`.
    FatalWorkerFailure {
        rank: usize,
        /// The exit code, if the worker exited on its own.
        exit: Option<i32>,
        detail: String,
    },
    /// The workers didn't show up in time.
    Timeout(String),
    /// The inline worker failed.
    Worker(WorkerErr),
    /// Results could not be accumulated or persisted.
    Results(ResultErr),
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::ConnectionFailed { addr, source } => {
                write!(f, "connection failed to {addr}: {source}")
            }
            Self::FatalWorkerFailure { rank, exit, detail } => {
                write!(f, "worker {rank} failed")?;
                if let Some(code) = exit {
                    write!(f, " with exit code {code}")?;
                }
                write!(f, ": {detail}")
            }
            Self::Timeout(msg) => write!(f, "timed out: {msg}"),
            Self::Worker(e) => write!(f, "worker error: {e}"),
            Self::Results(e) => write!(f, "results error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectionFailed { source, .. } => Some(source),
            Self::Worker(e) => Some(e),
            Self::Results(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WorkerErr> for OrchestratorError {
    fn from(e: WorkerErr) -> Self {
        Self::Worker(e)
    }
}

impl From<ResultErr> for OrchestratorError {
    fn from(e: ResultErr) -> Self {
        Self::Results(e)
    }
}
