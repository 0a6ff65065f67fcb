use std::{error::Error, fmt, io};

use evaluation::EvalErr;
use results::ResultErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Eval(EvalErr),
    Results(ResultErr),
    UnknownComponent {
        kind: &'static str,
        name: String,
    },
    InvalidParams {
        component: String,
        source: serde_json::Error,
    },
    InvalidSpec(String),
    UnexpectedMessage(String),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Eval(e) => write!(f, "evaluation failed: {e}"),
            WorkerErr::Results(e) => write!(f, "result handling failed: {e}"),
            WorkerErr::UnknownComponent { kind, name } => {
                write!(f, "no {kind} named {name:?} is registered")
            }
            WorkerErr::InvalidParams { component, source } => {
                write!(f, "invalid parameters for {component:?}: {source}")
            }
            WorkerErr::InvalidSpec(msg) => write!(f, "invalid worker spec: {msg}"),
            WorkerErr::UnexpectedMessage(msg) => write!(f, "unexpected message: {msg}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Eval(e) => Some(e),
            WorkerErr::Results(e) => Some(e),
            WorkerErr::InvalidParams { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EvalErr> for WorkerErr {
    fn from(value: EvalErr) -> Self {
        Self::Eval(value)
    }
}

impl From<ResultErr> for WorkerErr {
    fn from(value: ResultErr) -> Self {
        Self::Results(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
