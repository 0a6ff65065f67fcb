use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire evaluation module.
pub type Result<T> = std::result::Result<T, EvalErr>;

/// The evaluation module's error type.
#[derive(Debug)]
pub enum EvalErr {
    /// A parameter is out of range, unknown or not set up yet.
    Config(String),
    /// Arrays that must agree on their dimensions don't.
    Shape {
        what: &'static str,
        got: String,
        expected: String,
    },
    /// A statistic is undefined for the given data, e.g. a zero variance correlation.
    DegenerateStatistic(String),
    /// A model or attribution method failed on its own.
    Collaborator(String),
}

impl EvalErr {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn shape(what: &'static str, got: impl fmt::Debug, expected: impl fmt::Debug) -> Self {
        Self::Shape {
            what,
            got: format!("{got:?}"),
            expected: format!("{expected:?}"),
        }
    }
}

impl Display for EvalErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalErr::Config(msg) => write!(f, "invalid configuration: {msg}"),
            EvalErr::Shape {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch in {what}, got {got} and expected {expected}"),
            EvalErr::DegenerateStatistic(msg) => write!(f, "degenerate statistic: {msg}"),
            EvalErr::Collaborator(msg) => write!(f, "collaborator failure: {msg}"),
        }
    }
}

impl Error for EvalErr {}

impl From<ndarray::ShapeError> for EvalErr {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape {
            what: "array construction",
            got: err.to_string(),
            expected: "a consistent layout".into(),
        }
    }
}
