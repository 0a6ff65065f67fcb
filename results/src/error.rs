use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

/// The result type used across result trees and their persistence.
pub type Result<T> = std::result::Result<T, ResultErr>;

/// The results module's error type.
#[derive(Debug)]
pub enum ResultErr {
    /// A selector or payload names a level key the tree doesn't have.
    UnknownKey { level: String, key: String },
    /// A selector names a level the tree doesn't have.
    UnknownLevel(String),
    /// Levels or keys can't describe a tree.
    InvalidLayout(String),
    /// A payload doesn't fit the tree or the leaf it goes into.
    Shape(String),
    /// Appended index ranges don't cover `[0, n)` exactly once.
    Coverage(String),
    /// A persisted file is not a valid result set.
    InvalidResultFile(String),
    Io { path: PathBuf, source: io::Error },
}

impl Display for ResultErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultErr::UnknownKey { level, key } => {
                write!(f, "unknown key {key:?} for level {level:?}")
            }
            ResultErr::UnknownLevel(level) => write!(f, "unknown level {level:?}"),
            ResultErr::InvalidLayout(msg) => write!(f, "invalid tree layout: {msg}"),
            ResultErr::Shape(msg) => write!(f, "shape mismatch: {msg}"),
            ResultErr::Coverage(msg) => write!(f, "incomplete results: {msg}"),
            ResultErr::InvalidResultFile(msg) => write!(f, "invalid result file: {msg}"),
            ResultErr::Io { path, source } => write!(f, "failed to access {}: {source}", path.display()),
        }
    }
}

impl Error for ResultErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ResultErr::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<safetensors::SafeTensorError> for ResultErr {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Self::InvalidResultFile(format!("{err:?}"))
    }
}
