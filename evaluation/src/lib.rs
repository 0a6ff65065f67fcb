//! Metrics for judging attribution maps of image classifiers.

mod activation;
pub mod builtin;
mod error;
pub mod masking;
pub mod metrics;
mod model;
mod schedule;
pub mod segmentation;
pub mod stats;

pub use activation::ActivationFn;
pub use error::{EvalErr, Result};
pub use model::{AttributionMethod, Dataset, Model, gather, predictions};
pub use schedule::Schedule;
