//! Wire-level descriptions of everything a worker needs to build itself.
//!
//! Specs only name components and carry their parameters, workers resolve
//! them against their own registry. No pre-built object ever crosses the wire.

mod masking;
mod task;
mod worker;

pub use masking::{BaselineSpec, MaskerSpec, SegmenterSpec};
pub use task::{ModeSpec, PerturbationSpec, TaskSpec};
pub use worker::{ComponentSpec, WorkerSpec};
