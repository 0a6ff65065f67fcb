//! The per rank evaluation runtime.

mod builder;
pub mod client;
pub mod data;
mod error;
pub mod registry;
pub mod seeds;
pub mod sink;
pub mod task;
mod worker;

pub use builder::WorkerBuilder;
pub use error::{Result, WorkerErr};
pub use registry::Registry;
pub use seeds::{Seeds, Stream};
pub use sink::{LocalResultSink, NetSink, ResultSink};
pub use worker::Worker;
