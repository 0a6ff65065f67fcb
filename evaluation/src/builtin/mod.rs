//! Ready made components for runs that don't bring their own.

mod datasets;
mod methods;
mod models;

pub use datasets::InMemoryDataset;
pub use methods::{Occlusion, RandomAttribution};
pub use models::LinearClassifier;
