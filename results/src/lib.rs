//! Hierarchical per sample results and their persistence.

mod batch;
mod error;
mod store;
mod tree;

pub use batch::{BatchResult, Node};
pub use error::{Result, ResultErr};
pub use store::{ResultSet, load_f32_tensors, save_selection};
pub use tree::{Level, ResultTree};
