pub mod loader;
pub mod shard;

pub use loader::{Batch, ShardLoader};
pub use shard::{ShardSpec, shard_indices};
