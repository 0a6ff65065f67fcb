mod adapter;
mod run;

pub use adapter::{Adapter, Plan};
pub use run::RunConfig;
