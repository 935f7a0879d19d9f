pub mod batcher;
pub mod catalog;
pub mod loaders;
pub mod providers;
pub mod sources;
pub mod storage;

pub use batcher::*;
pub use catalog::*;
pub use loaders::*;
pub use providers::*;
pub use sources::*;
pub use storage::*;
