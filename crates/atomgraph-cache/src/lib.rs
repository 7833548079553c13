pub mod cache;
pub mod storage;
pub mod store;

pub use cache::*;
pub use storage::*;
pub use store::*;
