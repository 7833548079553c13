pub mod config_manager;
pub mod connection;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;
pub mod versioning;

pub use config_manager::*;
pub use connection::*;
pub use error::*;
pub use logging::init_tracing;
pub use traits::*;
pub use types::*;
pub use versioning::*;
