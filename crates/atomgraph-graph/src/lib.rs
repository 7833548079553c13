pub mod deep;
pub mod dependency;
pub mod fusion;
pub mod gate;
pub mod pipeline;
pub mod purpose;
pub mod query;
pub mod snapshot;
pub mod update_scheduler;

pub use deep::DeepAnalysisClient;
pub use dependency::*;
pub use fusion::*;
pub use gate::*;
pub use pipeline::*;
pub use purpose::*;
pub use query::*;
pub use snapshot::KnowledgeSnapshot;
pub use update_scheduler::*;
