//! Persistence layer: analysis records and chain analyses.

pub mod libsql_backend;
pub mod memory;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::AnalysisStore;
