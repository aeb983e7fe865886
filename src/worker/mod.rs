//! Batch execution.
//!
//! Core components:
//! - `scheduler`: bounded-concurrency batch runner with retry, timeout and shutdown
//! - `events`: broadcast progress events and live counters
//! - `state`: queued jobs, item outcomes, batch summaries

pub mod events;
pub mod scheduler;
pub mod state;

pub use events::{BatchEvent, ProgressCounters};
pub use scheduler::{BatchScheduler, PhaseCache, phase_cache};
pub use state::{BatchJob, BatchSummary, ItemOutcome, ItemReport};
