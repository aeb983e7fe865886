//! mailflow: adaptive multi-phase email workflow analysis.

pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod store;
pub mod worker;
