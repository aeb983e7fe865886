//! Adaptive multi-phase analysis pipeline.
//!
//! Every email flows through:
//! 1. `ChainAnalyzer::analyze()`: conversation completeness (once per chain)
//! 2. `RuleBasedAnalyzer::analyze()`: Phase 1, no model
//! 3. `PhaseRouter::route()`: decides whether inference is worth it
//! 4. `InferenceAnalyzer::analyze()`: Phase 2, then Phase 3 if re-routing asks for it
//! 5. `record::reduce()`: folds each result into a new record snapshot
//!
//! **Phase 3 never runs without Phase 2.** The routing plan type cannot express it.

pub mod chain;
pub mod entities;
pub mod processor;
pub mod record;
pub mod router;
pub mod rules;
pub mod types;
