//! Item lifecycle types: queued jobs, terminal outcomes, batch summaries.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::cache::CacheStats;
use crate::pipeline::record::{AnalysisRecord, AnalysisStatus};
use crate::pipeline::types::{ChainAnalysis, Email, Phase, Priority, WorkflowState};
use crate::worker::events::ProgressCounters;

/// Maximum sample error messages kept in a [`BatchSummary`].
pub const MAX_SAMPLE_ERRORS: usize = 5;

/// Terminal state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Every planned phase completed and the record was persisted.
    Succeeded,
    /// Validation, a phase, or persistence failed.
    Failed,
    /// Never started, interrupted by shutdown, or aborted after the grace period.
    Cancelled,
}

impl ItemOutcome {
    /// Outcome implied by a persisted record.
    pub fn from_status(status: AnalysisStatus) -> Self {
        match status {
            AnalysisStatus::Complete => Self::Succeeded,
            AnalysisStatus::Error => Self::Failed,
            AnalysisStatus::Pending | AnalysisStatus::Partial => Self::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub email: Email,
    pub chain: Arc<ChainAnalysis>,
    /// Backend retries spent on this item so far.
    pub retries: u32,
}

impl BatchJob {
    pub fn new(email: Email, chain: Arc<ChainAnalysis>) -> Self {
        Self {
            email,
            chain,
            retries: 0,
        }
    }
}

/// Per-item line of a [`BatchSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub email_id: String,
    pub outcome: ItemOutcome,
    /// Status of the persisted record, if one was written.
    pub status: Option<AnalysisStatus>,
    pub phases_completed: Vec<Phase>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    /// Most refined priority the item reached.
    pub priority: Option<Priority>,
    pub workflow_state: Option<WorkflowState>,
    pub summary: Option<String>,
    pub retries: u32,
    /// Phases whose result came from the cache.
    pub cache_hits: u32,
    #[serde(with = "crate::pipeline::types::duration_ms")]
    pub elapsed: Duration,
}

impl ItemReport {
    /// Report for an item that never ran.
    pub fn cancelled(email_id: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            email_id: email_id.into(),
            outcome: ItemOutcome::Cancelled,
            status: None,
            phases_completed: Vec::new(),
            failed_phase: None,
            error: reason,
            priority: None,
            workflow_state: None,
            summary: None,
            retries: 0,
            cache_hits: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Report derived from the final record of an item.
    pub fn from_record(record: &AnalysisRecord, persisted: bool, retries: u32, cache_hits: u32, elapsed: Duration) -> Self {
        Self {
            email_id: record.email_id.clone(),
            outcome: ItemOutcome::from_status(record.status),
            status: persisted.then_some(record.status),
            phases_completed: record.phases_completed.clone(),
            failed_phase: record.failed_phase,
            error: record.error.clone(),
            priority: record.final_priority(),
            workflow_state: record.final_workflow_state(),
            summary: record.final_summary().map(str::to_string),
            retries,
            cache_hits,
            elapsed,
        }
    }
}

/// Result of one `run_batch` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub counters: ProgressCounters,
    pub items: Vec<ItemReport>,
    /// First few error messages, in completion order.
    pub sample_errors: Vec<String>,
    #[serde(with = "crate::pipeline::types::duration_ms")]
    pub elapsed: Duration,
    pub peak_concurrency: usize,
    pub cache: CacheStats,
}

impl BatchSummary {
    pub fn report(&self, email_id: &str) -> Option<&ItemReport> {
        self.items.iter().find(|r| r.email_id == email_id)
    }

    /// True once every item reached a terminal outcome.
    pub fn all_terminal(&self) -> bool {
        self.counters.is_done() && self.items.len() == self.counters.total
    }
}

/// Collect up to [`MAX_SAMPLE_ERRORS`] distinct error messages.
pub(crate) fn sample_errors(items: &[ItemReport]) -> Vec<String> {
    let mut samples: Vec<String> = Vec::new();
    for item in items {
        let Some(error) = item.error.as_ref() else {
            continue;
        };
        let line = format!("{}: {error}", item.email_id);
        if !samples.contains(&line) {
            samples.push(line);
        }
        if samples.len() == MAX_SAMPLE_ERRORS {
            break;
        }
    }
    samples
}
