//! Batch progress events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::record::AnalysisStatus;
use crate::pipeline::types::Phase;
use crate::worker::state::ItemOutcome;

/// Live counters carried by every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounters {
    pub total: usize,
    /// Items in a terminal state.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Phase results served from the cache.
    pub from_cache: usize,
}

impl ProgressCounters {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }

    pub fn is_done(&self) -> bool {
        self.processed >= self.total
    }
}

/// Atomic backing store for [`ProgressCounters`].
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    total: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    from_cache: AtomicUsize,
}

impl ProgressTracker {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub(crate) fn record(&self, outcome: ItemOutcome) -> ProgressCounters {
        let counter = match outcome {
            ItemOutcome::Succeeded => &self.succeeded,
            ItemOutcome::Failed => &self.failed,
            ItemOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.snapshot()
    }

    pub(crate) fn record_cache_hit(&self) -> ProgressCounters {
        self.from_cache.fetch_add(1, Ordering::SeqCst);
        self.snapshot()
    }

    pub(crate) fn snapshot(&self) -> ProgressCounters {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        ProgressCounters {
            total: self.total,
            processed: succeeded + failed + cancelled,
            succeeded,
            failed,
            cancelled,
            from_cache: self.from_cache.load(Ordering::SeqCst),
        }
    }
}

/// Everything observable about a running batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    BatchStarted {
        batch_id: Uuid,
        progress: ProgressCounters,
    },
    PhaseStarted {
        batch_id: Uuid,
        email_id: String,
        phase: Phase,
        progress: ProgressCounters,
    },
    PhaseCompleted {
        batch_id: Uuid,
        email_id: String,
        phase: Phase,
        /// True only for genuine cache hits.
        from_cache: bool,
        #[serde(with = "crate::pipeline::types::duration_ms")]
        elapsed: Duration,
        progress: ProgressCounters,
    },
    ItemError {
        batch_id: Uuid,
        email_id: String,
        /// `None` when the item failed outside a phase.
        phase: Option<Phase>,
        error: String,
        progress: ProgressCounters,
    },
    ItemCompleted {
        batch_id: Uuid,
        email_id: String,
        outcome: ItemOutcome,
        /// `None` when nothing was persisted for the item.
        status: Option<AnalysisStatus>,
        progress: ProgressCounters,
    },
    BatchCompleted {
        batch_id: Uuid,
        progress: ProgressCounters,
    },
}

impl BatchEvent {
    pub fn batch_id(&self) -> Uuid {
        match self {
            Self::BatchStarted { batch_id, .. }
            | Self::PhaseStarted { batch_id, .. }
            | Self::PhaseCompleted { batch_id, .. }
            | Self::ItemError { batch_id, .. }
            | Self::ItemCompleted { batch_id, .. }
            | Self::BatchCompleted { batch_id, .. } => *batch_id,
        }
    }

    pub fn progress(&self) -> &ProgressCounters {
        match self {
            Self::BatchStarted { progress, .. }
            | Self::PhaseStarted { progress, .. }
            | Self::PhaseCompleted { progress, .. }
            | Self::ItemError { progress, .. }
            | Self::ItemCompleted { progress, .. }
            | Self::BatchCompleted { progress, .. } => progress,
        }
    }

    pub fn is_batch_completed(&self) -> bool {
        matches!(self, Self::BatchCompleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_terminal_outcomes() {
        let tracker = ProgressTracker::new(3);
        tracker.record(ItemOutcome::Succeeded);
        tracker.record_cache_hit();
        let counters = tracker.record(ItemOutcome::Failed);
        assert_eq!(counters.processed, 2);
        assert_eq!(counters.remaining(), 1);
        assert!(!counters.is_done());

        let counters = tracker.record(ItemOutcome::Cancelled);
        assert!(counters.is_done());
        assert_eq!(
            counters,
            ProgressCounters {
                total: 3,
                processed: 3,
                succeeded: 1,
                failed: 1,
                cancelled: 1,
                from_cache: 1,
            }
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = BatchEvent::PhaseCompleted {
            batch_id: Uuid::nil(),
            email_id: "e1".into(),
            phase: Phase::Phase2,
            from_cache: true,
            elapsed: Duration::from_millis(42),
            progress: ProgressCounters::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "phase_completed");
        assert_eq!(json["elapsed"], 42);
        assert_eq!(event.batch_id(), Uuid::nil());
        assert!(!event.is_batch_completed());
    }
}
