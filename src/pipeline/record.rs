//! Per-email analysis records and the reducer that builds them.
//!
//! Records are snapshots. Every stage of an item produces a new record from
//! the previous one via [`reduce`]; nothing mutates a record in place, and a
//! later failure never clears results an earlier phase produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::pipeline::router::RoutingDecision;
use crate::pipeline::types::{
    ChainType, Email, Phase, Phase1Result, Phase2Result, Phase3Result, Priority, WorkflowState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Nothing has run yet.
    Pending,
    /// Some planned phases are done, or the item was interrupted.
    Partial,
    /// Every planned phase is done.
    Complete,
    /// A phase or validation failed.
    Error,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of everything known about one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub email_id: String,
    pub conversation_id: String,
    pub content_hash: String,
    pub status: AnalysisStatus,
    pub phases_planned: Vec<Phase>,
    pub phases_completed: Vec<Phase>,
    pub routing_reason: Option<String>,
    pub chain_type: ChainType,
    pub chain_completeness: f64,
    /// Phase 1 (rule-based) result.
    pub quick: Option<Phase1Result>,
    /// Phase 2 result.
    pub deep: Option<Phase2Result>,
    /// Phase 3 result.
    #[serde(rename = "final")]
    pub final_analysis: Option<Phase3Result>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// Fresh pending record.
    pub fn new(email: &Email, chain_type: ChainType, chain_completeness: f64, at: DateTime<Utc>) -> Self {
        Self {
            email_id: email.id.clone(),
            conversation_id: email.conversation_id.clone(),
            content_hash: email.content_hash(),
            status: AnalysisStatus::Pending,
            phases_planned: vec![Phase::Phase1],
            phases_completed: Vec::new(),
            routing_reason: None,
            chain_type,
            chain_completeness,
            quick: None,
            deep: None,
            final_analysis: None,
            failed_phase: None,
            error: None,
            updated_at: at,
        }
    }

    #[cfg(test)]
    fn is_terminal(&self) -> bool {
        matches!(self.status, AnalysisStatus::Complete | AnalysisStatus::Error)
    }

    pub fn has_completed(&self, phase: Phase) -> bool {
        self.phases_completed.contains(&phase)
    }

    /// Most refined priority available.
    pub fn final_priority(&self) -> Option<Priority> {
        self.deep
            .as_ref()
            .map(|d| d.priority)
            .or_else(|| self.quick.as_ref().map(|q| q.priority))
    }

    /// Most refined workflow state available.
    pub fn final_workflow_state(&self) -> Option<WorkflowState> {
        self.deep
            .as_ref()
            .map(|d| d.workflow_state)
            .or_else(|| self.quick.as_ref().map(|q| q.workflow_state))
    }

    /// Most refined summary available.
    pub fn final_summary(&self) -> Option<&str> {
        self.final_analysis
            .as_ref()
            .map(|f| f.summary.as_str())
            .or_else(|| self.deep.as_ref().map(|d| d.summary.as_str()))
    }
}

/// One step in an item's life.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// Initial or revised routing plan.
    Routed(RoutingDecision),
    Phase1(Phase1Result),
    Phase2(Phase2Result),
    Phase3(Phase3Result),
    /// `phase` is `None` when the item failed before Phase 1 (validation).
    Failed {
        phase: Option<Phase>,
        error: PipelineError,
    },
    /// Shutdown stopped the item at a phase boundary.
    Interrupted,
}

/// Produce the next snapshot. Pure.
pub fn reduce(record: &AnalysisRecord, event: RecordEvent, at: DateTime<Utc>) -> AnalysisRecord {
    let mut next = record.clone();
    next.updated_at = at;

    match event {
        RecordEvent::Routed(decision) => {
            next.phases_planned = decision.phases().to_vec();
            next.routing_reason = Some(decision.reason());
        }
        RecordEvent::Phase1(result) => {
            next.quick = Some(result);
            mark_completed(&mut next, Phase::Phase1);
        }
        RecordEvent::Phase2(result) => {
            next.deep = Some(result);
            mark_completed(&mut next, Phase::Phase2);
        }
        RecordEvent::Phase3(result) => {
            next.final_analysis = Some(result);
            mark_completed(&mut next, Phase::Phase3);
        }
        RecordEvent::Failed { phase, error } => {
            next.failed_phase = phase;
            next.error = Some(error.to_string());
            next.status = AnalysisStatus::Error;
            return next;
        }
        RecordEvent::Interrupted => {
            if next.status != AnalysisStatus::Error && !plan_done(&next) {
                next.status = AnalysisStatus::Partial;
            }
            return next;
        }
    }

    if next.status != AnalysisStatus::Error {
        next.status = if plan_done(&next) {
            AnalysisStatus::Complete
        } else if next.phases_completed.is_empty() {
            AnalysisStatus::Pending
        } else {
            AnalysisStatus::Partial
        };
    }
    next
}

fn mark_completed(record: &mut AnalysisRecord, phase: Phase) {
    if !record.phases_completed.contains(&phase) {
        record.phases_completed.push(phase);
        record.phases_completed.sort();
    }
}

fn plan_done(record: &AnalysisRecord) -> bool {
    record
        .phases_planned
        .iter()
        .all(|p| record.phases_completed.contains(p))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::entities::EntitySet;
    use crate::pipeline::router::PhasePlan;
    use crate::pipeline::types::{Intent, ResultSource, SlaStatus, Urgency};

    fn email() -> Email {
        Email {
            id: "e1".into(),
            conversation_id: "c1".into(),
            subject: "RFQ".into(),
            body: "Please quote".into(),
            sender: "a@b.com".into(),
            recipients: vec![],
            received_at: Utc::now(),
            is_important: false,
            has_attachments: false,
        }
    }

    fn phase1() -> Phase1Result {
        Phase1Result {
            workflow_state: WorkflowState::StartPoint,
            priority: Priority::High,
            intent: Intent::RequestQuote,
            urgency: Urgency::Elevated,
            sla_status: SlaStatus::OnTrack,
            entities: EntitySet::default(),
            confidence: 0.6,
            processing_time: Duration::from_millis(1),
        }
    }

    fn phase2() -> Phase2Result {
        Phase2Result {
            workflow_state: WorkflowState::InProgress,
            priority: Priority::Critical,
            intent: Intent::RequestQuote,
            summary: "Buyer needs pricing".into(),
            workflow_validation: "Consistent".into(),
            missed_entities: EntitySet::default(),
            confidence: 0.8,
            source: ResultSource::Model,
            quality_score: 0.8,
            model_id: "m".into(),
            processing_time: Duration::from_millis(20),
        }
    }

    fn decision(plan: PhasePlan) -> RoutingDecision {
        RoutingDecision {
            plan,
            reasons: vec!["test".into()],
        }
    }

    #[test]
    fn phase1_only_plan_completes() {
        let now = Utc::now();
        let r0 = AnalysisRecord::new(&email(), ChainType::Rfq, 0.35, now);
        assert_eq!(r0.status, AnalysisStatus::Pending);

        let r1 = reduce(&r0, RecordEvent::Phase1(phase1()), now);
        let r2 = reduce(&r1, RecordEvent::Routed(decision(PhasePlan::Quick)), now);
        assert_eq!(r2.status, AnalysisStatus::Complete);
        assert_eq!(r2.routing_reason.as_deref(), Some("test"));
        // Earlier snapshot untouched
        assert_eq!(r0.status, AnalysisStatus::Pending);
        assert!(r0.quick.is_none());
    }

    #[test]
    fn planned_phases_keep_record_partial_until_done() {
        let now = Utc::now();
        let r = AnalysisRecord::new(&email(), ChainType::Rfq, 0.35, now);
        let r = reduce(&r, RecordEvent::Phase1(phase1()), now);
        let r = reduce(&r, RecordEvent::Routed(decision(PhasePlan::Classify)), now);
        assert_eq!(r.status, AnalysisStatus::Partial);

        let r = reduce(&r, RecordEvent::Phase2(phase2()), now);
        assert_eq!(r.status, AnalysisStatus::Complete);
        assert_eq!(r.final_priority(), Some(Priority::Critical));
        assert_eq!(r.final_workflow_state(), Some(WorkflowState::InProgress));
        assert_eq!(r.final_summary(), Some("Buyer needs pricing"));
    }

    #[test]
    fn failure_keeps_earlier_results() {
        let now = Utc::now();
        let r = AnalysisRecord::new(&email(), ChainType::Rfq, 0.35, now);
        let r = reduce(&r, RecordEvent::Phase1(phase1()), now);
        let r = reduce(&r, RecordEvent::Routed(decision(PhasePlan::Deep)), now);
        let r = reduce(&r, RecordEvent::Phase2(phase2()), now);
        let r = reduce(
            &r,
            RecordEvent::Failed {
                phase: Some(Phase::Phase3),
                error: PipelineError::Timeout {
                    phase: "phase3".into(),
                    timeout: Duration::from_secs(1),
                },
            },
            now,
        );
        assert_eq!(r.status, AnalysisStatus::Error);
        assert_eq!(r.failed_phase, Some(Phase::Phase3));
        assert!(r.quick.is_some());
        assert!(r.deep.is_some());
        assert!(r.error.as_deref().unwrap().contains("timed out"));
        assert!(r.is_terminal());
    }

    #[test]
    fn interruption_marks_partial() {
        let now = Utc::now();
        let r = AnalysisRecord::new(&email(), ChainType::Rfq, 0.35, now);
        let r = reduce(&r, RecordEvent::Phase1(phase1()), now);
        let r = reduce(&r, RecordEvent::Routed(decision(PhasePlan::Classify)), now);
        let r = reduce(&r, RecordEvent::Interrupted, now);
        assert_eq!(r.status, AnalysisStatus::Partial);
        assert!(!r.is_terminal());

        let fresh = AnalysisRecord::new(&email(), ChainType::Rfq, 0.35, now);
        assert_eq!(reduce(&fresh, RecordEvent::Interrupted, now).status, AnalysisStatus::Partial);
    }

    #[test]
    fn record_serializes_final_key() {
        let r = AnalysisRecord::new(&email(), ChainType::Order, 0.1, Utc::now());
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("final").is_some());
        assert_eq!(json["status"], "pending");
        let back: AnalysisRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
