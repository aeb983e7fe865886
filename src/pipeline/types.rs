//! Shared types for the analysis pipeline.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::pipeline::entities::EntitySet;

// ── Email ───────────────────────────────────────────────────────────

/// An ingested email. Produced by the ingestion collaborator and never
/// mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Unique email ID.
    pub id: String,
    /// Conversation (thread) the email belongs to.
    pub conversation_id: String,
    pub subject: String,
    pub body: String,
    /// Sender address.
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub received_at: DateTime<Utc>,
    /// Sender-set importance flag.
    #[serde(default)]
    pub is_important: bool,
    #[serde(default)]
    pub has_attachments: bool,
}

impl Email {
    /// Reject emails the pipeline cannot meaningfully analyse.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::Validation("email id is empty".into()));
        }
        if self.conversation_id.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "email {} has no conversation id",
                self.id
            )));
        }
        if self.sender.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "email {} has no sender",
                self.id
            )));
        }
        if self.subject.trim().is_empty() && self.body.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "email {} has neither subject nor body",
                self.id
            )));
        }
        Ok(())
    }

    /// Subject and body joined for pattern matching.
    pub fn text(&self) -> String {
        format!("{}\n\n{}", self.subject, self.body)
    }

    /// SHA-256 hex digest of subject and body.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ── Phases ──────────────────────────────────────────────────────────

/// One analysis tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Rule-based, synchronous, no external call.
    Phase1,
    /// Inference-backed classification.
    Phase2,
    /// Deep inference-backed analysis.
    Phase3,
}

impl Phase {
    pub fn number(&self) -> u8 {
        match self {
            Self::Phase1 => 1,
            Self::Phase2 => 2,
            Self::Phase3 => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phase1 => "phase1",
            Self::Phase2 => "phase2",
            Self::Phase3 => "phase3",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Workflow state ──────────────────────────────────────────────────

/// Position of an email within a business workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    StartPoint,
    InProgress,
    Completion,
    Escalation,
    Other,
}

impl WorkflowState {
    /// Transition table between consecutive emails of a chain.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        matches!(
            (self, target),
            (_, Other) |
            (Other, _) |
            // From StartPoint
            (StartPoint, StartPoint) | (StartPoint, InProgress) |
            (StartPoint, Completion) | (StartPoint, Escalation) |
            // From InProgress
            (InProgress, InProgress) | (InProgress, Completion) | (InProgress, Escalation) |
            // From Escalation
            (Escalation, Escalation) | (Escalation, InProgress) | (Escalation, Completion) |
            // From Completion (a reopened thread goes back to in-progress)
            (Completion, Completion) | (Completion, InProgress)
        )
    }

    /// Lenient parse of model output such as `"in progress"` or `"START_POINT"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "start_point" | "start" | "new" | "new_request" => Some(Self::StartPoint),
            "in_progress" | "progress" | "ongoing" | "pending" => Some(Self::InProgress),
            "completion" | "complete" | "completed" | "closed" | "resolved" => {
                Some(Self::Completion)
            }
            "escalation" | "escalated" => Some(Self::Escalation),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartPoint => "START_POINT",
            Self::InProgress => "IN_PROGRESS",
            Self::Completion => "COMPLETION",
            Self::Escalation => "ESCALATION",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Chain type ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainType {
    Rfq,
    Order,
    Support,
    Escalation,
    Other,
    Unknown,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rfq => "RFQ",
            Self::Order => "ORDER",
            Self::Support => "SUPPORT",
            Self::Escalation => "ESCALATION",
            Self::Other => "OTHER",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Priority / urgency / intent ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// High and critical items justify inference-backed phases.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" | "moderate" => Some(Self::Medium),
            "high" | "important" => Some(Self::High),
            "critical" | "urgent" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Response window before the item breaches its SLA.
    pub fn sla_window(&self) -> chrono::Duration {
        match self {
            Self::Critical => chrono::Duration::hours(4),
            Self::High => chrono::Duration::hours(24),
            Self::Medium => chrono::Duration::hours(72),
            Self::Low => chrono::Duration::hours(168),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    Elevated,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RequestQuote,
    PlaceOrder,
    SupportRequest,
    Escalation,
    StatusUpdate,
    Information,
    Unknown,
}

impl Intent {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "request_quote" | "quote_request" | "rfq" => Some(Self::RequestQuote),
            "place_order" | "order" | "purchase" => Some(Self::PlaceOrder),
            "support_request" | "support" => Some(Self::SupportRequest),
            "escalation" | "complaint" => Some(Self::Escalation),
            "status_update" | "update" | "follow_up" => Some(Self::StatusUpdate),
            "information" | "info" | "fyi" => Some(Self::Information),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Where an item stands against its priority's response window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTrack,
    AtRisk,
    Overdue,
}

impl SlaStatus {
    /// `AtRisk` once three quarters of the window have elapsed.
    pub fn evaluate(priority: Priority, received_at: DateTime<Utc>, as_of: DateTime<Utc>) -> Self {
        let window = priority.sla_window();
        let elapsed = as_of.signed_duration_since(received_at);
        if elapsed >= window {
            Self::Overdue
        } else if elapsed * 4 >= window * 3 {
            Self::AtRisk
        } else {
            Self::OnTrack
        }
    }
}

// ── Chain analysis ──────────────────────────────────────────────────

/// Completeness assessment of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAnalysis {
    pub chain_id: String,
    /// Always within `[0, 1]`.
    pub completeness_score: f64,
    pub is_complete: bool,
    pub chain_type: ChainType,
    /// Sorted, deduplicated.
    pub missing_elements: Vec<String>,
    /// One state per email, in chain order.
    pub workflow_states: Vec<WorkflowState>,
    pub key_entities: EntitySet,
    pub email_count: usize,
    pub participant_count: usize,
    pub duration_hours: f64,
    /// Consecutive state pairs not allowed by the transition table.
    pub irregular_transitions: usize,
}

impl ChainAnalysis {
    /// Analysis for input that cannot be scored.
    pub fn unknown(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            completeness_score: 0.0,
            is_complete: false,
            chain_type: ChainType::Unknown,
            missing_elements: Vec::new(),
            workflow_states: Vec::new(),
            key_entities: EntitySet::default(),
            email_count: 0,
            participant_count: 0,
            duration_hours: 0.0,
            irregular_transitions: 0,
        }
    }

    /// State of the latest email in the chain.
    pub fn current_state(&self) -> Option<WorkflowState> {
        self.workflow_states.last().copied()
    }

    pub fn is_missing(&self, element: &str) -> bool {
        self.missing_elements.iter().any(|m| m == element)
    }
}

// ── Per-phase results ───────────────────────────────────────────────

/// Whether a phase result came from the model or the deterministic fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Model,
    Fallback,
}

/// Output of the rule-based phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase1Result {
    pub workflow_state: WorkflowState,
    pub priority: Priority,
    pub intent: Intent,
    pub urgency: Urgency,
    pub sla_status: SlaStatus,
    pub entities: EntitySet,
    pub confidence: f64,
    #[serde(with = "duration_ms")]
    pub processing_time: Duration,
}

/// Output of the inference-backed classification phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase2Result {
    pub workflow_state: WorkflowState,
    pub priority: Priority,
    pub intent: Intent,
    pub summary: String,
    pub workflow_validation: String,
    pub missed_entities: EntitySet,
    pub confidence: f64,
    pub source: ResultSource,
    pub quality_score: f64,
    pub model_id: String,
    #[serde(with = "duration_ms")]
    pub processing_time: Duration,
}

/// Output of the deep analysis phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase3Result {
    pub summary: String,
    pub suggested_response: String,
    pub action_items: Vec<String>,
    pub risk_level: String,
    pub business_impact: String,
    pub confidence: f64,
    pub source: ResultSource,
    pub quality_score: f64,
    pub model_id: String,
    #[serde(with = "duration_ms")]
    pub processing_time: Duration,
}

/// Result of one inference-backed phase; the value stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum InferenceOutcome {
    Phase2(Phase2Result),
    Phase3(Phase3Result),
}

impl InferenceOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Phase2(_) => Phase::Phase2,
            Self::Phase3(_) => Phase::Phase3,
        }
    }

    pub fn source(&self) -> ResultSource {
        match self {
            Self::Phase2(r) => r.source,
            Self::Phase3(r) => r.source,
        }
    }

    /// Parsed from a model answer rather than substituted.
    pub fn from_model(&self) -> bool {
        self.source() == ResultSource::Model
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(super::millis(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
