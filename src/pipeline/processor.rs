//! Phases 2 and 3: inference-backed analysis.
//!
//! Flow per phase:
//! 1. Build a bounded prompt (template + truncated email + entities + chain context)
//! 2. One backend call; backend errors propagate so the caller can retry
//! 3. Parse the JSON answer, or fall back to a deterministic result
//! 4. Quality guard: the fallback replaces weak or degenerate answers
//!
//! Unparseable output is never an error. The caller always gets a result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::error::PipelineError;
use crate::llm::{InferenceBackend, InferenceRequest};
use crate::pipeline::entities::EntitySet;
use crate::pipeline::rules::unreported;
use crate::pipeline::types::{
    ChainAnalysis, ChainType, Email, InferenceOutcome, Intent, Phase, Phase1Result, Phase2Result,
    Phase3Result, Priority, ResultSource, SlaStatus, WorkflowState,
};

/// Confidence reported by deterministic fallbacks.
pub const FALLBACK_CONFIDENCE: f64 = 0.4;

/// Max tokens for Phase 2 (classification, kept tight).
const PHASE2_MAX_TOKENS: u32 = 512;

/// Answers that carry no assessment at all.
const GENERIC_ANSWERS: &[&str] = &[
    "yes", "no", "ok", "okay", "valid", "invalid", "true", "false", "correct", "n/a", "none",
];

/// Everything a model-backed phase needs about one item. Owned so that the
/// computation can outlive the caller that started it.
#[derive(Debug, Clone)]
pub struct PhaseInput {
    pub email: Email,
    pub chain: ChainAnalysis,
    pub phase1: Phase1Result,
    /// Present for Phase 3.
    pub phase2: Option<Phase2Result>,
}

/// Runs Phase 2 and Phase 3 against an [`InferenceBackend`].
pub struct InferenceAnalyzer {
    backend: Arc<dyn InferenceBackend>,
    config: InferenceConfig,
}

impl InferenceAnalyzer {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: InferenceConfig) -> Self {
        Self { backend, config }
    }

    /// Model used for `phase`; part of the cache fingerprint.
    pub fn model_for(&self, phase: Phase) -> &str {
        match phase {
            Phase::Phase3 => self.config.deep_model(),
            _ => &self.config.model,
        }
    }

    /// Run one inference phase. Phase 1 is not model-backed and is rejected.
    pub async fn analyze(&self, phase: Phase, input: &PhaseInput) -> Result<InferenceOutcome, PipelineError> {
        match phase {
            Phase::Phase2 => self.run_phase2(input).await.map(InferenceOutcome::Phase2),
            Phase::Phase3 => self.run_phase3(input).await.map(InferenceOutcome::Phase3),
            Phase::Phase1 => Err(PipelineError::Validation(
                "phase1 is rule-based and has no inference step".into(),
            )),
        }
    }

    async fn run_phase2(&self, input: &PhaseInput) -> Result<Phase2Result, PipelineError> {
        let started = Instant::now();
        let request = InferenceRequest {
            model: self.model_for(Phase::Phase2).to_string(),
            system: build_phase2_system_prompt(),
            prompt: build_user_prompt(input, self.config.max_body_chars),
            temperature: self.config.temperature,
            max_tokens: PHASE2_MAX_TOKENS.min(self.config.max_tokens),
            timeout: self.config.request_timeout,
        };

        let response = self.backend.complete(request).await?;
        let fallback = phase2_fallback(input, &response.model, started.elapsed());

        let (mut result, classified) = match parse_phase2_response(&response.content) {
            Ok(parsed) => parsed.into_result(&input.phase1, &response.model),
            Err(e) => {
                warn!(
                    email_id = %input.email.id,
                    error = %e,
                    "Failed to parse phase2 response, using fallback"
                );
                return Ok(fallback);
            }
        };

        result.quality_score =
            quality_score(&phase2_signals(&result, classified, input.phase1.entities.total()));
        if result.quality_score < self.config.min_quality || result.quality_score < fallback.quality_score {
            debug!(
                email_id = %input.email.id,
                parsed = result.quality_score,
                fallback = fallback.quality_score,
                "Phase2 answer below quality bar, using fallback"
            );
            return Ok(fallback);
        }
        result.processing_time = started.elapsed();
        Ok(result)
    }

    async fn run_phase3(&self, input: &PhaseInput) -> Result<Phase3Result, PipelineError> {
        let started = Instant::now();
        let request = InferenceRequest {
            model: self.model_for(Phase::Phase3).to_string(),
            system: build_phase3_system_prompt(),
            prompt: build_user_prompt(input, self.config.max_body_chars),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: self.config.request_timeout,
        };

        let response = self.backend.complete(request).await?;
        let fallback = phase3_fallback(input, &response.model, started.elapsed());

        let mut result = match parse_phase3_response(&response.content) {
            Ok(parsed) => parsed.into_result(&response.model),
            Err(e) => {
                warn!(
                    email_id = %input.email.id,
                    error = %e,
                    "Failed to parse phase3 response, using fallback"
                );
                return Ok(fallback);
            }
        };

        result.quality_score = quality_score(&phase3_signals(&result, input.phase1.entities.total()));
        if result.quality_score < self.config.min_quality || result.quality_score < fallback.quality_score {
            debug!(
                email_id = %input.email.id,
                parsed = result.quality_score,
                fallback = fallback.quality_score,
                "Phase3 answer below quality bar, using fallback"
            );
            return Ok(fallback);
        }
        result.processing_time = started.elapsed();
        Ok(result)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_phase2_system_prompt() -> String {
    "You are a business email workflow analyst. Classify the email within its conversation.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"workflow_state\": \"START_POINT|IN_PROGRESS|COMPLETION|ESCALATION|OTHER\", \
     \"priority\": \"low|medium|high|critical\", \
     \"intent\": \"request_quote|place_order|support_request|escalation|status_update|information\", \
     \"summary\": \"...\", \"workflow_validation\": \"...\", \
     \"missed_entities\": {\"po_numbers\": [], \"quote_numbers\": [], \"case_numbers\": []}, \
     \"confidence\": 0.0}\n\n\
     Rules:\n\
     - summary: one sentence\n\
     - workflow_validation: explain whether the detected workflow state fits the conversation\n\
     - missed_entities: only identifiers present in the email but absent from the detected list\n\
     - confidence above 0.9 only when identifiers in the email support the assessment"
        .to_string()
}

fn build_phase3_system_prompt() -> String {
    "You are a senior account manager reviewing a business email that needs attention.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"summary\": \"...\", \"suggested_response\": \"...\", \"action_items\": [\"...\"], \
     \"risk_level\": \"low|medium|high\", \"business_impact\": \"...\", \"confidence\": 0.0}\n\n\
     Rules:\n\
     - suggested_response: a short professional reply, no placeholders\n\
     - action_items: concrete next steps, at most five\n\
     - reference identifiers (PO, quote, case numbers) where relevant"
        .to_string()
}

/// User prompt shared by both phases. Body is truncated to `max_body_chars`.
fn build_user_prompt(input: &PhaseInput, max_body_chars: usize) -> String {
    let email = &input.email;
    let chain = &input.chain;
    let mut prompt = String::with_capacity(512 + max_body_chars);

    prompt.push_str(&format!("From: {}\n", email.sender));
    prompt.push_str(&format!("Subject: {}\n", email.subject));
    prompt.push_str(&format!("Received: {}\n", email.received_at.to_rfc3339()));
    if email.is_important {
        prompt.push_str("Flagged important by sender\n");
    }

    prompt.push_str(&format!("\nDetected entities: {}\n", input.phase1.entities.describe()));
    prompt.push_str(&format!(
        "Rule-based read: state {}, priority {}, intent {:?}\n",
        input.phase1.workflow_state, input.phase1.priority, input.phase1.intent
    ));

    let states: Vec<&str> = chain.workflow_states.iter().map(WorkflowState::as_str).collect();
    prompt.push_str(&format!(
        "Conversation: {} emails, type {}, completeness {:.2}, states [{}]",
        chain.email_count,
        chain.chain_type,
        chain.completeness_score,
        states.join(" → ")
    ));
    if !chain.missing_elements.is_empty() {
        prompt.push_str(&format!(", missing {}", chain.missing_elements.join(", ")));
    }
    prompt.push('\n');

    if let Some(ref phase2) = input.phase2 {
        prompt.push_str(&format!("Prior analysis: {}\n", phase2.summary));
    }

    let body: String = email.body.chars().take(max_body_chars).collect();
    prompt.push_str(&format!("\nEmail:\n{}", body));
    if email.body.chars().count() > max_body_chars {
        prompt.push_str("\n[truncated]");
    }

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// Phase 2 answer after key validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPhase2 {
    pub workflow_state: Option<WorkflowState>,
    pub priority: Option<Priority>,
    pub intent: Option<Intent>,
    pub summary: String,
    pub workflow_validation: String,
    pub missed_entities: EntitySet,
    pub confidence: f64,
}

impl ParsedPhase2 {
    /// Convert into a model-sourced result. Also returns which
    /// classifications the model supplied itself.
    fn into_result(self, phase1: &Phase1Result, model: &str) -> (Phase2Result, [bool; 3]) {
        let classified = [
            self.workflow_state.is_some(),
            self.priority.is_some(),
            self.intent.is_some(),
        ];
        let result = Phase2Result {
            workflow_state: self.workflow_state.unwrap_or(phase1.workflow_state),
            priority: self.priority.unwrap_or(phase1.priority),
            intent: self.intent.unwrap_or(phase1.intent),
            summary: self.summary,
            workflow_validation: self.workflow_validation,
            missed_entities: unreported(&phase1.entities, &self.missed_entities),
            confidence: self.confidence,
            source: ResultSource::Model,
            quality_score: 0.0,
            model_id: model.to_string(),
            processing_time: Duration::ZERO,
        };
        (result, classified)
    }
}

/// Phase 3 answer after key validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPhase3 {
    pub summary: String,
    pub suggested_response: String,
    pub action_items: Vec<String>,
    pub risk_level: String,
    pub business_impact: String,
    pub confidence: f64,
}

impl ParsedPhase3 {
    fn into_result(self, model: &str) -> Phase3Result {
        Phase3Result {
            summary: self.summary,
            suggested_response: self.suggested_response,
            action_items: self.action_items,
            risk_level: self.risk_level,
            business_impact: self.business_impact,
            confidence: self.confidence,
            source: ResultSource::Model,
            quality_score: 0.0,
            model_id: model.to_string(),
            processing_time: Duration::ZERO,
        }
    }
}

/// Parse a Phase 2 answer. Requires `workflow_validation` and `confidence`.
pub fn parse_phase2_response(raw: &str) -> Result<ParsedPhase2, PipelineError> {
    let object = parse_object(raw)?;
    require_keys(&object, &["workflow_validation", "confidence"])?;

    Ok(ParsedPhase2 {
        workflow_state: object
            .get("workflow_state")
            .and_then(Value::as_str)
            .and_then(WorkflowState::parse),
        priority: object
            .get("priority")
            .and_then(Value::as_str)
            .and_then(Priority::parse),
        intent: object.get("intent").and_then(Value::as_str).and_then(Intent::parse),
        summary: text_field(&object, "summary"),
        workflow_validation: text_field(&object, "workflow_validation"),
        missed_entities: object
            .get("missed_entities")
            .map(EntitySet::from_loose_json)
            .unwrap_or_default(),
        confidence: confidence_field(&object)?,
    })
}

/// Parse a Phase 3 answer. Requires `summary` and `confidence`.
pub fn parse_phase3_response(raw: &str) -> Result<ParsedPhase3, PipelineError> {
    let object = parse_object(raw)?;
    require_keys(&object, &["summary", "confidence"])?;

    let action_items = match object.get("action_items") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };

    Ok(ParsedPhase3 {
        summary: text_field(&object, "summary"),
        suggested_response: text_field(&object, "suggested_response"),
        action_items,
        risk_level: text_field(&object, "risk_level").to_lowercase(),
        business_impact: text_field(&object, "business_impact"),
        confidence: confidence_field(&object)?,
    })
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, PipelineError> {
    match serde_json::from_str::<Value>(answer_object_span(raw)) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(PipelineError::Parse(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(PipelineError::Parse(format!("JSON parse error: {e}"))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn require_keys(object: &Map<String, Value>, keys: &[&str]) -> Result<(), PipelineError> {
    let missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| object.get(*k).is_none_or(Value::is_null))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Parse(format!(
            "missing required keys: {}",
            missing.join(", ")
        )))
    }
}

/// Strings as-is; booleans and numbers rendered; anything else empty.
fn text_field(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Accepts `0.8`, `"0.8"` and percentages such as `85`.
fn confidence_field(object: &Map<String, Value>) -> Result<f64, PipelineError> {
    let raw = match object.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| PipelineError::Parse("confidence is not a number".into()))?;
    let normalized = if raw > 1.0 { raw / 100.0 } else { raw };
    Ok(normalized.clamp(0.0, 1.0))
}

/// The part of a model answer that should hold the JSON object.
///
/// A fenced block wins when the answer does not itself open with `{`. The
/// result is then cut to the span from the first `{` to the last `}`, so
/// prose before or after the object is dropped either way.
fn answer_object_span(raw: &str) -> &str {
    let mut body = raw.trim();
    if !body.starts_with('{')
        && let Some(open) = body.find("```")
    {
        let fenced = &body[open + 3..];
        // Info string, e.g. ```json
        let fenced = fenced.find('\n').map_or(fenced, move |nl| {
            let tag = fenced[..nl].trim();
            if tag.chars().all(|c| c.is_ascii_alphanumeric()) { &fenced[nl + 1..] } else { fenced }
        });
        if let Some(close) = fenced.find("```") {
            body = fenced[..close].trim();
        }
    }
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => body,
    }
}

// ── Quality guard ───────────────────────────────────────────────────

/// Inputs to the quality rubric, shared by parsed answers and fallbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySignals<'a> {
    /// Phase 2 workflow validation, Phase 3 suggested response.
    pub assessment: &'a str,
    pub summary: &'a str,
    /// Phase 2: state, priority, intent. Phase 3: risk level, action items,
    /// business impact.
    pub classified: [bool; 3],
    pub supporting_entities: usize,
    pub confidence: f64,
}

/// Score in `[0, 1]`.
///
/// | signal                                   | weight |
/// |------------------------------------------|--------|
/// | substantive assessment (scaled to 8 words) | 0.25 |
/// | summary of at least 3 words              | 0.20   |
/// | classifications present                  | 0.15 / 0.10 / 0.10 |
/// | at least one supporting entity           | 0.20   |
/// | confidence > 0.9 with no entities        | −0.30  |
pub fn quality_score(signals: &QualitySignals<'_>) -> f64 {
    let mut score = 0.0;

    let assessment = signals.assessment.trim();
    let normalized = assessment
        .trim_end_matches(['.', '!'])
        .to_lowercase();
    if !GENERIC_ANSWERS.contains(&normalized.as_str()) {
        let words = assessment.split_whitespace().count() as f64;
        score += 0.25 * (words / 8.0).min(1.0);
    }

    if signals.summary.split_whitespace().count() >= 3 {
        score += 0.2;
    }

    for (present, weight) in signals.classified.iter().zip([0.15, 0.1, 0.1]) {
        if *present {
            score += weight;
        }
    }

    if signals.supporting_entities > 0 {
        score += 0.2;
    } else if signals.confidence > 0.9 {
        score -= 0.3;
    }

    score.clamp(0.0, 1.0)
}

/// Entities reported by the model count as support alongside the known ones.
fn phase2_signals(result: &Phase2Result, classified: [bool; 3], known_entities: usize) -> QualitySignals<'_> {
    QualitySignals {
        assessment: &result.workflow_validation,
        summary: &result.summary,
        classified,
        supporting_entities: known_entities + result.missed_entities.total(),
        confidence: result.confidence,
    }
}

fn phase3_signals(result: &Phase3Result, known_entities: usize) -> QualitySignals<'_> {
    QualitySignals {
        assessment: &result.suggested_response,
        summary: &result.summary,
        classified: [
            matches!(result.risk_level.as_str(), "low" | "medium" | "high"),
            !result.action_items.is_empty(),
            !result.business_impact.trim().is_empty(),
        ],
        supporting_entities: known_entities,
        confidence: result.confidence,
    }
}

// ── Deterministic fallbacks ─────────────────────────────────────────

/// Phase 2 result built from Phase 1 and chain analysis alone.
pub fn phase2_fallback(input: &PhaseInput, model: &str, elapsed: Duration) -> Phase2Result {
    let phase1 = &input.phase1;
    let chain = &input.chain;

    let subject: String = input.email.subject.chars().take(80).collect();
    let summary = format!("{} from {}: {}", intent_label(phase1.intent), input.email.sender, subject);

    let mut validation = format!(
        "Rule-based assessment: {} chain at {:.2} completeness, email classified {} with {} priority",
        chain.chain_type, chain.completeness_score, phase1.workflow_state, phase1.priority
    );
    if !chain.missing_elements.is_empty() {
        validation.push_str(&format!("; missing {}", chain.missing_elements.join(", ")));
    }
    if chain.irregular_transitions > 0 {
        validation.push_str(&format!("; {} irregular transitions", chain.irregular_transitions));
    }

    let mut result = Phase2Result {
        workflow_state: phase1.workflow_state,
        priority: phase1.priority,
        intent: phase1.intent,
        summary,
        workflow_validation: validation,
        missed_entities: EntitySet::default(),
        confidence: FALLBACK_CONFIDENCE,
        source: ResultSource::Fallback,
        quality_score: 0.0,
        model_id: model.to_string(),
        processing_time: elapsed,
    };
    result.quality_score = quality_score(&phase2_signals(&result, [true; 3], phase1.entities.total()));
    result
}

/// Phase 3 result built from earlier phases alone.
pub fn phase3_fallback(input: &PhaseInput, model: &str, elapsed: Duration) -> Phase3Result {
    let phase1 = &input.phase1;
    let chain = &input.chain;
    let priority = input.phase2.as_ref().map_or(phase1.priority, |p| p.priority);
    let intent = input.phase2.as_ref().map_or(phase1.intent, |p| p.intent);

    let summary = input
        .phase2
        .as_ref()
        .map(|p| p.summary.clone())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("{} from {}", intent_label(intent), input.email.sender));

    let reference = primary_reference(&phase1.entities);
    let suggested_response = match intent {
        Intent::RequestQuote => format!(
            "Thank you for your request{reference}. We are preparing pricing and will send the quotation shortly."
        ),
        Intent::PlaceOrder => format!(
            "Thank you for your order{reference}. We will confirm availability and delivery dates shortly."
        ),
        Intent::SupportRequest => format!(
            "Thank you for reporting this{reference}. Our support team is reviewing it and will follow up with next steps."
        ),
        Intent::Escalation => format!(
            "We apologise for the difficulty{reference}. This has been escalated and a manager will contact you today."
        ),
        Intent::StatusUpdate => format!(
            "Thank you for the update{reference}. We have recorded it and will let you know if anything else is needed."
        ),
        Intent::Information | Intent::Unknown => format!(
            "Thank you for your message{reference}. We have received it and will respond if any action is required."
        ),
    };

    let mut action_items = vec![format!("Reply to {} ({} priority)", input.email.sender, priority)];
    for missing in &chain.missing_elements {
        match missing.as_str() {
            "completion_marker" => action_items.push("Drive the conversation to a documented close".into()),
            "quote_number" => action_items.push("Issue a quote number".into()),
            "po_number" => action_items.push("Request the purchase order number".into()),
            "case_number" => action_items.push("Open a support case".into()),
            _ => {}
        }
    }
    action_items.truncate(5);

    let risk_level = match (priority, phase1.sla_status) {
        (Priority::Critical, _) | (_, SlaStatus::Overdue) => "high",
        (Priority::High, _) | (_, SlaStatus::AtRisk) => "medium",
        _ => "low",
    }
    .to_string();

    let business_impact = match chain.chain_type {
        ChainType::Rfq => "Open quotation request; delay risks losing the sale",
        ChainType::Order => "Active order; delay affects fulfilment and revenue recognition",
        ChainType::Support => "Open support issue; delay affects customer satisfaction",
        ChainType::Escalation => "Escalated customer relationship; delay risks churn",
        ChainType::Other | ChainType::Unknown => "No direct revenue impact identified",
    }
    .to_string();

    let mut result = Phase3Result {
        summary,
        suggested_response,
        action_items,
        risk_level,
        business_impact,
        confidence: FALLBACK_CONFIDENCE,
        source: ResultSource::Fallback,
        quality_score: 0.0,
        model_id: model.to_string(),
        processing_time: elapsed,
    };
    result.quality_score = quality_score(&phase3_signals(&result, phase1.entities.total()));
    result
}

fn intent_label(intent: Intent) -> &'static str {
    match intent {
        Intent::RequestQuote => "Quote request",
        Intent::PlaceOrder => "Order",
        Intent::SupportRequest => "Support request",
        Intent::Escalation => "Escalation",
        Intent::StatusUpdate => "Status update",
        Intent::Information => "Information",
        Intent::Unknown => "Message",
    }
}

fn primary_reference(entities: &EntitySet) -> String {
    [
        ("quote", &entities.quote_numbers),
        ("PO", &entities.po_numbers),
        ("case", &entities.case_numbers),
        ("order", &entities.order_references),
    ]
    .iter()
    .find_map(|(label, values)| values.first().map(|v| format!(" ({label} {v})")))
    .unwrap_or_default()
}
