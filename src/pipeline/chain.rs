//! Conversation chain analysis: groups emails by conversation and scores how
//! complete the underlying business workflow is.
//!
//! The score is a weighted sum of normalised factors rather than a keyword
//! switch, so chains land on a gradient instead of 0% / 100%. A one-email
//! chain is always capped and never complete.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::ChainScoringConfig;
use crate::pipeline::entities::{EntityExtractor, EntitySet};
use crate::pipeline::types::{ChainAnalysis, ChainType, Email, WorkflowState};

pub const MISSING_START: &str = "start_marker";
pub const MISSING_COMPLETION: &str = "completion_marker";
pub const MISSING_PARTICIPANTS: &str = "multiple_participants";
pub const MISSING_QUOTE_NUMBER: &str = "quote_number";
pub const MISSING_PO_NUMBER: &str = "po_number";
pub const MISSING_CASE_NUMBER: &str = "case_number";

static START_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(request|requesting|quote|quotation|inquiry|enquiry|rfq|pricing|looking\s+for|need\s+a\s+price)\b")
        .expect("start marker pattern")
});

static REPLY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(re|fw|fwd|aw)\s*:").expect("reply prefix pattern"));

static PROGRESS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(in\s+progress|working\s+on|attached|issued|update|following\s+up|processing|scheduled|confirmed)\b")
        .expect("progress marker pattern")
});

static COMPLETION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(resolved|closed|shipped|delivered|completed|fulfilled|invoice\s+paid|case\s+closed)\b")
        .expect("completion marker pattern")
});

static ESCALATION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(escalat\w*|complaint|unacceptable|urgent\s+attention|legal\s+action)\b")
        .expect("escalation marker pattern")
});

static RFQ_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(rfq|quote|quotes|quotation|pricing|price\s+request)\b").expect("rfq pattern")
});

static ORDER_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(purchase\s+order|po|p\.o|order|orders)\b").expect("order pattern")
});

static SUPPORT_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(case|ticket|issue|support|problem|defect|broken|not\s+working)\b")
        .expect("support pattern")
});

/// Marker categories found in one email.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmailMarkers {
    pub start: bool,
    pub progress: bool,
    pub completion: bool,
    pub escalation: bool,
}

impl EmailMarkers {
    pub fn detect(email: &Email) -> Self {
        let text = email.text();
        Self {
            start: START_MARKER.is_match(&text),
            progress: REPLY_PREFIX.is_match(&email.subject) || PROGRESS_MARKER.is_match(&text),
            completion: COMPLETION_MARKER.is_match(&text),
            escalation: ESCALATION_MARKER.is_match(&text),
        }
    }

    /// Completion > escalation > progress > start > other.
    pub fn state(&self) -> WorkflowState {
        if self.completion {
            WorkflowState::Completion
        } else if self.escalation {
            WorkflowState::Escalation
        } else if self.progress {
            WorkflowState::InProgress
        } else if self.start {
            WorkflowState::StartPoint
        } else {
            WorkflowState::Other
        }
    }
}

/// Classify one email's workflow position from its text.
pub fn classify_email(email: &Email) -> WorkflowState {
    EmailMarkers::detect(email).state()
}

/// Emails sharing a conversation id, ordered by receipt time.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub conversation_id: String,
    pub emails: Vec<Email>,
}

/// Group a flat collection into chains, preserving the order in which
/// conversations first appear. Emails inside a chain are sorted by
/// `received_at`, then id.
pub fn group_by_conversation(emails: &[Email]) -> Vec<Chain> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut chains: Vec<Chain> = Vec::new();

    for email in emails {
        let slot = *index
            .entry(email.conversation_id.as_str())
            .or_insert_with(|| {
                chains.push(Chain {
                    conversation_id: email.conversation_id.clone(),
                    emails: Vec::new(),
                });
                chains.len() - 1
            });
        chains[slot].emails.push(email.clone());
    }

    for chain in &mut chains {
        sort_chain(&mut chain.emails);
    }
    chains
}

fn sort_chain(emails: &mut [Email]) {
    emails.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Scores conversation chains.
#[derive(Debug, Clone)]
pub struct ChainAnalyzer {
    config: ChainScoringConfig,
    extractor: EntityExtractor,
}

impl ChainAnalyzer {
    pub fn new(config: ChainScoringConfig, extractor: EntityExtractor) -> Self {
        Self { config, extractor }
    }

    pub fn config(&self) -> &ChainScoringConfig {
        &self.config
    }

    /// Analyse one chain. Never fails: empty input or emails from different
    /// conversations yield an `UNKNOWN` analysis with score 0.
    pub fn analyze(&self, emails: &[Email]) -> ChainAnalysis {
        let Some(first) = emails.first() else {
            return ChainAnalysis::unknown("");
        };
        let chain_id = first.conversation_id.clone();
        if emails.iter().any(|e| e.conversation_id != chain_id) {
            debug!(chain_id = %chain_id, "Chain mixes conversation ids, refusing to score");
            return ChainAnalysis::unknown(chain_id);
        }

        let mut ordered = emails.to_vec();
        sort_chain(&mut ordered);

        let markers: Vec<EmailMarkers> = ordered.iter().map(EmailMarkers::detect).collect();
        let workflow_states: Vec<WorkflowState> = markers.iter().map(EmailMarkers::state).collect();
        let irregular_transitions = workflow_states
            .windows(2)
            .filter(|pair| !pair[0].can_transition_to(pair[1]))
            .count();

        let has_start = markers.iter().any(|m| m.start);
        let has_completion = markers.iter().any(|m| m.completion);

        let participants: HashSet<String> = ordered
            .iter()
            .map(|e| e.sender.trim().to_lowercase())
            .collect();
        let participant_count = participants.len();

        let duration_hours = match (ordered.first(), ordered.last()) {
            (Some(a), Some(b)) => {
                (b.received_at - a.received_at).num_seconds().max(0) as f64 / 3600.0
            }
            _ => 0.0,
        };

        let mut key_entities = EntitySet::default();
        for email in &ordered {
            key_entities.merge(&self.extractor.extract(&email.text()));
        }

        let chain_type = dominant_type(&ordered);
        let expected = expected_entities(chain_type);
        let present: Vec<&str> = expected
            .iter()
            .filter(|kind| has_entity_kind(&key_entities, kind))
            .copied()
            .collect();

        let email_count = ordered.len();
        let score = self.score(ScoreInputs {
            has_start,
            has_completion,
            participant_count,
            duration_hours,
            email_count,
            expected_entities: expected.len(),
            present_entities: present.len(),
        });

        let mut missing_elements = Vec::new();
        if !has_start {
            missing_elements.push(MISSING_START.to_string());
        }
        if !has_completion {
            missing_elements.push(MISSING_COMPLETION.to_string());
        }
        if participant_count < 2 {
            missing_elements.push(MISSING_PARTICIPANTS.to_string());
        }
        for kind in &expected {
            if !present.contains(kind) {
                missing_elements.push((*kind).to_string());
            }
        }
        missing_elements.sort();
        missing_elements.dedup();

        let is_complete = email_count > 1 && score >= self.config.complete_threshold;

        debug!(
            chain_id = %chain_id,
            chain_type = %chain_type,
            emails = email_count,
            score = score,
            is_complete,
            "Chain analysed"
        );

        ChainAnalysis {
            chain_id,
            completeness_score: score,
            is_complete,
            chain_type,
            missing_elements,
            workflow_states,
            key_entities,
            email_count,
            participant_count,
            duration_hours,
            irregular_transitions,
        }
    }

    fn score(&self, inputs: ScoreInputs) -> f64 {
        let cfg = &self.config;

        let participants_factor = if inputs.participant_count >= 2 { 1.0 } else { 0.0 };
        let duration_factor = (inputs.duration_hours / cfg.full_duration_hours).clamp(0.0, 1.0);
        let count_factor = if inputs.email_count <= 1 {
            0.0
        } else {
            ((inputs.email_count as f64).ln() / (cfg.email_count_cap as f64).ln()).clamp(0.0, 1.0)
        };
        let entity_factor = if inputs.expected_entities == 0 {
            1.0
        } else {
            inputs.present_entities as f64 / inputs.expected_entities as f64
        };

        let mut score = bool_factor(inputs.has_start) * cfg.start_weight
            + bool_factor(inputs.has_completion) * cfg.completion_weight
            + participants_factor * cfg.participants_weight
            + duration_factor * cfg.duration_weight
            + count_factor * cfg.email_count_weight
            + entity_factor * cfg.entity_weight;

        if !inputs.has_start {
            score = score.min(cfg.no_start_cap);
        }
        if inputs.email_count <= 1 {
            score = score.min(cfg.single_email_cap);
        }
        score.clamp(0.0, 1.0)
    }
}

impl Default for ChainAnalyzer {
    fn default() -> Self {
        Self::new(ChainScoringConfig::default(), EntityExtractor::default())
    }
}

struct ScoreInputs {
    has_start: bool,
    has_completion: bool,
    participant_count: usize,
    duration_hours: f64,
    email_count: usize,
    expected_entities: usize,
    present_entities: usize,
}

fn bool_factor(present: bool) -> f64 {
    if present { 1.0 } else { 0.0 }
}

/// Type with the most keyword hits. Ties go to the earlier entry of
/// ESCALATION, RFQ, ORDER, SUPPORT; no hits at all is OTHER.
fn dominant_type(emails: &[Email]) -> ChainType {
    let mut counts = [
        (ChainType::Escalation, 0usize),
        (ChainType::Rfq, 0),
        (ChainType::Order, 0),
        (ChainType::Support, 0),
    ];
    for email in emails {
        let text = email.text();
        counts[0].1 += ESCALATION_MARKER.find_iter(&text).count();
        counts[1].1 += RFQ_KEYWORDS.find_iter(&text).count();
        counts[2].1 += ORDER_KEYWORDS.find_iter(&text).count();
        counts[3].1 += SUPPORT_KEYWORDS.find_iter(&text).count();
    }

    let mut best = (ChainType::Other, 0usize);
    for (chain_type, hits) in counts {
        if hits > best.1 {
            best = (chain_type, hits);
        }
    }
    best.0
}

fn expected_entities(chain_type: ChainType) -> Vec<&'static str> {
    match chain_type {
        ChainType::Rfq => vec![MISSING_QUOTE_NUMBER],
        ChainType::Order => vec![MISSING_PO_NUMBER],
        ChainType::Support | ChainType::Escalation => vec![MISSING_CASE_NUMBER],
        ChainType::Other | ChainType::Unknown => Vec::new(),
    }
}

fn has_entity_kind(entities: &EntitySet, kind: &str) -> bool {
    match kind {
        MISSING_QUOTE_NUMBER => !entities.quote_numbers.is_empty(),
        MISSING_PO_NUMBER => !entities.po_numbers.is_empty() || !entities.order_references.is_empty(),
        MISSING_CASE_NUMBER => !entities.case_numbers.is_empty(),
        _ => false,
    }
}
