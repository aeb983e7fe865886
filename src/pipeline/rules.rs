//! Phase 1: rule-based analysis.
//!
//! Runs for every email without touching a model:
//! - keyword rules → priority (critical/high/low, default medium)
//! - keyword rules → intent
//! - chain markers → workflow state
//! - priority + age → SLA status and urgency
//!
//! The result decides whether any inference phase is worth paying for.

use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::pipeline::chain::classify_email;
use crate::pipeline::entities::{EntityExtractor, EntitySet};
use crate::pipeline::types::{Email, Intent, Phase1Result, Priority, SlaStatus, Urgency};

/// Confidence reported for every rule-based result.
pub const PHASE1_CONFIDENCE: f64 = 0.6;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
    /// Subject and body.
    Content,
}

/// A keyword rule mapping a match to a value.
#[derive(Debug, Clone)]
pub struct KeywordRule<T> {
    /// Compiled regex for matching.
    pub regex: Regex,
    /// Which email field to match.
    pub field: RuleField,
    pub value: T,
}

impl<T: Copy> KeywordRule<T> {
    fn matches(&self, email: &Email, content: &str) -> Option<T> {
        let haystack = match self.field {
            RuleField::Sender => email.sender.as_str(),
            RuleField::Subject => email.subject.as_str(),
            RuleField::Content => content,
        };
        self.regex.is_match(haystack).then_some(self.value)
    }
}

/// Rule-based Phase 1 analyzer. Rules are evaluated in order; first match wins.
pub struct RuleBasedAnalyzer {
    priority_rules: Vec<KeywordRule<Priority>>,
    intent_rules: Vec<KeywordRule<Intent>>,
    /// Senders whose mail is always at least high priority.
    priority_senders: Vec<Regex>,
    extractor: EntityExtractor,
}

fn literal(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in rule pattern")
}

impl RuleBasedAnalyzer {
    /// Create an analyzer with the default keyword tables.
    pub fn default_rules(extractor: EntityExtractor) -> Self {
        let priority_rules = vec![
            KeywordRule {
                regex: literal(r"(?i)\b(urgent|asap|emergency|critical|line\s+down|system\s+down|production\s+down)\b"),
                field: RuleField::Content,
                value: Priority::Critical,
            },
            KeywordRule {
                regex: literal(r"(?i)\b(important|priority|escalat\w*|deadline|expedite|time[\s-]sensitive)\b"),
                field: RuleField::Content,
                value: Priority::High,
            },
            // Automated senders never outrank a human
            KeywordRule {
                regex: literal(r"(?i)^(no[\-_.]?reply|mailer[\-_]?daemon|postmaster)@"),
                field: RuleField::Sender,
                value: Priority::Low,
            },
            KeywordRule {
                regex: literal(r"(?i)\b(fyi|newsletter|no\s+rush|unsubscribe|for\s+your\s+records)\b"),
                field: RuleField::Content,
                value: Priority::Low,
            },
        ];

        let intent_rules = vec![
            KeywordRule {
                regex: literal(r"(?i)\b(escalat\w*|complaint|unacceptable|urgent\s+attention|legal\s+action)\b"),
                field: RuleField::Content,
                value: Intent::Escalation,
            },
            KeywordRule {
                regex: literal(r"(?i)\b(shipped|delivered|tracking|status\s+update|in\s+progress|out\s+for\s+delivery|resolved)\b"),
                field: RuleField::Content,
                value: Intent::StatusUpdate,
            },
            KeywordRule {
                regex: literal(r"(?i)\b(rfq|quote|quotation|pricing|price\s+request|how\s+much)\b"),
                field: RuleField::Content,
                value: Intent::RequestQuote,
            },
            KeywordRule {
                regex: literal(r"(?i)\b(purchase\s+order|po\s*#?\s*\d|place\s+an?\s+order|order\s+confirmation|we\s+would\s+like\s+to\s+order)\b"),
                field: RuleField::Content,
                value: Intent::PlaceOrder,
            },
            KeywordRule {
                regex: literal(r"(?i)\b(case|ticket|support|problem|defect|broken|not\s+working|rma|return)\b"),
                field: RuleField::Content,
                value: Intent::SupportRequest,
            },
            KeywordRule {
                regex: literal(r"(?i)\b(fyi|newsletter|announcement|for\s+your\s+information)\b"),
                field: RuleField::Content,
                value: Intent::Information,
            },
        ];

        Self {
            priority_rules,
            intent_rules,
            priority_senders: Vec::new(),
            extractor,
        }
    }

    /// Create an analyzer with no rules.
    #[cfg(test)]
    fn empty(extractor: EntityExtractor) -> Self {
        Self {
            priority_rules: Vec::new(),
            intent_rules: Vec::new(),
            priority_senders: Vec::new(),
            extractor,
        }
    }

    /// Add a sender/domain pattern whose mail is always at least high priority.
    pub fn add_priority_sender(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.priority_senders.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Add a custom priority rule, checked before the defaults.
    #[cfg(test)]
    fn add_priority_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        priority: Priority,
    ) -> Result<(), regex::Error> {
        self.priority_rules.insert(
            0,
            KeywordRule {
                regex: Regex::new(pattern)?,
                field,
                value: priority,
            },
        );
        Ok(())
    }

    pub fn extractor(&self) -> &EntityExtractor {
        &self.extractor
    }

    /// Analyse one email as of `as_of`. Pure apart from the timing measurement.
    pub fn analyze(&self, email: &Email, as_of: DateTime<Utc>) -> Phase1Result {
        let started = Instant::now();
        let content = email.text();

        let entities = self.extractor.extract(&content);
        let workflow_state = classify_email(email);

        let mut priority = self
            .priority_rules
            .iter()
            .find_map(|rule| rule.matches(email, &content))
            .unwrap_or(Priority::Medium);

        if email.is_important && priority < Priority::High {
            debug!(email_id = %email.id, "Importance flag raises priority");
            priority = Priority::High;
        }
        if priority < Priority::High
            && self.priority_senders.iter().any(|r| r.is_match(&email.sender))
        {
            debug!(email_id = %email.id, sender = %email.sender, "Sender matches priority pattern");
            priority = Priority::High;
        }

        let intent = self
            .intent_rules
            .iter()
            .find_map(|rule| rule.matches(email, &content))
            .unwrap_or(Intent::Unknown);

        let sla_status = SlaStatus::evaluate(priority, email.received_at, as_of);
        let urgency = urgency_for(priority, sla_status);

        debug!(
            email_id = %email.id,
            state = %workflow_state,
            priority = %priority,
            intent = ?intent,
            sla = ?sla_status,
            entities = entities.total(),
            "Phase 1 complete"
        );

        Phase1Result {
            workflow_state,
            priority,
            intent,
            urgency,
            sla_status,
            entities,
            confidence: PHASE1_CONFIDENCE,
            processing_time: started.elapsed(),
        }
    }
}

fn urgency_for(priority: Priority, sla: SlaStatus) -> Urgency {
    match (priority, sla) {
        (Priority::Critical, _) | (_, SlaStatus::Overdue) => Urgency::Immediate,
        (Priority::High, _) | (_, SlaStatus::AtRisk) => Urgency::Elevated,
        _ => Urgency::Routine,
    }
}

/// Entities of a Phase 1 result that a later phase did not already report.
pub fn unreported(known: &EntitySet, candidate: &EntitySet) -> EntitySet {
    fn diff(known: &[String], candidate: &[String]) -> Vec<String> {
        candidate
            .iter()
            .filter(|c| !known.contains(c))
            .cloned()
            .collect()
    }
    EntitySet {
        po_numbers: diff(&known.po_numbers, &candidate.po_numbers),
        quote_numbers: diff(&known.quote_numbers, &candidate.quote_numbers),
        case_numbers: diff(&known.case_numbers, &candidate.case_numbers),
        part_numbers: diff(&known.part_numbers, &candidate.part_numbers),
        order_references: diff(&known.order_references, &candidate.order_references),
        contacts: diff(&known.contacts, &candidate.contacts),
    }
}
