//! Phase routing: decides how much analysis each email gets.
//!
//! Phase 1 always runs. Inference phases are reserved for elevated or
//! in-flight work, so most mail never reaches a model.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::types::{ChainAnalysis, Email, Phase, Phase2Result, Priority, WorkflowState};

/// Operator overrides for routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Run every phase regardless of signals.
    #[serde(default)]
    pub force_deep_analysis: bool,
    /// Never leave Phase 1. Wins over `force_deep_analysis`.
    #[serde(default)]
    pub phase1_only: bool,
}

/// Phases to run for one item. Phase 3 can only be planned together with
/// Phase 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhasePlan {
    /// Phase 1.
    Quick,
    /// Phase 1 then Phase 2.
    Classify,
    /// Phase 1, Phase 2, then Phase 3.
    Deep,
}

impl PhasePlan {
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            Self::Quick => &[Phase::Phase1],
            Self::Classify => &[Phase::Phase1, Phase::Phase2],
            Self::Deep => &[Phase::Phase1, Phase::Phase2, Phase::Phase3],
        }
    }

    pub fn includes(&self, phase: Phase) -> bool {
        self.phases().contains(&phase)
    }

    /// Last phase of the plan.
    pub fn last(&self) -> Phase {
        match self {
            Self::Quick => Phase::Phase1,
            Self::Classify => Phase::Phase2,
            Self::Deep => Phase::Phase3,
        }
    }
}

/// A plan plus the reasons that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub plan: PhasePlan,
    pub reasons: Vec<String>,
}

impl RoutingDecision {
    pub fn phases(&self) -> &'static [Phase] {
        self.plan.phases()
    }

    pub fn reason(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Stateless router over a [`RoutingPolicy`].
#[derive(Debug, Clone, Default)]
pub struct PhaseRouter {
    policy: RoutingPolicy,
}

impl PhaseRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Initial plan, computed right after Phase 1.
    pub fn route(&self, email: &Email, chain: &ChainAnalysis, priority: Priority) -> RoutingDecision {
        let decision = if self.policy.phase1_only {
            RoutingDecision {
                plan: PhasePlan::Quick,
                reasons: vec!["phase1_only policy".into()],
            }
        } else if self.policy.force_deep_analysis {
            RoutingDecision {
                plan: PhasePlan::Deep,
                reasons: vec!["force_deep_analysis policy".into()],
            }
        } else {
            let mut reasons = Vec::new();
            if priority.is_elevated() {
                reasons.push(format!("priority {priority}"));
            }
            if chain.current_state() == Some(WorkflowState::InProgress) {
                reasons.push("chain in progress".into());
            }
            if reasons.is_empty() {
                RoutingDecision {
                    plan: PhasePlan::Quick,
                    reasons: vec![format!("priority {priority}, chain not in progress")],
                }
            } else {
                RoutingDecision {
                    plan: PhasePlan::Classify,
                    reasons,
                }
            }
        };

        debug!(
            email_id = %email.id,
            plan = ?decision.plan,
            reason = %decision.reason(),
            "Routing decision"
        );
        decision
    }

    /// Re-plan once Phase 2 has produced a result. Only a `Classify` plan can
    /// grow; Phase 3 is added when the model rates the item elevated or the
    /// chain is complete.
    pub fn route_after_phase2(
        &self,
        decision: RoutingDecision,
        chain: &ChainAnalysis,
        phase2: &Phase2Result,
    ) -> RoutingDecision {
        if decision.plan != PhasePlan::Classify {
            return decision;
        }

        let mut escalate = Vec::new();
        if phase2.priority.is_elevated() {
            escalate.push(format!("phase2 priority {}", phase2.priority));
        }
        if chain.is_complete {
            escalate.push("chain complete".into());
        }
        if escalate.is_empty() {
            return decision;
        }

        debug!(chain_id = %chain.chain_id, reason = %escalate.join("; "), "Adding phase3");
        let mut reasons = decision.reasons;
        reasons.extend(escalate);
        RoutingDecision {
            plan: PhasePlan::Deep,
            reasons,
        }
    }
}
