//! Continuation decider - CONTINUE vs ASK policy state machine.
//!
//! The decision depends on iteration count, research mode, and (for the
//! default semi-autonomous mode only) an evidence-based judgment over the
//! most recent level and the hypothesis. Ties, low confidence, and
//! judgment failures all bias toward ASK: pausing for a human is the safe
//! default, runaway autonomous continuation is not.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use shared_types::{ConversationState, PlanTask, ResearchMode};

use crate::inference::decode::decode_lenient;
use crate::inference::InferenceGateway;
use crate::planner::PlanProposal;

/// Reasons the loop hands control back to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AskTrigger {
    FoundationalContradiction,
    ResearchConvergence,
    ForkedPaths,
    LowMarginalValue,
    AmbiguousIntent,
    InterpretiveDisagreement,
    IrreversibleDecision,
    ComplexAnalysisUnapproved,
    /// Steering mode pauses unconditionally after each level.
    SteeringMode,
    /// The judgment step failed; pausing is the safe default.
    JudgmentUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Ask,
}

#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub trigger: Option<AskTrigger>,
    pub confidence: f64,
    pub rationale: String,
}

impl DecisionOutcome {
    fn ask(trigger: AskTrigger, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            decision: Decision::Ask,
            trigger: Some(trigger),
            confidence,
            rationale: rationale.into(),
        }
    }

    fn continue_with(confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            decision: Decision::Continue,
            trigger: None,
            confidence,
            rationale: rationale.into(),
        }
    }
}

// Wire shape expected from the judgment step.
#[derive(Debug, Deserialize)]
struct RawJudgment {
    decision: String,
    #[serde(default)]
    trigger: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Clone)]
pub struct ContinuationDecider {
    gateway: Arc<dyn InferenceGateway>,
    confidence_floor: f64,
}

impl ContinuationDecider {
    pub fn new(gateway: Arc<dyn InferenceGateway>, confidence_floor: f64) -> Self {
        Self {
            gateway,
            confidence_floor,
        }
    }

    /// Decide whether the loop proceeds after this iteration.
    ///
    /// `proposal` is the current iteration's plan proposal;
    /// `executed_level` the tasks it just ran (empty when the proposal was
    /// empty and nothing executed).
    pub async fn decide(
        &self,
        state: &ConversationState,
        proposal: &PlanProposal,
        iteration: u32,
        executed_level: &[PlanTask],
    ) -> DecisionOutcome {
        // Terminal rule, independent of mode: nothing proposed means
        // nothing left to continue with.
        if proposal.is_objective_achieved() {
            return DecisionOutcome::ask(
                AskTrigger::ResearchConvergence,
                1.0,
                "Planner proposed no further tasks",
            );
        }

        match state.research_mode {
            ResearchMode::Steering => DecisionOutcome::ask(
                AskTrigger::SteeringMode,
                1.0,
                "Steering mode pauses after every level",
            ),
            ResearchMode::FullyAutonomous => {
                DecisionOutcome::continue_with(1.0, "Fully autonomous mode with work remaining")
            }
            ResearchMode::SemiAutonomous => {
                if iteration <= 1 {
                    return DecisionOutcome::continue_with(
                        0.95,
                        "First iteration always continues",
                    );
                }
                self.judge(state, iteration, executed_level).await
            }
        }
    }

    /// Evidence-based judgment for semi-autonomous mode beyond iteration 1.
    async fn judge(
        &self,
        state: &ConversationState,
        iteration: u32,
        executed_level: &[PlanTask],
    ) -> DecisionOutcome {
        let prompt = build_prompt(state, iteration, executed_level);
        let raw = match self.gateway.infer("decider", &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    conversation_state_id = %state.id,
                    error = %e,
                    "Continuation judgment failed; defaulting to ASK"
                );
                return DecisionOutcome::ask(
                    AskTrigger::JudgmentUnavailable,
                    0.0,
                    format!("Continuation judgment unavailable: {e}"),
                );
            }
        };

        let Some((judgment, _)) = decode_lenient::<RawJudgment>(&raw) else {
            return DecisionOutcome::ask(
                AskTrigger::JudgmentUnavailable,
                0.0,
                "Continuation judgment output was unparseable",
            );
        };

        let confidence = judgment.confidence.unwrap_or(0.0).clamp(0.0, 1.0);
        let rationale = judgment
            .rationale
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "(no rationale given)".to_string());
        let trigger = judgment
            .trigger
            .as_deref()
            .and_then(|t| AskTrigger::from_str(t.trim()).ok());

        match judgment.decision.trim().to_ascii_lowercase().as_str() {
            "continue" if confidence >= self.confidence_floor => DecisionOutcome {
                decision: Decision::Continue,
                trigger: None,
                confidence,
                rationale,
            },
            "continue" => DecisionOutcome {
                // Low-confidence continue is a tie; ties go to the human.
                decision: Decision::Ask,
                trigger,
                confidence,
                rationale: format!("Low-confidence continuation ({confidence:.2}): {rationale}"),
            },
            "ask" => DecisionOutcome {
                decision: Decision::Ask,
                trigger,
                confidence,
                rationale,
            },
            other => {
                tracing::warn!(decision = %other, "Unknown continuation decision; defaulting to ASK");
                DecisionOutcome::ask(
                    AskTrigger::JudgmentUnavailable,
                    0.0,
                    format!("Unknown decision '{other}'"),
                )
            }
        }
    }
}

fn build_prompt(state: &ConversationState, iteration: u32, executed_level: &[PlanTask]) -> String {
    let outputs = executed_level
        .iter()
        .map(|t| format!("[{}] {}\n{}", t.id, t.objective, t.output))
        .collect::<Vec<_>>()
        .join("\n---\n");
    let triggers = [
        "foundational_contradiction",
        "research_convergence",
        "forked_paths",
        "low_marginal_value",
        "ambiguous_intent",
        "interpretive_disagreement",
        "irreversible_decision",
        "complex_analysis_unapproved",
    ]
    .join(", ");

    format!(
        "Decide whether an autonomous research loop should continue or \
         pause to ask the user.\n\
         Iteration: {iteration}\n\
         Current objective: {objective}\n\
         Hypothesis: {hypothesis}\n\
         Most recent level's outputs:\n{outputs}\n\n\
         Pause (\"ask\") when one of these applies: {triggers}. Continue \
         only when none do and the next step is unambiguous.\n\n\
         Respond with JSON: {{\"decision\": \"continue\"|\"ask\", \
         \"trigger\": \"<one of the reasons, when asking>\", \
         \"confidence\": 0.0-1.0, \"rationale\": \"...\"}}",
        objective = state.current_objective,
        hypothesis = state.current_hypothesis.as_deref().unwrap_or("(none yet)"),
    )
}
