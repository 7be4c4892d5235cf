//! Hypothesis manager - maintains the single working hypothesis.
//!
//! Exactly one hypothesis is live per conversation. "Create" versus
//! "update" is derived from whether a prior hypothesis exists, never
//! passed in; an update is always a full replacement text, not a delta.

use std::sync::Arc;

use serde::Deserialize;

use shared_types::PlanTask;

use crate::executor::TASK_FAILURE_PREFIX;
use crate::inference::decode::decode_lenient;
use crate::inference::{InferenceError, InferenceGateway};

#[derive(Debug, thiserror::Error)]
pub enum HypothesisError {
    /// No completed task produced evidence to reason over. Callers must
    /// not treat this as an empty hypothesis.
    #[error("no usable task output to form a hypothesis from")]
    NoUsableOutput,
    #[error("hypothesis judgment call failed: {0}")]
    Inference(#[from] InferenceError),
}

/// A full-replacement hypothesis revision.
#[derive(Debug, Clone)]
pub struct HypothesisUpdate {
    pub hypothesis: String,
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
struct RawHypothesis {
    hypothesis: String,
    #[serde(default)]
    rationale: String,
}

#[derive(Clone)]
pub struct HypothesisManager {
    gateway: Arc<dyn InferenceGateway>,
}

impl HypothesisManager {
    pub fn new(gateway: Arc<dyn InferenceGateway>) -> Self {
        Self { gateway }
    }

    pub async fn create_or_update(
        &self,
        prior: Option<&str>,
        completed: &[PlanTask],
        current_objective: &str,
    ) -> Result<HypothesisUpdate, HypothesisError> {
        let evidence: Vec<&PlanTask> = completed
            .iter()
            .filter(|t| t.has_usable_output() && !t.output.starts_with(TASK_FAILURE_PREFIX))
            .collect();
        if evidence.is_empty() {
            return Err(HypothesisError::NoUsableOutput);
        }

        let prompt = build_prompt(prior, &evidence, current_objective);
        let raw = self.gateway.infer("hypothesis", &prompt).await?;

        if let Some((parsed, _)) = decode_lenient::<RawHypothesis>(&raw) {
            if !parsed.hypothesis.trim().is_empty() {
                return Ok(HypothesisUpdate {
                    hypothesis: parsed.hypothesis.trim().to_string(),
                    rationale: parsed.rationale.trim().to_string(),
                });
            }
        }

        // The hypothesis is free text anyway; a response that resisted
        // structural decoding is adopted verbatim rather than discarded.
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(HypothesisError::NoUsableOutput);
        }
        tracing::warn!("Hypothesis output malformed; adopting raw text");
        Ok(HypothesisUpdate {
            hypothesis: trimmed.to_string(),
            rationale: String::new(),
        })
    }
}

fn build_prompt(prior: Option<&str>, evidence: &[&PlanTask], current_objective: &str) -> String {
    let documents = evidence
        .iter()
        .map(|t| format!("[{}] {}\n{}", t.id, t.objective, t.output))
        .collect::<Vec<_>>()
        .join("\n---\n");

    match prior {
        Some(prior) => format!(
            "Revise the working hypothesis in light of new evidence. Produce \
             a complete replacement text that preserves directional \
             continuity with the prior formulation.\n\
             Objective: {current_objective}\n\
             Prior hypothesis: {prior}\n\
             New evidence:\n{documents}\n\n\
             Respond with JSON: {{\"hypothesis\": \"...\", \"rationale\": \"...\"}}"
        ),
        None => format!(
            "Formulate a first working hypothesis from the evidence below.\n\
             Objective: {current_objective}\n\
             Evidence:\n{documents}\n\n\
             Respond with JSON: {{\"hypothesis\": \"...\", \"rationale\": \"...\"}}"
        ),
    }
}
