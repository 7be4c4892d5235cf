//! Reflection manager - folds an iteration's results into long-lived state.
//!
//! Reflection updates the mutable objective, methodology, conversation
//! title, and the bounded key-insight list. Insights are re-bounded on
//! every call (merge, dedupe, drop least valuable), never just appended.
//! Reflection degrades to the current state unchanged when there is no
//! usable output or the judgment step fails - it never errors.

use std::sync::Arc;

use serde::Deserialize;

use shared_types::{ConversationState, PlanTask};

use crate::executor::TASK_FAILURE_PREFIX;
use crate::inference::decode::decode_lenient;
use crate::inference::InferenceGateway;

#[derive(Debug, Deserialize)]
struct RawReflection {
    #[serde(default)]
    current_objective: Option<String>,
    #[serde(default)]
    key_insights: Vec<String>,
    #[serde(default)]
    methodology: Option<String>,
    #[serde(default)]
    conversation_title: Option<String>,
}

/// The reflected long-lived fields, ready to write back onto the state.
#[derive(Debug, Clone)]
pub struct ReflectionOutcome {
    pub current_objective: String,
    pub key_insights: Vec<String>,
    pub methodology: String,
    pub conversation_title: Option<String>,
}

impl ReflectionOutcome {
    fn unchanged(state: &ConversationState) -> Self {
        Self {
            current_objective: state.current_objective.clone(),
            key_insights: state.key_insights.clone(),
            methodology: state.methodology.clone(),
            conversation_title: state.title.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ReflectionManager {
    gateway: Arc<dyn InferenceGateway>,
    insight_cap: usize,
}

impl ReflectionManager {
    pub fn new(gateway: Arc<dyn InferenceGateway>, insight_cap: usize) -> Self {
        Self {
            gateway,
            insight_cap: insight_cap.max(1),
        }
    }

    pub async fn reflect(
        &self,
        state: &ConversationState,
        completed: &[PlanTask],
        hypothesis: Option<&str>,
    ) -> ReflectionOutcome {
        let usable: Vec<&PlanTask> = completed
            .iter()
            .filter(|t| t.has_usable_output() && !t.output.starts_with(TASK_FAILURE_PREFIX))
            .collect();
        if usable.is_empty() {
            tracing::debug!(
                conversation_state_id = %state.id,
                "No usable task output this iteration; reflection unchanged"
            );
            return ReflectionOutcome::unchanged(state);
        }

        let prompt = build_prompt(state, &usable, hypothesis);
        let raw = match self.gateway.infer("reflection", &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    conversation_state_id = %state.id,
                    error = %e,
                    "Reflection judgment failed; keeping state unchanged"
                );
                return ReflectionOutcome::unchanged(state);
            }
        };

        let Some((parsed, _)) = decode_lenient::<RawReflection>(&raw) else {
            tracing::warn!(
                conversation_state_id = %state.id,
                "Reflection output malformed; keeping state unchanged"
            );
            return ReflectionOutcome::unchanged(state);
        };

        ReflectionOutcome {
            current_objective: parsed
                .current_objective
                .filter(|o| !o.trim().is_empty())
                .unwrap_or_else(|| state.current_objective.clone()),
            key_insights: rebound_insights(
                parsed.key_insights,
                &state.key_insights,
                self.insight_cap,
            ),
            methodology: parsed
                .methodology
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| state.methodology.clone()),
            conversation_title: parsed
                .conversation_title
                .filter(|t| !t.trim().is_empty())
                .or_else(|| state.title.clone()),
        }
    }
}

/// Merge new insights (most valuable first, per the judgment's ordering)
/// with the prior list, dedupe, and truncate to the cap.
fn rebound_insights(new: Vec<String>, prior: &[String], cap: usize) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for insight in new.into_iter().chain(prior.iter().cloned()) {
        let trimmed = insight.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fold = trimmed.to_lowercase();
        if seen.contains(&fold) {
            continue;
        }
        seen.push(fold);
        merged.push(trimmed.to_string());
        if merged.len() == cap {
            break;
        }
    }

    merged
}

fn build_prompt(state: &ConversationState, usable: &[&PlanTask], hypothesis: Option<&str>) -> String {
    let outputs = usable
        .iter()
        .map(|t| format!("[{}] {}\n{}", t.id, t.objective, t.output))
        .collect::<Vec<_>>()
        .join("\n---\n");
    let prior_insights = if state.key_insights.is_empty() {
        "(none)".to_string()
    } else {
        state
            .key_insights
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Reflect on this research iteration and fold it into the \
         conversation's long-lived state.\n\
         Original objective: {original}\n\
         Current objective: {current}\n\
         Hypothesis: {hypothesis}\n\
         Prior key insights:\n{prior_insights}\n\
         This iteration's outputs:\n{outputs}\n\n\
         Return the updated objective (it may drift), the merged key \
         insights ordered most valuable first, the current methodology, \
         and a short conversation title.\n\n\
         Respond with JSON: {{\"current_objective\": \"...\", \
         \"key_insights\": [\"...\"], \"methodology\": \"...\", \
         \"conversation_title\": \"...\"}}",
        original = state.objective,
        current = state.current_objective,
        hypothesis = hypothesis.unwrap_or("(none yet)"),
    )
}
