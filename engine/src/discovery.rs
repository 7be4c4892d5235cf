//! Discovery manager - extracts and merges evidence-linked claims.
//!
//! Discoveries accumulate across iterations: every extraction is a merge
//! against the existing set (strengthen, supersede, or drop entries),
//! never a context-free replacement. Only ANALYSIS output can originate a
//! discovery; literature output may only supplement one. The set is capped
//! and every persisted entry must cite at least one analysis task.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use shared_types::{Discovery, PlanTask, TaskKind};

use crate::inference::decode::decode_lenient;
use crate::inference::{InferenceError, InferenceGateway};

pub const MAX_DISCOVERIES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery judgment call failed: {0}")]
    Inference(#[from] InferenceError),
}

#[derive(Debug, Deserialize)]
struct RawDiscoveryEnvelope {
    #[serde(default)]
    discoveries: Vec<RawDiscovery>,
}

#[derive(Debug, Deserialize)]
struct RawDiscovery {
    title: String,
    claim: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    evidence: Vec<String>,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    novelty: String,
}

#[derive(Clone)]
pub struct DiscoveryManager {
    gateway: Arc<dyn InferenceGateway>,
}

impl DiscoveryManager {
    pub fn new(gateway: Arc<dyn InferenceGateway>) -> Self {
        Self { gateway }
    }

    /// Merge-extract discoveries from a batch of freshly completed tasks.
    ///
    /// Returns `None` - with no judgment call made - when the batch holds
    /// no ANALYSIS task or when the judgment output is unusable; `None`
    /// means "keep the existing set unchanged". `known_analysis_ids` is
    /// the id set of every executed analysis task, used to enforce the
    /// evidence invariant.
    pub async fn extract(
        &self,
        question: &str,
        existing: &[Discovery],
        new_tasks: &[PlanTask],
        known_analysis_ids: &HashSet<String>,
    ) -> Result<Option<Vec<Discovery>>, DiscoveryError> {
        if !new_tasks.iter().any(|t| t.kind == TaskKind::Analysis) {
            tracing::debug!("No analysis task in batch; skipping discovery extraction");
            return Ok(None);
        }

        let prompt = build_prompt(question, existing, new_tasks);
        let raw = self.gateway.infer("discovery", &prompt).await?;

        let Some((envelope, _)) = decode_lenient::<RawDiscoveryEnvelope>(&raw) else {
            tracing::warn!("Discovery output malformed; keeping existing set unchanged");
            return Ok(None);
        };

        let mut merged = Vec::new();
        for raw_discovery in envelope.discoveries {
            if merged.len() == MAX_DISCOVERIES {
                tracing::warn!(
                    cap = MAX_DISCOVERIES,
                    "Discovery cap reached; dropping remainder"
                );
                break;
            }
            match validate(raw_discovery, known_analysis_ids) {
                Ok(discovery) => merged.push(discovery),
                Err(reason) => {
                    tracing::warn!(reason = %reason, "Dropping invalid discovery");
                }
            }
        }

        Ok(Some(merged))
    }
}

/// Enforce the evidence invariant: at least one evidence entry referencing
/// an executed ANALYSIS task. An invalid discovery must not be persisted.
fn validate(raw: RawDiscovery, known_analysis_ids: &HashSet<String>) -> Result<Discovery, String> {
    if raw.title.trim().is_empty() || raw.claim.trim().is_empty() {
        return Err("missing title or claim".to_string());
    }
    let analysis_backed = raw
        .evidence
        .iter()
        .any(|id| id.starts_with("ana-") && known_analysis_ids.contains(id));
    if !analysis_backed {
        return Err(format!(
            "discovery '{}' cites no executed analysis task",
            raw.title
        ));
    }
    Ok(Discovery {
        title: raw.title,
        claim: raw.claim,
        summary: raw.summary,
        evidence: raw.evidence,
        artifacts: raw.artifacts,
        novelty: raw.novelty,
    })
}

fn build_prompt(question: &str, existing: &[Discovery], new_tasks: &[PlanTask]) -> String {
    let existing_block = if existing.is_empty() {
        "(none)".to_string()
    } else {
        existing
            .iter()
            .map(|d| {
                format!(
                    "- {} | claim: {} | evidence: {}",
                    d.title,
                    d.claim,
                    d.evidence.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let outputs = new_tasks
        .iter()
        .map(|t| format!("[{} {:?}] {}\n{}", t.id, t.kind, t.objective, t.output))
        .collect::<Vec<_>>()
        .join("\n---\n");

    format!(
        "Maintain the set of scientific discoveries for this research \
         question, merging new evidence into the existing set: strengthen, \
         supersede, or drop entries as warranted. Never restate the set \
         from scratch without regard to what exists.\n\
         Question: {question}\n\
         Existing discoveries:\n{existing_block}\n\
         New task outputs:\n{outputs}\n\n\
         Rules: at most {cap} discoveries; every discovery must cite at \
         least one ANALYSIS task id (ana-*) in its evidence; literature \
         output may only supplement an existing analysis-backed claim.\n\n\
         Respond with JSON: {{\"discoveries\": [{{\"title\": \"...\", \
         \"claim\": \"...\", \"summary\": \"...\", \"evidence\": \
         [\"ana-1\"], \"artifacts\": [], \"novelty\": \"...\"}}]}}",
        cap = MAX_DISCOVERIES,
    )
}
