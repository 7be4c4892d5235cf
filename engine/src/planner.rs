//! Level planner - proposes the next batch of investigative tasks.
//!
//! Two generation modes, derived from history rather than passed in:
//! bootstrap (no task has ever run; the prompt biases toward a single
//! literature survey) and continuation (accumulated insights, discoveries,
//! artifacts, and the planner's own prior suggestions feed the prompt; the
//! user's latest input overrides any previously suggested direction).
//!
//! Plan generation never throws for malformed judgment output. Decoding
//! descends: strict JSON, fenced block, largest object, field-level
//! extraction, and finally a safe default task built from the user's
//! literal input. Only transport-level gateway failures are loud.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use shared_types::{ConversationState, DatasetRef, PlanTask, TaskKind};

use crate::inference::decode::{decode_lenient, extract_string_field};
use crate::inference::{InferenceError, InferenceGateway};

/// Sentinel the judgment step places in `current_objective` when research
/// is complete and no further tasks should be proposed.
pub const OBJECTIVE_ACHIEVED_MARKER: &str = "OBJECTIVE_ACHIEVED";

const MAX_TASKS_PER_LEVEL: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The judgment step itself was unreachable. Malformed output is never
    /// an error - it falls down the recovery chain instead.
    #[error("planning judgment call failed: {0}")]
    Inference(#[from] InferenceError),
}

/// Which generation mode produced a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Bootstrap,
    Continuation,
}

/// The planner's proposal for the next level.
#[derive(Debug, Clone)]
pub struct PlanProposal {
    pub current_objective: String,
    /// 1-3 tasks, all at the same next level. Empty iff the objective was
    /// achieved (signaled by [`OBJECTIVE_ACHIEVED_MARKER`]).
    pub tasks: Vec<PlanTask>,
    pub mode: PlanMode,
}

impl PlanProposal {
    pub fn is_objective_achieved(&self) -> bool {
        self.tasks.is_empty()
    }
}

// Wire shape expected from the judgment step. Everything is optional or
// defaulted; the decode chain and materialization tolerate partial output.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    current_objective: Option<String>,
    #[serde(default)]
    tasks: Vec<RawPlanTask>,
}

#[derive(Debug, Deserialize)]
struct RawPlanTask {
    objective: String,
    #[serde(default, rename = "type", alias = "kind")]
    kind: Option<String>,
    #[serde(default)]
    datasets: Vec<String>,
}

/// Produces the next level of tasks from accumulated state and the user's
/// latest input.
#[derive(Clone)]
pub struct Planner {
    gateway: Arc<dyn InferenceGateway>,
}

impl Planner {
    pub fn new(gateway: Arc<dyn InferenceGateway>) -> Self {
        Self { gateway }
    }

    pub async fn plan(
        &self,
        state: &ConversationState,
        latest_user_input: &str,
    ) -> Result<PlanProposal, PlanError> {
        let mode = if state.plan.is_empty() {
            PlanMode::Bootstrap
        } else {
            PlanMode::Continuation
        };

        let prompt = match mode {
            PlanMode::Bootstrap => bootstrap_prompt(state, latest_user_input),
            PlanMode::Continuation => continuation_prompt(state, latest_user_input),
        };

        let raw = self.gateway.infer("planner", &prompt).await?;
        Ok(self.proposal_from_raw(state, latest_user_input, mode, &raw))
    }

    /// Descend the recovery chain over the judgment output. Infallible.
    fn proposal_from_raw(
        &self,
        state: &ConversationState,
        latest_user_input: &str,
        mode: PlanMode,
        raw: &str,
    ) -> PlanProposal {
        if let Some((plan, strategy)) = decode_lenient::<RawPlan>(raw) {
            if let Some(proposal) = materialize(state, mode, plan) {
                tracing::debug!(?strategy, tasks = proposal.tasks.len(), "Plan decoded");
                return proposal;
            }
        }

        // Field-level extraction: salvage at least one objective string.
        if let Some(objective) = extract_string_field(raw, "objective") {
            if !objective.trim().is_empty() {
                tracing::warn!(
                    conversation_state_id = %state.id,
                    "Plan output malformed; salvaged a single task objective by field extraction"
                );
                return single_task_proposal(state, mode, objective);
            }
        }

        tracing::warn!(
            conversation_state_id = %state.id,
            "Plan output unusable; degrading to safe default task"
        );
        default_proposal(state, mode, latest_user_input)
    }
}

/// Turn a decoded wire plan into a proposal, or None when the decode was
/// structurally fine but semantically unusable (empty without the
/// completion marker).
fn materialize(state: &ConversationState, mode: PlanMode, plan: RawPlan) -> Option<PlanProposal> {
    let current_objective = plan
        .current_objective
        .filter(|o| !o.trim().is_empty())
        .unwrap_or_else(|| state.current_objective.clone());

    if plan.tasks.is_empty() {
        // Empty is the achieved signal only when the objective says so;
        // otherwise it is indistinguishable from a degenerate generation
        // and falls through to the next recovery rung.
        if current_objective.contains(OBJECTIVE_ACHIEVED_MARKER) {
            return Some(PlanProposal {
                current_objective,
                tasks: Vec::new(),
                mode,
            });
        }
        return None;
    }

    let level = state.current_level + 1;
    let dataset_paths = dataset_path_index(state);
    let mut counters = id_counters(state);
    let mut tasks = Vec::new();

    for raw_task in plan.tasks.into_iter().take(MAX_TASKS_PER_LEVEL) {
        if raw_task.objective.trim().is_empty() {
            continue;
        }
        let kind = parse_kind(raw_task.kind.as_deref());
        let datasets = resolve_datasets(&state.id, &raw_task.datasets, &dataset_paths);
        tasks.push(new_task(&mut counters, kind, raw_task.objective, datasets, level));
    }

    if tasks.is_empty() {
        return None;
    }

    Some(PlanProposal {
        current_objective,
        tasks,
        mode,
    })
}

fn parse_kind(raw: Option<&str>) -> TaskKind {
    match raw.map(|s| s.trim().to_ascii_uppercase()) {
        Some(ref s) if s == "ANALYSIS" => TaskKind::Analysis,
        _ => TaskKind::Literature,
    }
}

/// Uploaded-file ids and prior-task artifact ids, each mapped to the
/// concrete storage path tasks are dispatched with.
fn dataset_path_index(state: &ConversationState) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for file in &state.uploaded_files {
        index.insert(file.id.clone(), file.path.clone());
    }
    for task in &state.plan {
        for artifact in &task.artifacts {
            index.insert(artifact.id.clone(), artifact.path.clone());
        }
    }
    index
}

fn resolve_datasets(
    conversation_state_id: &str,
    ids: &[String],
    index: &HashMap<String, String>,
) -> Vec<DatasetRef> {
    let mut resolved = Vec::new();
    for id in ids {
        match index.get(id) {
            Some(path) => resolved.push(DatasetRef {
                id: id.clone(),
                path: path.clone(),
            }),
            None => {
                tracing::warn!(
                    conversation_state_id = %conversation_state_id,
                    dataset_id = %id,
                    "Dropping unresolvable dataset reference"
                );
            }
        }
    }
    resolved
}

/// Per-kind id counters continuing past every task id ever handed out,
/// executed or merely suggested.
fn id_counters(state: &ConversationState) -> HashMap<TaskKind, u32> {
    let mut counters = HashMap::new();
    for task in state.plan.iter().chain(state.suggested_next_steps.iter()) {
        let number = task
            .id
            .rsplit('-')
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        let entry = counters.entry(task.kind).or_insert(0);
        *entry = (*entry).max(number);
    }
    counters
}

fn new_task(
    counters: &mut HashMap<TaskKind, u32>,
    kind: TaskKind,
    objective: String,
    datasets: Vec<DatasetRef>,
    level: u32,
) -> PlanTask {
    let counter = counters.entry(kind).or_insert(0);
    *counter += 1;
    PlanTask {
        id: format!("{}-{}", kind.id_prefix(), counter),
        objective,
        kind,
        datasets,
        level,
        started_at: None,
        ended_at: None,
        output: String::new(),
        artifacts: Vec::new(),
    }
}

fn single_task_proposal(
    state: &ConversationState,
    mode: PlanMode,
    objective: String,
) -> PlanProposal {
    let mut counters = id_counters(state);
    let task = new_task(
        &mut counters,
        TaskKind::Literature,
        objective,
        Vec::new(),
        state.current_level + 1,
    );
    PlanProposal {
        current_objective: state.current_objective.clone(),
        tasks: vec![task],
        mode,
    }
}

/// Terminal rung of the recovery chain: a guaranteed-safe proposal.
///
/// When the user's input is a bare affirmation of the previously suggested
/// direction, the prior suggestions are promoted as-is (re-leveled) rather
/// than fabricating a task from the literal word "yes".
fn default_proposal(
    state: &ConversationState,
    mode: PlanMode,
    latest_user_input: &str,
) -> PlanProposal {
    if is_affirmation(latest_user_input) && !state.suggested_next_steps.is_empty() {
        let level = state.current_level + 1;
        let tasks = state
            .suggested_next_steps
            .iter()
            .take(MAX_TASKS_PER_LEVEL)
            .cloned()
            .map(|mut task| {
                task.level = level;
                task
            })
            .collect();
        return PlanProposal {
            current_objective: state.current_objective.clone(),
            tasks,
            mode,
        };
    }

    let objective = if latest_user_input.trim().is_empty() {
        state.current_objective.clone()
    } else {
        latest_user_input.trim().to_string()
    };
    single_task_proposal(state, mode, objective)
}

/// Bare agreement with the previously suggested direction.
fn is_affirmation(input: &str) -> bool {
    let normalized = input.trim().trim_end_matches(['.', '!']).to_lowercase();
    matches!(
        normalized.as_str(),
        "yes" | "y" | "ok" | "okay" | "sure" | "proceed" | "continue" | "go ahead"
            | "sounds good" | "yes please" | "do it" | "lgtm"
    )
}

// ─── Prompt assembly ─────────────────────────────────────────────────────────

fn bootstrap_prompt(state: &ConversationState, latest_user_input: &str) -> String {
    format!(
        "You are planning the first level of an autonomous research loop.\n\
         Objective: {objective}\n\
         Latest user input: {input}\n\
         Available datasets (id: path):\n{datasets}\n\n\
         Propose at most {max} tasks for level 1. Unless the input clearly \
         requires analysis of an uploaded dataset, propose exactly one \
         LITERATURE task that surveys the field.\n\n\
         Respond with JSON: {{\"current_objective\": \"...\", \"tasks\": \
         [{{\"objective\": \"...\", \"type\": \"LITERATURE\"|\"ANALYSIS\", \
         \"datasets\": [\"<dataset or artifact id>\"]}}]}}",
        objective = state.objective,
        input = latest_user_input,
        datasets = dataset_listing(state),
        max = MAX_TASKS_PER_LEVEL,
    )
}

fn continuation_prompt(state: &ConversationState, latest_user_input: &str) -> String {
    let suggested = state
        .suggested_next_steps
        .iter()
        .map(|t| format!("- [{}] {}", t.id, t.objective))
        .collect::<Vec<_>>()
        .join("\n");
    let insights = state
        .key_insights
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    let discoveries = state
        .discoveries
        .iter()
        .map(|d| format!("- {}: {}", d.title, d.claim))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are planning the next level of an ongoing research loop.\n\
         Current objective: {objective}\n\
         Hypothesis: {hypothesis}\n\
         Key insights:\n{insights}\n\
         Discoveries:\n{discoveries}\n\
         Previously suggested next steps:\n{suggested}\n\
         Available datasets and artifacts (id: path):\n{datasets}\n\n\
         Latest user input (authoritative - if it changes direction, follow \
         it and discard the prior suggestions; if it merely agrees, refine \
         the suggestions): {input}\n\n\
         Propose 1-{max} mutually independent tasks for the next level, or \
         an empty task list with current_objective set to \
         \"{marker}\" if the objective is achieved.\n\n\
         Respond with JSON: {{\"current_objective\": \"...\", \"tasks\": \
         [{{\"objective\": \"...\", \"type\": \"LITERATURE\"|\"ANALYSIS\", \
         \"datasets\": [\"<dataset or artifact id>\"]}}]}}",
        objective = state.current_objective,
        hypothesis = state.current_hypothesis.as_deref().unwrap_or("(none yet)"),
        insights = insights,
        discoveries = discoveries,
        suggested = suggested,
        datasets = dataset_listing(state),
        input = latest_user_input,
        max = MAX_TASKS_PER_LEVEL,
        marker = OBJECTIVE_ACHIEVED_MARKER,
    )
}

fn dataset_listing(state: &ConversationState) -> String {
    let mut lines: Vec<String> = state
        .uploaded_files
        .iter()
        .map(|f| format!("- {}: {} (upload: {})", f.id, f.path, f.name))
        .collect();
    for task in &state.plan {
        for artifact in &task.artifacts {
            lines.push(format!(
                "- {}: {} (artifact of {})",
                artifact.id, artifact.path, task.id
            ));
        }
    }
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shared_types::{ArtifactKind, TaskArtifact, UploadedFile};

    struct ScriptedGateway {
        response: String,
    }

    #[async_trait]
    impl InferenceGateway for ScriptedGateway {
        async fn infer(&self, _role: &str, _prompt: &str) -> Result<String, InferenceError> {
            Ok(self.response.clone())
        }
    }

    fn planner_with(response: &str) -> Planner {
        Planner::new(Arc::new(ScriptedGateway {
            response: response.to_string(),
        }))
    }

    fn state_with_history() -> ConversationState {
        let mut state = ConversationState::new("conv_1", "characterize the cohort");
        state.current_level = 1;
        state.uploaded_files.push(UploadedFile {
            id: "file_cohort".to_string(),
            name: "cohort.csv".to_string(),
            path: "/uploads/conv_1/cohort.csv".to_string(),
            text: None,
        });
        state.plan.push(PlanTask {
            id: "lit-1".to_string(),
            objective: "survey prior work".to_string(),
            kind: TaskKind::Literature,
            datasets: vec![],
            level: 1,
            started_at: None,
            ended_at: Some(chrono::Utc::now()),
            output: "survey results".to_string(),
            artifacts: vec![TaskArtifact {
                id: "art_summary".to_string(),
                name: "summary table".to_string(),
                kind: ArtifactKind::Table,
                path: "/artifacts/conv_1/summary.parquet".to_string(),
            }],
        });
        state
    }

    #[tokio::test]
    async fn test_bootstrap_mode_when_plan_empty() {
        let planner = planner_with(
            r#"{"current_objective": "survey the field", "tasks": [{"objective": "survey", "type": "LITERATURE"}]}"#,
        );
        let state = ConversationState::new("conv_1", "objective");
        let proposal = planner.plan(&state, "start please").await.unwrap();
        assert_eq!(proposal.mode, PlanMode::Bootstrap);
        assert_eq!(proposal.tasks.len(), 1);
        assert_eq!(proposal.tasks[0].id, "lit-1");
        assert_eq!(proposal.tasks[0].level, 1);
    }

    #[tokio::test]
    async fn test_dataset_round_trip_resolution() {
        let planner = planner_with(
            r#"{"tasks": [
                {"objective": "analyze cohort", "type": "ANALYSIS", "datasets": ["file_cohort", "art_summary", "ghost_id"]}
            ]}"#,
        );
        let state = state_with_history();
        let proposal = planner.plan(&state, "continue").await.unwrap();

        assert_eq!(proposal.mode, PlanMode::Continuation);
        let task = &proposal.tasks[0];
        assert_eq!(task.id, "ana-1");
        assert_eq!(task.level, 2);
        // Upload id and artifact id both resolve; the unknown id is dropped.
        assert_eq!(
            task.datasets,
            vec![
                DatasetRef {
                    id: "file_cohort".to_string(),
                    path: "/uploads/conv_1/cohort.csv".to_string(),
                },
                DatasetRef {
                    id: "art_summary".to_string(),
                    path: "/artifacts/conv_1/summary.parquet".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_task_ids_continue_counters() {
        let planner = planner_with(
            r#"{"tasks": [{"objective": "deeper survey", "type": "LITERATURE"}]}"#,
        );
        let state = state_with_history();
        let proposal = planner.plan(&state, "go on").await.unwrap();
        assert_eq!(proposal.tasks[0].id, "lit-2");
    }

    #[tokio::test]
    async fn test_empty_with_marker_is_objective_achieved() {
        let planner = planner_with(
            r#"{"current_objective": "OBJECTIVE_ACHIEVED: cohort characterized", "tasks": []}"#,
        );
        let state = state_with_history();
        let proposal = planner.plan(&state, "continue").await.unwrap();
        assert!(proposal.is_objective_achieved());
        assert!(proposal.current_objective.contains(OBJECTIVE_ACHIEVED_MARKER));
    }

    #[tokio::test]
    async fn test_empty_without_marker_degrades_to_default_task() {
        let planner = planner_with(r#"{"current_objective": "keep going", "tasks": []}"#);
        let state = state_with_history();
        let proposal = planner
            .plan(&state, "look at mitochondrial markers")
            .await
            .unwrap();
        assert_eq!(proposal.tasks.len(), 1);
        assert_eq!(proposal.tasks[0].objective, "look at mitochondrial markers");
        assert_eq!(proposal.tasks[0].kind, TaskKind::Literature);
    }

    #[tokio::test]
    async fn test_garbage_output_degrades_to_default_task() {
        let planner = planner_with("I am not able to produce a plan right now.");
        let state = ConversationState::new("conv_1", "objective");
        let proposal = planner.plan(&state, "map the field").await.unwrap();
        assert_eq!(proposal.tasks.len(), 1);
        assert_eq!(proposal.tasks[0].objective, "map the field");
    }

    #[tokio::test]
    async fn test_affirmation_promotes_prior_suggestions() {
        let planner = planner_with("(malformed)");
        let mut state = state_with_history();
        state.suggested_next_steps.push(PlanTask {
            id: "ana-1".to_string(),
            objective: "run the regression".to_string(),
            kind: TaskKind::Analysis,
            datasets: vec![],
            level: 2,
            started_at: None,
            ended_at: None,
            output: String::new(),
            artifacts: vec![],
        });

        let proposal = planner.plan(&state, "yes").await.unwrap();
        assert_eq!(proposal.tasks.len(), 1);
        assert_eq!(proposal.tasks[0].objective, "run the regression");
        assert_eq!(proposal.tasks[0].level, 2);
    }

    #[tokio::test]
    async fn test_fenced_output_is_recovered() {
        let planner = planner_with(
            "Sure, here's the plan:\n```json\n{\"tasks\": [{\"objective\": \"survey\", \"type\": \"LITERATURE\"}]}\n```",
        );
        let state = ConversationState::new("conv_1", "objective");
        let proposal = planner.plan(&state, "start").await.unwrap();
        assert_eq!(proposal.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_task_cap_enforced() {
        let planner = planner_with(
            r#"{"tasks": [
                {"objective": "a"}, {"objective": "b"}, {"objective": "c"}, {"objective": "d"}
            ]}"#,
        );
        let state = ConversationState::new("conv_1", "objective");
        let proposal = planner.plan(&state, "start").await.unwrap();
        assert_eq!(proposal.tasks.len(), MAX_TASKS_PER_LEVEL);
    }

    #[tokio::test]
    async fn test_transport_failure_is_loud() {
        struct FailingGateway;
        #[async_trait]
        impl InferenceGateway for FailingGateway {
            async fn infer(&self, _role: &str, _prompt: &str) -> Result<String, InferenceError> {
                Err(InferenceError::Transport("connection refused".to_string()))
            }
        }
        let planner = Planner::new(Arc::new(FailingGateway));
        let state = ConversationState::new("conv_1", "objective");
        assert!(planner.plan(&state, "start").await.is_err());
    }
}
