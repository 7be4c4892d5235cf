//! Shared types between the research engine and its callers
//!
//! These types are used by:
//! - The orchestration engine (planner, ledger, managers)
//! - The HTTP surface (queue workers, API layers)
//!
//! Serializable with serde for JSON over HTTP and for the state store's
//! document column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Research modes
// ============================================================================

/// Operating mode of the research loop for one conversation.
///
/// The mode is chosen by the user and controls how aggressively the loop
/// continues without human input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ResearchMode {
    /// Default: continue autonomously, but pause for the user whenever the
    /// evidence suggests a judgment call a human should make.
    #[default]
    #[serde(rename = "semi-autonomous")]
    SemiAutonomous,
    /// Continue until the planner has nothing left to propose.
    #[serde(rename = "fully-autonomous")]
    FullyAutonomous,
    /// One level at a time; always hand control back to the user.
    #[serde(rename = "steering")]
    Steering,
}

/// How the run is being driven: by a queue worker or in-process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunMode {
    #[serde(rename = "queue")]
    Queue,
    #[serde(rename = "in-process")]
    InProcess,
}

// ============================================================================
// Plan tasks
// ============================================================================

/// Kind of investigative work a task performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    /// Literature survey / source gathering through a research agent.
    Literature,
    /// Computational analysis over datasets or prior artifacts.
    Analysis,
}

impl TaskKind {
    /// Stable id prefix for tasks of this kind (`lit-N` / `ana-N`).
    pub fn id_prefix(self) -> &'static str {
        match self {
            TaskKind::Literature => "lit",
            TaskKind::Analysis => "ana",
        }
    }
}

/// A dataset reference carried by a task, resolved to a concrete storage
/// path before dispatch. The id is either an uploaded file id or a prior
/// task's artifact id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetRef {
    pub id: String,
    pub path: String,
}

/// Kind of output artifact produced by an analysis task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Dataset,
    Table,
    Figure,
    Report,
}

/// A named, typed output produced by a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskArtifact {
    pub id: String,
    pub name: String,
    pub kind: ArtifactKind,
    /// Concrete storage path where the artifact was written.
    pub path: String,
}

/// One unit of investigative work.
///
/// Created by the planner as a proposal (`suggested_next_steps`), promoted
/// into `plan` when the orchestrator commits to executing it, then mutated
/// in place by the executor. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTask {
    /// Stable id, prefixed by kind: `lit-N` / `ana-N`.
    pub id: String,
    /// Natural-language instruction for the specialist agent.
    pub objective: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub datasets: Vec<DatasetRef>,
    /// Execution level; tasks in one level run in parallel.
    pub level: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Free-text result, empty until the task completes. A failed task
    /// carries its error message here.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<TaskArtifact>,
}

impl PlanTask {
    /// A task with recorded end and non-empty output contributes evidence.
    pub fn has_usable_output(&self) -> bool {
        self.ended_at.is_some() && !self.output.trim().is_empty()
    }
}

// ============================================================================
// Discoveries
// ============================================================================

/// A structured scientific claim extracted from analysis output.
///
/// Every discovery must cite at least one ANALYSIS task in `evidence`;
/// literature tasks may only supplement an existing analysis-backed claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Discovery {
    pub title: String,
    pub claim: String,
    pub summary: String,
    /// Task ids (`lit-N` / `ana-N`) backing the claim.
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Artifact ids supporting the claim.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Free-text novelty assessment.
    #[serde(default)]
    pub novelty: String,
}

// ============================================================================
// Run ledger
// ============================================================================

/// Terminal result of a research run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The objective was achieved; nothing left to plan.
    Completed,
    /// The loop paused to ask the user for direction.
    AwaitingUser,
    Failed,
}

/// Identity of the caller that owns a run ledger entry.
///
/// Every mutating ledger call revalidates this pair against the stored
/// entry; a mismatch makes the call a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunOwner {
    pub root_message_id: String,
    pub state_id: String,
}

/// Concurrency-control record for one conversation's research loop.
///
/// Written by the ledger only. A run is *active* iff `is_running`, the
/// lease (`expires_at`) is unexpired, and the heartbeat is fresh; an entry
/// flagged running with neither heartbeat nor expiry is stale by definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchRun {
    pub is_running: bool,
    pub root_message_id: String,
    pub state_id: String,
    pub mode: RunMode,
    #[serde(default)]
    pub job_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<RunOutcome>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ResearchRun {
    pub fn owner(&self) -> RunOwner {
        RunOwner {
            root_message_id: self.root_message_id.clone(),
            state_id: self.state_id.clone(),
        }
    }

    pub fn is_owned_by(&self, owner: &RunOwner) -> bool {
        self.root_message_id == owner.root_message_id && self.state_id == owner.state_id
    }
}

/// Ownership info reported to callers that find a run already active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveRunInfo {
    pub root_message_id: String,
    pub state_id: String,
    pub mode: RunMode,
    pub job_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Conversation state
// ============================================================================

/// An uploaded file available as a task dataset.
///
/// `text` holds parsed content for the in-memory working copy only; the
/// state store strips it before persisting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    /// Concrete storage path.
    pub path: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// The unit of durable research memory, one per conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub id: String,
    /// Original user goal, immutable once set.
    pub objective: String,
    /// Working objective, updated each iteration.
    pub current_objective: String,
    /// Highest task level executed so far. Never decreases.
    pub current_level: u32,
    /// Bounded, most-valuable-first.
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub methodology: String,
    /// At most one hypothesis exists at a time; revised in place.
    #[serde(default)]
    pub current_hypothesis: Option<String>,
    #[serde(default)]
    pub discoveries: Vec<Discovery>,
    /// Append-only history of all tasks ever executed.
    #[serde(default)]
    pub plan: Vec<PlanTask>,
    /// The planner's proposal for the next level; distinct from `plan`
    /// until the orchestrator accepts it.
    #[serde(default)]
    pub suggested_next_steps: Vec<PlanTask>,
    #[serde(default)]
    pub research_mode: ResearchMode,
    #[serde(default)]
    pub deep_research_run: Option<ResearchRun>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploaded_files: Vec<UploadedFile>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(id: impl Into<String>, objective: impl Into<String>) -> Self {
        let now = Utc::now();
        let objective = objective.into();
        Self {
            id: id.into(),
            current_objective: objective.clone(),
            objective,
            current_level: 0,
            key_insights: Vec::new(),
            methodology: String::new(),
            current_hypothesis: None,
            discoveries: Vec::new(),
            plan: Vec::new(),
            suggested_next_steps: Vec::new(),
            research_mode: ResearchMode::default(),
            deep_research_run: None,
            title: None,
            uploaded_files: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Ids of all executed ANALYSIS tasks (evidence-invariant checks).
    pub fn analysis_task_ids(&self) -> Vec<&str> {
        self.plan
            .iter()
            .filter(|t| t.kind == TaskKind::Analysis)
            .map(|t| t.id.as_str())
            .collect()
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Request to create a conversation ahead of its first research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    /// Generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub objective: String,
    #[serde(default)]
    pub research_mode: Option<ResearchMode>,
    #[serde(default)]
    pub uploaded_files: Vec<UploadedFile>,
}

/// Request to start a research run for a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunRequest {
    pub conversation_state_id: String,
    pub root_message_id: String,
    pub state_id: String,
    pub mode: RunMode,
    #[serde(default)]
    pub job_id: Option<String>,
    /// The user's latest message; authoritative for the planner.
    pub latest_user_input: String,
}

/// Outcome of a start attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartRunResponse {
    Started {
        conversation_state_id: String,
        started_at: DateTime<Utc>,
    },
    AlreadyRunning {
        conversation_state_id: String,
        existing: ActiveRunInfo,
    },
}

/// Ledger status for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusResponse {
    pub conversation_state_id: String,
    pub active: bool,
    pub owner: Option<ActiveRunInfo>,
    pub last_result: Option<RunOutcome>,
    pub last_error: Option<String>,
}

/// Generic API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
