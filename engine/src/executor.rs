//! Level executor - fans one level's tasks out to specialist agents.
//!
//! Tasks within a level are mutually independent, so execution is
//! embarrassingly parallel with no completion-order guarantee. A single
//! task's failure (or timeout) is captured as error text in that task's
//! `output` and never aborts its siblings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;

use shared_types::{PlanTask, TaskArtifact};

/// Prefix stamped onto `output` when a task fails or times out. Synthesis
/// steps use it to tell evidence apart from failure notices.
pub const TASK_FAILURE_PREFIX: &str = "Task failed:";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("specialist agent failed: {0}")]
    Specialist(String),
}

/// Result of one specialist task execution.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub output: String,
    pub artifacts: Vec<TaskArtifact>,
}

/// Boundary to the external specialist agents that actually perform
/// literature and analysis work. The engine only depends on this contract.
#[async_trait]
pub trait SpecialistPort: Send + Sync {
    async fn run_task(&self, task: &PlanTask) -> Result<TaskCompletion, ExecutorError>;
}

/// Runs one level of tasks concurrently against a [`SpecialistPort`].
#[derive(Clone)]
pub struct LevelExecutor {
    port: Arc<dyn SpecialistPort>,
    task_timeout: Duration,
}

impl LevelExecutor {
    pub fn new(port: Arc<dyn SpecialistPort>, task_timeout: Duration) -> Self {
        Self { port, task_timeout }
    }

    /// Execute every task in the level. Each returned task has `output`
    /// populated (an error message on failure) and `ended_at` set.
    pub async fn execute_level(&self, tasks: Vec<PlanTask>) -> Vec<PlanTask> {
        let executions = tasks.into_iter().map(|task| self.execute_task(task));
        join_all(executions).await
    }

    async fn execute_task(&self, mut task: PlanTask) -> PlanTask {
        task.started_at = Some(Utc::now());
        tracing::info!(
            task_id = %task.id,
            kind = ?task.kind,
            level = task.level,
            "Dispatching task to specialist agent"
        );

        let result = tokio::time::timeout(self.task_timeout, self.port.run_task(&task)).await;

        match result {
            Ok(Ok(completion)) => {
                task.output = completion.output;
                task.artifacts = completion.artifacts;
            }
            Ok(Err(e)) => {
                tracing::warn!(task_id = %task.id, error = %e, "Task failed");
                task.output = format!("{TASK_FAILURE_PREFIX} {e}");
            }
            Err(_) => {
                tracing::warn!(
                    task_id = %task.id,
                    timeout_secs = self.task_timeout.as_secs(),
                    "Task timed out"
                );
                task.output = format!(
                    "{TASK_FAILURE_PREFIX} timed out after {}s",
                    self.task_timeout.as_secs()
                );
            }
        }

        task.ended_at = Some(Utc::now());
        task
    }
}

/// Default specialist port: delegates task execution to the inference
/// gateway as a plain text turn.
///
/// Production deployments that run real literature/analysis agents (with
/// dataset access and artifact output) plug in their own [`SpecialistPort`];
/// this one keeps the engine end-to-end functional with nothing but a
/// model endpoint configured.
pub struct GatewaySpecialistPort {
    gateway: Arc<dyn crate::inference::InferenceGateway>,
}

impl GatewaySpecialistPort {
    pub fn new(gateway: Arc<dyn crate::inference::InferenceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SpecialistPort for GatewaySpecialistPort {
    async fn run_task(&self, task: &PlanTask) -> Result<TaskCompletion, ExecutorError> {
        let datasets = if task.datasets.is_empty() {
            "(none)".to_string()
        } else {
            task.datasets
                .iter()
                .map(|d| format!("- {}: {}", d.id, d.path))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prompt = format!(
            "Execute this {kind:?} research task and report findings as \
             plain text.\nTask: {objective}\nDatasets:\n{datasets}",
            kind = task.kind,
            objective = task.objective,
        );
        let output = self
            .gateway
            .infer("specialist", &prompt)
            .await
            .map_err(|e| ExecutorError::Specialist(e.to_string()))?;
        Ok(TaskCompletion {
            output,
            artifacts: Vec::new(),
        })
    }
}
