//! Shared stubs for engine integration tests: a role-scripted inference
//! gateway and a deterministic specialist port.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use engine::executor::{ExecutorError, SpecialistPort, TaskCompletion};
use engine::inference::{InferenceError, InferenceGateway};
use engine::lock::InMemoryLockService;
use engine::orchestrator::{Orchestrator, OrchestratorSettings};
use engine::store::{InMemoryStateStore, StateStore};
use shared_types::{ArtifactKind, ConversationState, PlanTask, TaskArtifact, TaskKind};

/// One scripted gateway response.
#[derive(Clone)]
pub enum Scripted {
    Ok(&'static str),
    TransportError,
}

/// Gateway that replays per-role response queues; an exhausted queue
/// returns `{}` so decode-chain fallbacks kick in deterministically.
pub struct StubGateway {
    queues: Mutex<HashMap<&'static str, VecDeque<Scripted>>>,
}

impl StubGateway {
    pub fn new(scripts: &[(&'static str, &[Scripted])]) -> Arc<Self> {
        let mut queues = HashMap::new();
        for (role, responses) in scripts {
            queues.insert(*role, responses.iter().cloned().collect::<VecDeque<_>>());
        }
        Arc::new(Self {
            queues: Mutex::new(queues),
        })
    }
}

#[async_trait]
impl InferenceGateway for StubGateway {
    async fn infer(&self, role: &str, _prompt: &str) -> Result<String, InferenceError> {
        let scripted = self
            .queues
            .lock()
            .await
            .get_mut(role)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(Scripted::Ok(response)) => Ok(response.to_string()),
            Some(Scripted::TransportError) => {
                Err(InferenceError::Transport("scripted outage".to_string()))
            }
            None => Ok("{}".to_string()),
        }
    }
}

/// Deterministic specialist: every task succeeds after `delay`; analysis
/// tasks produce one artifact.
pub struct StubSpecialists {
    pub delay: Duration,
}

#[async_trait]
impl SpecialistPort for StubSpecialists {
    async fn run_task(&self, task: &PlanTask) -> Result<TaskCompletion, ExecutorError> {
        tokio::time::sleep(self.delay).await;
        let artifacts = if task.kind == TaskKind::Analysis {
            vec![TaskArtifact {
                id: format!("art-{}", task.id),
                name: format!("output of {}", task.id),
                kind: ArtifactKind::Table,
                path: format!("/artifacts/{}.parquet", task.id),
            }]
        } else {
            Vec::new()
        };
        Ok(TaskCompletion {
            output: format!("findings from {}", task.id),
            artifacts,
        })
    }
}

/// Orchestrator over in-memory store/lock with test-friendly timings.
pub fn build_orchestrator(
    store: Arc<InMemoryStateStore>,
    gateway: Arc<StubGateway>,
    specialist_delay: Duration,
) -> Orchestrator {
    Orchestrator::new(
        store,
        Some(Arc::new(InMemoryLockService::new())),
        gateway,
        Arc::new(StubSpecialists {
            delay: specialist_delay,
        }),
        OrchestratorSettings {
            run_lease: Duration::from_secs(3600),
            heartbeat_staleness: Duration::from_secs(1800),
            lock_ttl: Duration::from_secs(5),
            lock_attempts: 2,
            lock_backoff: Duration::from_millis(10),
            task_timeout: Duration::from_secs(5),
            max_iterations: 5,
            insight_cap: 8,
            confidence_floor: 0.5,
        },
    )
    .expect("orchestrator construction")
}

pub async fn seed_conversation(store: &InMemoryStateStore, state: &ConversationState) {
    store.put(state).await.expect("seed conversation");
}

/// Poll until the ledger reports the run finished.
pub async fn wait_until_finished(
    orchestrator: &Orchestrator,
    conversation_state_id: &str,
) -> shared_types::RunStatusResponse {
    for _ in 0..400 {
        let status = orchestrator
            .status_of(conversation_state_id)
            .await
            .expect("status_of");
        if !status.active && status.last_result.is_some() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run for {conversation_state_id} did not finish in time");
}
