//! Orchestrator - owns the research run lifecycle and the iteration loop.
//!
//! Run admission: acquire the start lock (or degrade to ledger-only dedup),
//! check the ledger for a live run, claim a fresh lease, release the lock.
//! The lock serializes only the start decision; lease renewal by heartbeat
//! covers the run itself, which spans long failure-prone collaborator
//! calls no held lock could safely span.
//!
//! Per iteration: plan -> commit the level -> execute -> hypothesis ->
//! discoveries -> reflection -> persist -> heartbeat -> continuation
//! decision. The level counter increments by exactly one per iteration.
//! Every terminal path stamps the ledger through `mark_run_finished`;
//! a lost heartbeat (ownership taken by a newer run) aborts the loop
//! without touching the ledger at all.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use shared_types::{
    ActiveRunInfo, ConversationState, ResearchRun, RunOutcome, RunOwner, RunStatusResponse,
    StartRunRequest,
};

use crate::decider::{ContinuationDecider, Decision};
use crate::discovery::DiscoveryManager;
use crate::executor::{LevelExecutor, SpecialistPort};
use crate::hypothesis::{HypothesisError, HypothesisManager};
use crate::inference::InferenceGateway;
use crate::ledger::{LedgerError, RunLedger};
use crate::lock::{LockAcquisition, LockService, StartLock};
use crate::planner::{PlanError, Planner};
use crate::reflection::ReflectionManager;
use crate::store::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Outcome of a start attempt.
#[derive(Debug)]
pub enum StartOutcome {
    Started { run: ResearchRun },
    /// A run is already active (or concurrently starting). `existing` is
    /// None only in the narrow window where a competing starter holds the
    /// lock but has not yet written its ledger entry.
    AlreadyRunning { existing: Option<ActiveRunInfo> },
}

/// How the iteration loop ended.
enum LoopExit {
    Finished(RunOutcome),
    /// A newer run took ownership; leave the ledger alone.
    Superseded,
}

/// Tunables for the orchestrator, mirroring [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub run_lease: std::time::Duration,
    pub heartbeat_staleness: std::time::Duration,
    pub lock_ttl: std::time::Duration,
    pub lock_attempts: u32,
    pub lock_backoff: std::time::Duration,
    pub task_timeout: std::time::Duration,
    pub max_iterations: u32,
    pub insight_cap: usize,
    pub confidence_floor: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            run_lease: std::time::Duration::from_secs(4 * 3600),
            heartbeat_staleness: std::time::Duration::from_secs(2 * 3600),
            lock_ttl: std::time::Duration::from_secs(30),
            lock_attempts: 3,
            lock_backoff: std::time::Duration::from_millis(250),
            task_timeout: std::time::Duration::from_secs(1800),
            max_iterations: 12,
            insight_cap: 8,
            confidence_floor: 0.5,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    ledger: RunLedger,
    start_lock: StartLock,
    planner: Planner,
    executor: LevelExecutor,
    hypothesis: HypothesisManager,
    discovery: DiscoveryManager,
    reflection: ReflectionManager,
    decider: ContinuationDecider,
    max_iterations: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        lock_service: Option<Arc<dyn LockService>>,
        gateway: Arc<dyn InferenceGateway>,
        specialists: Arc<dyn SpecialistPort>,
        settings: OrchestratorSettings,
    ) -> Result<Self, LedgerError> {
        let ledger = RunLedger::new(
            store.clone(),
            settings.run_lease,
            settings.heartbeat_staleness,
        )?;
        Ok(Self {
            store,
            ledger,
            start_lock: StartLock::new(
                lock_service,
                settings.lock_ttl,
                settings.lock_attempts,
                settings.lock_backoff,
            ),
            planner: Planner::new(gateway.clone()),
            executor: LevelExecutor::new(specialists, settings.task_timeout),
            hypothesis: HypothesisManager::new(gateway.clone()),
            discovery: DiscoveryManager::new(gateway.clone()),
            reflection: ReflectionManager::new(gateway.clone(), settings.insight_cap),
            decider: ContinuationDecider::new(gateway, settings.confidence_floor),
            max_iterations: settings.max_iterations,
        })
    }

    /// Start a research run for a conversation.
    ///
    /// On success the iteration loop is handed to the runtime and this
    /// returns immediately with the fresh ledger entry; progress is
    /// observable through [`Orchestrator::status_of`].
    pub async fn start_run(&self, request: StartRunRequest) -> Result<StartOutcome, EngineError> {
        let conversation_state_id = request.conversation_state_id.clone();

        let lock_handle = match self.start_lock.acquire(&conversation_state_id).await {
            LockAcquisition::Acquired(handle) => Some(handle),
            LockAcquisition::Fallback => None,
            LockAcquisition::Busy => {
                // Another process is deciding right now; report whatever
                // the ledger already shows rather than racing it.
                let existing = self.ledger.active_run(&conversation_state_id).await?;
                return Ok(StartOutcome::AlreadyRunning { existing });
            }
        };

        if let Some(existing) = self.ledger.active_run(&conversation_state_id).await? {
            tracing::info!(
                conversation_state_id = %conversation_state_id,
                owner_root = %existing.root_message_id,
                "Refusing duplicate research run"
            );
            if let Some(handle) = lock_handle {
                self.start_lock.release(handle).await;
            }
            return Ok(StartOutcome::AlreadyRunning {
                existing: Some(existing),
            });
        }

        let owner = RunOwner {
            root_message_id: request.root_message_id.clone(),
            state_id: request.state_id.clone(),
        };
        let run = self
            .ledger
            .mark_run_started(
                &conversation_state_id,
                &owner,
                request.mode,
                request.job_id.clone(),
            )
            .await?;

        if let Some(handle) = lock_handle {
            self.start_lock.release(handle).await;
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.drive(request, owner).await;
        });

        Ok(StartOutcome::Started { run })
    }

    /// Ledger status for the exposed surface.
    pub async fn status_of(
        &self,
        conversation_state_id: &str,
    ) -> Result<RunStatusResponse, EngineError> {
        Ok(self.ledger.status_of(conversation_state_id).await?)
    }

    /// Record the queue job executing an owned run, extending its lease.
    pub async fn attach_job(
        &self,
        conversation_state_id: &str,
        owner: &RunOwner,
        job_id: String,
    ) -> Result<bool, EngineError> {
        Ok(self
            .ledger
            .update_run_job_id(conversation_state_id, owner, job_id)
            .await?)
    }

    /// Drive the loop to termination and stamp the ledger.
    async fn drive(&self, request: StartRunRequest, owner: RunOwner) {
        let conversation_state_id = request.conversation_state_id.clone();

        let (outcome, error) = match self.run_loop(&request, &owner).await {
            Ok(LoopExit::Finished(outcome)) => (outcome, None),
            Ok(LoopExit::Superseded) => {
                tracing::warn!(
                    conversation_state_id = %conversation_state_id,
                    "Run superseded by a newer owner; exiting without touching the ledger"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    conversation_state_id = %conversation_state_id,
                    error = %e,
                    "Research run failed"
                );
                (RunOutcome::Failed, Some(e.to_string()))
            }
        };

        match self
            .ledger
            .mark_run_finished(&conversation_state_id, &owner, outcome, error)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    conversation_state_id = %conversation_state_id,
                    "Run finish was a no-op; a newer run owns the ledger entry"
                );
            }
            Err(e) => {
                tracing::error!(
                    conversation_state_id = %conversation_state_id,
                    error = %e,
                    "Failed to record run finish"
                );
            }
        }
    }

    async fn run_loop(
        &self,
        request: &StartRunRequest,
        owner: &RunOwner,
    ) -> Result<LoopExit, EngineError> {
        let conversation_state_id = &request.conversation_state_id;
        let mut state = self.store.get(conversation_state_id).await?;
        let mut latest_input = request.latest_user_input.clone();

        for iteration in 1..=self.max_iterations {
            tracing::info!(
                conversation_state_id = %conversation_state_id,
                iteration,
                level = state.current_level + 1,
                "Research iteration starting"
            );

            let proposal = self.planner.plan(&state, &latest_input).await?;
            state.current_objective = proposal.current_objective.clone();
            state.suggested_next_steps = proposal.tasks.clone();

            if proposal.is_objective_achieved() {
                let decision = self.decider.decide(&state, &proposal, iteration, &[]).await;
                tracing::info!(
                    conversation_state_id = %conversation_state_id,
                    trigger = ?decision.trigger,
                    "Objective achieved; run complete"
                );
                state.updated_at = Utc::now();
                self.persist_preserving_ledger(&mut state).await?;
                return Ok(LoopExit::Finished(RunOutcome::Completed));
            }

            // Persist the accepted proposal before dispatch so a crashed
            // run leaves its pending suggestions recoverable.
            state.updated_at = Utc::now();
            self.persist_preserving_ledger(&mut state).await?;

            let executed = self.executor.execute_level(proposal.tasks.clone()).await;

            // Promote the executed level into the append-only history.
            state.plan.extend(executed.iter().cloned());
            state.current_level += 1;
            state.suggested_next_steps.clear();

            match self
                .hypothesis
                .create_or_update(
                    state.current_hypothesis.as_deref(),
                    &executed,
                    &state.current_objective,
                )
                .await
            {
                Ok(update) => {
                    tracing::debug!(
                        conversation_state_id = %conversation_state_id,
                        rationale = %update.rationale,
                        "Hypothesis revised"
                    );
                    state.current_hypothesis = Some(update.hypothesis);
                }
                Err(HypothesisError::NoUsableOutput) => {
                    tracing::warn!(
                        conversation_state_id = %conversation_state_id,
                        "No usable output this level; keeping prior hypothesis"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_state_id = %conversation_state_id,
                        error = %e,
                        "Hypothesis step failed; keeping prior hypothesis"
                    );
                }
            }

            let known_analysis_ids: HashSet<String> = state
                .analysis_task_ids()
                .into_iter()
                .map(ToString::to_string)
                .collect();
            match self
                .discovery
                .extract(
                    &state.objective,
                    &state.discoveries,
                    &executed,
                    &known_analysis_ids,
                )
                .await
            {
                Ok(Some(merged)) => state.discoveries = merged,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        conversation_state_id = %conversation_state_id,
                        error = %e,
                        "Discovery step failed; keeping prior discoveries"
                    );
                }
            }

            let reflected = self
                .reflection
                .reflect(&state, &executed, state.current_hypothesis.as_deref())
                .await;
            state.current_objective = reflected.current_objective;
            state.key_insights = reflected.key_insights;
            state.methodology = reflected.methodology;
            state.title = reflected.conversation_title;

            state.updated_at = Utc::now();
            self.persist_preserving_ledger(&mut state).await?;

            if !self.ledger.touch_run(conversation_state_id, owner).await? {
                return Ok(LoopExit::Superseded);
            }

            let decision = self
                .decider
                .decide(&state, &proposal, iteration, &executed)
                .await;
            tracing::info!(
                conversation_state_id = %conversation_state_id,
                iteration,
                decision = ?decision.decision,
                trigger = ?decision.trigger,
                confidence = decision.confidence,
                "Continuation decision"
            );
            if decision.decision == Decision::Ask {
                return Ok(LoopExit::Finished(RunOutcome::AwaitingUser));
            }

            latest_input = "(autonomous continuation - no new user input)".to_string();
        }

        tracing::warn!(
            conversation_state_id = %conversation_state_id,
            max_iterations = self.max_iterations,
            "Iteration budget exhausted; pausing for the user"
        );
        Ok(LoopExit::Finished(RunOutcome::AwaitingUser))
    }

    /// Persist the working copy without clobbering the ledger subfield.
    ///
    /// The ledger writes `deep_research_run` through its own identity
    /// checks; the loop's working copy of that field is stale the moment a
    /// heartbeat lands. Re-reading it just before the write keeps the two
    /// writers from undoing each other (the residual read-write window is
    /// the optimistic race the ownership model accepts - a superseded loop
    /// is caught by its next `touch_run`).
    async fn persist_preserving_ledger(
        &self,
        state: &mut ConversationState,
    ) -> Result<(), StoreError> {
        match self.store.get(&state.id).await {
            Ok(stored) => state.deep_research_run = stored.deep_research_run,
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.put(state).await
    }
}
