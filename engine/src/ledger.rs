//! Run ledger - lease-based ownership of a conversation's research loop.
//!
//! The ledger is the `deep_research_run` subfield of [`ConversationState`],
//! persisted through the state store. Ownership is optimistic, not a held
//! lock: every mutating call re-reads the entry and verifies the caller's
//! identity (`root_message_id` + `state_id`) before writing, so a stale or
//! superseded caller degrades to a no-op instead of clobbering a newer
//! run's entry.
//!
//! Staleness is the only reclamation mechanism. A run whose lease expired
//! or whose heartbeat went quiet is reclaimable by any future caller; its
//! original executor, if somehow still alive, is fenced out by the
//! identity checks rather than killed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use shared_types::{
    ActiveRunInfo, ConversationState, ResearchRun, RunMode, RunOutcome, RunOwner,
    RunStatusResponse,
};

use crate::store::{StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
}

/// Is this ledger entry an active claim at `now`?
///
/// Active requires all three: flagged running, lease unexpired, heartbeat
/// fresh. A missing heartbeat or expiry fails its check, so an entry
/// flagged running with neither is stale by definition - the fail-open
/// choice that prefers admitting a new run to deadlocking forever.
pub fn run_is_active(run: &ResearchRun, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
    if !run.is_running {
        return false;
    }
    let lease_live = run.expires_at.map(|e| now < e).unwrap_or(false);
    let heartbeat_fresh = run
        .last_heartbeat_at
        .map(|h| now - h < staleness)
        .unwrap_or(false);
    lease_live && heartbeat_fresh
}

/// Lease-based run ledger over the state store.
#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn StateStore>,
    lease: chrono::Duration,
    heartbeat_staleness: chrono::Duration,
}

impl RunLedger {
    pub fn new(
        store: Arc<dyn StateStore>,
        lease: Duration,
        heartbeat_staleness: Duration,
    ) -> Result<Self, LedgerError> {
        Ok(Self {
            store,
            lease: chrono::Duration::from_std(lease)
                .map_err(|e| LedgerError::InvalidDuration(e.to_string()))?,
            heartbeat_staleness: chrono::Duration::from_std(heartbeat_staleness)
                .map_err(|e| LedgerError::InvalidDuration(e.to_string()))?,
        })
    }

    /// The currently active run for a conversation, if any.
    pub async fn active_run(
        &self,
        conversation_state_id: &str,
    ) -> Result<Option<ActiveRunInfo>, LedgerError> {
        let state = self.store.get(conversation_state_id).await?;
        Ok(state
            .deep_research_run
            .as_ref()
            .filter(|run| run_is_active(run, Utc::now(), self.heartbeat_staleness))
            .map(|run| ActiveRunInfo {
                root_message_id: run.root_message_id.clone(),
                state_id: run.state_id.clone(),
                mode: run.mode,
                job_id: run.job_id.clone(),
                started_at: run.started_at,
                last_heartbeat_at: run.last_heartbeat_at,
            }))
    }

    /// Write a fresh ledger entry claiming the run for `owner`.
    ///
    /// Callers are expected to have checked [`RunLedger::active_run`] first
    /// (under the start lock where available); this overwrites whatever
    /// entry exists, including a stale one being reclaimed.
    pub async fn mark_run_started(
        &self,
        conversation_state_id: &str,
        owner: &RunOwner,
        mode: RunMode,
        job_id: Option<String>,
    ) -> Result<ResearchRun, LedgerError> {
        let mut state = self.store.get(conversation_state_id).await?;
        let now = Utc::now();
        let run = ResearchRun {
            is_running: true,
            root_message_id: owner.root_message_id.clone(),
            state_id: owner.state_id.clone(),
            mode,
            job_id,
            started_at: now,
            last_heartbeat_at: Some(now),
            expires_at: Some(now + self.lease),
            last_result: None,
            last_error: None,
            ended_at: None,
        };
        state.deep_research_run = Some(run.clone());
        state.updated_at = now;
        self.store.put(&state).await?;

        tracing::info!(
            conversation_state_id = %conversation_state_id,
            root_message_id = %owner.root_message_id,
            "Research run started"
        );
        Ok(run)
    }

    /// Extend the lease and refresh the heartbeat. No-op (returns false)
    /// unless a run is flagged running and owned by the caller.
    pub async fn touch_run(
        &self,
        conversation_state_id: &str,
        owner: &RunOwner,
    ) -> Result<bool, LedgerError> {
        self.mutate_owned(conversation_state_id, owner, |run, now| {
            run.last_heartbeat_at = Some(now);
            run.expires_at = Some(now + self.lease);
        })
        .await
    }

    /// Record the executing job id, extending the lease. Identity-checked
    /// like [`RunLedger::touch_run`].
    pub async fn update_run_job_id(
        &self,
        conversation_state_id: &str,
        owner: &RunOwner,
        job_id: String,
    ) -> Result<bool, LedgerError> {
        self.mutate_owned(conversation_state_id, owner, |run, now| {
            run.job_id = Some(job_id);
            run.last_heartbeat_at = Some(now);
            run.expires_at = Some(now + self.lease);
        })
        .await
    }

    /// Close the run with a terminal result. No-op (returns false) when the
    /// caller no longer owns the ledger entry - a resurrected stale writer
    /// cannot clobber an entry already claimed by a newer run.
    pub async fn mark_run_finished(
        &self,
        conversation_state_id: &str,
        owner: &RunOwner,
        outcome: RunOutcome,
        error: Option<String>,
    ) -> Result<bool, LedgerError> {
        let finished = self
            .mutate_owned(conversation_state_id, owner, |run, now| {
                run.is_running = false;
                run.last_result = Some(outcome);
                run.last_error = error;
                run.ended_at = Some(now);
            })
            .await?;
        if finished {
            tracing::info!(
                conversation_state_id = %conversation_state_id,
                outcome = ?outcome,
                "Research run finished"
            );
        }
        Ok(finished)
    }

    /// Ledger status for the exposed `statusOf` surface.
    pub async fn status_of(
        &self,
        conversation_state_id: &str,
    ) -> Result<RunStatusResponse, LedgerError> {
        let state = self.store.get(conversation_state_id).await?;
        let owner = self.active_run(conversation_state_id).await?;
        let (last_result, last_error) = state
            .deep_research_run
            .as_ref()
            .map(|run| (run.last_result, run.last_error.clone()))
            .unwrap_or((None, None));
        Ok(RunStatusResponse {
            conversation_state_id: conversation_state_id.to_string(),
            active: owner.is_some(),
            owner,
            last_result,
            last_error,
        })
    }

    /// Read-check-write helper: apply `mutate` to the ledger entry only if
    /// a run is flagged running and owned by `owner`.
    async fn mutate_owned<F>(
        &self,
        conversation_state_id: &str,
        owner: &RunOwner,
        mutate: F,
    ) -> Result<bool, LedgerError>
    where
        F: FnOnce(&mut ResearchRun, DateTime<Utc>),
    {
        let mut state: ConversationState = self.store.get(conversation_state_id).await?;
        let now = Utc::now();

        let Some(run) = state.deep_research_run.as_mut() else {
            return Ok(false);
        };
        if !run.is_running || !run.is_owned_by(owner) {
            tracing::debug!(
                conversation_state_id = %conversation_state_id,
                caller_root = %owner.root_message_id,
                ledger_root = %run.root_message_id,
                is_running = run.is_running,
                "Ignoring ledger mutation from non-owner"
            );
            return Ok(false);
        }

        mutate(run, now);
        state.updated_at = now;
        self.store.put(&state).await?;
        Ok(true)
    }
}
