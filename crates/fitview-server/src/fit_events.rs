//! Event-loop side of the fit event bridge.
//!
//! [`FitEventHandler`] is driven by the bridge dispatcher and turns each
//! worker event into state changes and topic publications. Events are
//! handled one at a time in emission order. Events from a job that is not
//! the active one (a stale job after a restart) are dropped.

use std::sync::Weak;

use chrono::Utc;
use fitview_core::bridge::{EventHandler, JobEvent};
use fitview_core::fit_thread::JoinOutcome;
use fitview_core::format;
use fitview_types::{
    ConvergenceRow, FitCompletion, FitEvent, FitOutcome, JobId, ProgressUpdate, Topic,
    UncertaintySummary,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::state::{FitSummary, ServerState};
use crate::topics::PushEvent;

/// Applies fit events to a [`ServerState`].
#[derive(Debug, Clone)]
pub struct FitEventHandler {
    state: Weak<ServerState>,
}

impl FitEventHandler {
    /// A handler for `state`. Events arriving after the state is dropped
    /// are ignored.
    pub const fn new(state: Weak<ServerState>) -> Self {
        Self { state }
    }
}

impl EventHandler for FitEventHandler {
    async fn handle(&mut self, event: JobEvent) {
        let Some(state) = self.state.upgrade() else {
            debug!(job_id = %event.job_id, "Server state gone, ignoring fit event");
            return;
        };
        if !is_active(&state, event.job_id).await {
            debug!(
                job_id = %event.job_id,
                kind = event.event.kind(),
                "Dropping event from inactive job"
            );
            return;
        }

        match event.event {
            FitEvent::Progress(progress) => on_progress(&state, &progress).await,
            FitEvent::Improvement { point, .. } => on_improvement(&state, &point).await,
            FitEvent::ConvergenceUpdate { rows } => on_convergence(&state, rows).await,
            FitEvent::UncertaintyUpdate { summary } | FitEvent::UncertaintyFinal { summary } => {
                on_uncertainty(&state, summary).await;
            }
            FitEvent::Complete(completion) => {
                on_complete(&state, event.job_id, completion).await;
            }
        }
    }
}

async fn is_active(state: &ServerState, job_id: JobId) -> bool {
    state
        .fitting
        .lock()
        .await
        .active
        .as_ref()
        .is_some_and(|job| job.job_id == job_id)
}

async fn on_progress(state: &ServerState, progress: &ProgressUpdate) {
    match serde_json::to_value(progress) {
        Ok(payload) => {
            state.topics.emit(PushEvent::FitProgress, payload).await;
        }
        Err(e) => warn!(error = %e, step = progress.step, "Cannot encode fit progress"),
    }
}

/// Write `point` into the event loop's problem and refresh it. Returns
/// `false` when there is no problem or the point does not fit it.
async fn apply_point(state: &ServerState, point: &[f64]) -> bool {
    let mut problem = state.problem.write().await;
    let Some(loaded) = problem.as_mut() else {
        warn!("Fit reported a point but no problem is loaded");
        return false;
    };
    if let Err(e) = loaded.problem.apply(point) {
        warn!(error = %e, "Cannot apply fit point");
        return false;
    }
    loaded.problem.refresh();
    true
}

async fn on_improvement(state: &ServerState, point: &[f64]) {
    if apply_point(state, point).await {
        state
            .topics
            .publish(Topic::UpdateParameters, Value::Bool(true))
            .await;
    }
}

async fn on_convergence(state: &ServerState, rows: Vec<ConvergenceRow>) {
    state
        .fitting
        .lock()
        .await
        .convergence
        .get_or_insert_with(Vec::new)
        .extend(rows);
    state
        .topics
        .publish(Topic::ConvergenceUpdate, Value::Bool(true))
        .await;
}

async fn on_uncertainty(state: &ServerState, summary: UncertaintySummary) {
    state.fitting.lock().await.uncertainty = Some(summary);
    state
        .topics
        .publish(Topic::UncertaintyUpdate, Value::Bool(true))
        .await;
}

/// Applies the final point while the job still holds the slot, then frees
/// the slot and records the result under one short `fitting` lock. The
/// worker is joined after the lock is released.
async fn on_complete(state: &ServerState, job_id: JobId, completion: FitCompletion) {
    let failed = matches!(completion.outcome, FitOutcome::Failed { .. });
    let applied = !failed && apply_point(state, &completion.point).await;
    let chisq = format::format_chisq(completion.value, completion.dof);

    let job = {
        let mut fitting = state.fitting.lock().await;
        let Some(job) = fitting.active.take_if(|job| job.job_id == job_id) else {
            return;
        };
        fitting.last_result = Some(FitSummary {
            job_id,
            fitter_id: job.active.fitter_id.clone(),
            outcome: completion.outcome.clone(),
            chisq: chisq.clone(),
            steps: completion.steps,
            started_at: job.started_at,
            finished_at: Utc::now(),
        });
        state.topics.publish(Topic::FitActive, json!({})).await;
        job
    };
    let fitter_id = job.active.fitter_id.clone();

    info!(
        %job_id,
        %fitter_id,
        outcome = ?completion.outcome,
        steps = completion.steps,
        %chisq,
        "Fit finished"
    );
    if applied {
        state
            .topics
            .publish(Topic::UpdateParameters, Value::Bool(true))
            .await;
    }

    let joined = job.join(state.config.fit.join_timeout()).await;
    if joined != JoinOutcome::Joined {
        warn!(%job_id, outcome = ?joined, "Fit thread failed to complete");
        state.log("fit thread failed to complete", None).await;
    }

    match &completion.outcome {
        FitOutcome::Failed { reason } => {
            state.log(reason.as_str(), Some(&format!("fit failed: {fitter_id}"))).await;
        }
        FitOutcome::Completed | FitOutcome::Aborted => {
            state
                .log(completion.info, Some(&format!("done with chisq {chisq}")))
                .await;
        }
    }
}
