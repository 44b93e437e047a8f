//! Shared application state for the Fitview server.
//!
//! [`ServerState`] is created once by [`ServerState::bootstrap`] and shared
//! with every handler through an [`Arc`]. It owns the topic store, the
//! session registry, the loaded problem and the fitting state, plus the
//! sending half of the event bridge that fit workers report through.
//!
//! Lock order is `fitting` before `problem`. Code that needs both takes
//! `fitting` first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fitview_core::bridge::{EventSender, event_channel, run_dispatcher};
use fitview_core::config::FitviewConfig;
use fitview_core::fit_thread::{Cadence, JobHandle};
use fitview_core::fitters::FitterRegistry;
use fitview_core::model::Problem;
use fitview_types::{ConvergenceRow, FitOutcome, JobId, Topic, UncertaintySummary};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::fit_events::FitEventHandler;
use crate::sessions::SessionRegistry;
use crate::topics::TopicStore;

/// The problem currently loaded, with the location it came from.
#[derive(Debug)]
pub struct LoadedProblem {
    /// The problem itself. Never touched by a fit worker.
    pub problem: Problem,
    /// Directory components of the source file.
    pub pathlist: Vec<String>,
    /// File name of the source file.
    pub filename: String,
}

/// Result of the most recent finished fit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitSummary {
    /// Job that produced the result.
    pub job_id: JobId,
    /// Fitter that ran.
    pub fitter_id: String,
    /// How the job ended.
    pub outcome: FitOutcome,
    /// Normalized chi-squared of the final point.
    pub chisq: String,
    /// Iterations completed.
    pub steps: u64,
    /// When the job started.
    pub started_at: DateTime<Utc>,
    /// When the terminal event was handled.
    pub finished_at: DateTime<Utc>,
}

/// Everything that changes while fits run.
#[derive(Debug, Default)]
pub struct FittingState {
    /// The running job, if any. Cleared once its terminal event has been
    /// handled.
    pub active: Option<JobHandle>,
    /// Latest convergence history of the current or last job.
    pub convergence: Option<Vec<ConvergenceRow>>,
    /// Latest uncertainty summary of the current or last job.
    pub uncertainty: Option<UncertaintySummary>,
    /// Summary of the last finished job.
    pub last_result: Option<FitSummary>,
}

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    /// Loaded configuration.
    pub config: FitviewConfig,
    /// Retained topic logs and the client broadcast channel.
    pub topics: TopicStore,
    /// Connected `WebSocket` clients.
    pub sessions: SessionRegistry,
    /// Available fitters.
    pub fitters: FitterRegistry,
    /// The loaded problem, if any.
    pub problem: RwLock<Option<LoadedProblem>>,
    /// Active job and results.
    pub fitting: Mutex<FittingState>,
    events: EventSender,
}

impl ServerState {
    /// Build the state and spawn the fit event dispatcher on the current
    /// Tokio runtime.
    ///
    /// The dispatcher holds only a weak reference to the state; it exits
    /// once the state and every running worker are gone.
    pub fn bootstrap(config: FitviewConfig, fitters: FitterRegistry) -> Arc<Self> {
        let (events, receiver) = event_channel();
        let state = Arc::new(Self {
            topics: TopicStore::new(&config.topics),
            sessions: SessionRegistry::new(),
            fitters,
            problem: RwLock::new(None),
            fitting: Mutex::new(FittingState::default()),
            events,
            config,
        });
        tokio::spawn(run_dispatcher(
            receiver,
            FitEventHandler::new(Arc::downgrade(&state)),
        ));
        info!(
            fitters = ?state.fitters.defaults().keys().collect::<Vec<_>>(),
            retention = state.config.topics.retention,
            "Server state initialized"
        );
        state
    }

    /// Sending half of the event bridge, handed to new fit workers.
    pub const fn events(&self) -> &EventSender {
        &self.events
    }

    /// Worker reporting cadences from the configuration.
    pub fn cadence(&self) -> Cadence {
        Cadence::from(&self.config.fit)
    }

    /// Replace the loaded problem without publishing anything.
    pub async fn install_problem(&self, problem: Problem, pathlist: Vec<String>, filename: String) {
        *self.problem.write().await = Some(LoadedProblem {
            problem,
            pathlist,
            filename,
        });
    }

    /// Publish a human-readable line on the `log` topic.
    pub async fn log(&self, message: impl Into<String>, title: Option<&str>) {
        self.topics
            .publish(
                Topic::Log,
                serde_json::json!({ "message": message.into(), "title": title }),
            )
            .await;
    }
}
