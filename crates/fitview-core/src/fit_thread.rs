//! Worker thread runner for fit jobs.
//!
//! [`start_fit`] validates a request, spawns one OS thread that owns a
//! private copy of the problem, and returns a [`JobHandle`]. The thread
//! drives the fitter one iteration at a time, polls its [`AbortToken`]
//! before every iteration, and reports through the event bridge:
//!
//! - `progress` at most once per progress interval,
//! - `improvement` when the best point improved, rate limited by the
//!   progress interval,
//! - `convergence_update` (rows added since the previous one) and
//!   `uncertainty_update` at their own, coarser intervals,
//! - a final `convergence_update` and `uncertainty_final`,
//! - exactly one terminal `complete`.
//!
//! A fitter that panics ends the job with a `failed` completion; the
//! panic does not escape the worker thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fitview_types::{
    ActiveFit, ConvergenceRow, FitCompletion, FitEvent, FitOutcome, FitterOptions, JobId,
    ProgressUpdate,
};
use tracing::{debug, info, warn};

use crate::abort::{AbortHandle, AbortToken, abort_pair};
use crate::bridge::{EventSender, JobEmitter};
use crate::config::FitConfig;
use crate::fitters::{self, Fitter, FitterRegistry};
use crate::format;
use crate::model::Problem;

/// Reasons a fit cannot be started.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// No fitter is registered under the requested id.
    #[error("unknown fitter: {0}")]
    UnknownFitter(String),

    /// The problem has no parameter that is fittable and not fixed.
    #[error("problem has no fittable parameters")]
    NoFittableParameters,

    /// The operating system refused to create the worker thread.
    #[error("failed to spawn fit thread: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// Reporting cadences for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Minimum time between `progress` (and `improvement`) events.
    pub progress: Duration,
    /// Minimum time between intermediate `convergence_update` events.
    pub convergence: Duration,
    /// Minimum time between intermediate `uncertainty_update` events.
    pub uncertainty: Duration,
}

impl From<&FitConfig> for Cadence {
    fn from(config: &FitConfig) -> Self {
        Self {
            progress: config.progress_interval(),
            convergence: config.convergence_interval(),
            uncertainty: config.uncertainty_interval(),
        }
    }
}

/// How joining a finished worker went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The thread exited cleanly.
    Joined,
    /// The thread panicked.
    Panicked,
    /// The thread did not exit within the timeout and was detached.
    TimedOut,
}

/// Handle to a running fit job, held by the event loop.
#[derive(Debug)]
pub struct JobHandle {
    /// Job identity; every event of the job carries it.
    pub job_id: JobId,
    /// Fitter id, resolved options and step budget.
    pub active: ActiveFit,
    /// When the job was started.
    pub started_at: DateTime<Utc>,
    abort: AbortHandle,
    thread: JoinHandle<()>,
}

impl JobHandle {
    /// Request cancellation. Idempotent; returns `true` on the first call.
    pub fn stop(&self) -> bool {
        let raised = self.abort.abort();
        if raised {
            info!(job_id = %self.job_id, "Fit stop requested");
        }
        raised
    }

    /// Whether cancellation has been requested.
    pub fn is_stopping(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait up to `timeout` for the worker thread to exit, without blocking
    /// the event loop. A thread still running at the deadline is detached.
    pub async fn join(self, timeout: Duration) -> JoinOutcome {
        let deadline = Instant::now() + timeout;
        while !self.thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    job_id = %self.job_id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Fit thread did not exit within timeout"
                );
                return JoinOutcome::TimedOut;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.thread.join().is_ok() {
            debug!(job_id = %self.job_id, "Fit thread joined");
            JoinOutcome::Joined
        } else {
            warn!(job_id = %self.job_id, "Fit thread panicked");
            JoinOutcome::Panicked
        }
    }
}

/// Start a fit job on its own thread.
///
/// `problem` is cloned; the caller's copy is never touched by the worker.
/// `options` are laid over the fitter's defaults before use.
pub fn start_fit(
    problem: &Problem,
    registry: &FitterRegistry,
    fitter_id: &str,
    options: &FitterOptions,
    cadence: Cadence,
    events: &EventSender,
) -> Result<JobHandle, StartError> {
    let unknown = || StartError::UnknownFitter(fitter_id.to_owned());
    let options = registry.resolve_options(fitter_id, options).ok_or_else(unknown)?;
    let fitter = registry.create(fitter_id).ok_or_else(unknown)?;

    let num_params = problem.free_parameters().len();
    if num_params == 0 {
        return Err(StartError::NoFittableParameters);
    }
    let num_steps = fitters::num_steps(fitter_id, num_params, &options);

    let job_id = JobId::new();
    let (abort, token) = abort_pair();
    let worker = Worker {
        problem: problem.clone(),
        fitter,
        options: options.clone(),
        token,
        emitter: events.for_job(job_id),
        cadence,
        num_steps,
    };
    let thread = std::thread::Builder::new()
        .name(format!("fit-{fitter_id}"))
        .spawn(move || worker.run())?;

    info!(%job_id, fitter_id, num_params, num_steps, "Fit thread started");
    Ok(JobHandle {
        job_id,
        active: ActiveFit {
            fitter_id: fitter_id.to_owned(),
            options,
            num_steps,
        },
        started_at: Utc::now(),
        abort,
        thread,
    })
}

struct Worker {
    problem: Problem,
    fitter: Box<dyn Fitter>,
    options: FitterOptions,
    token: AbortToken,
    emitter: JobEmitter,
    cadence: Cadence,
    num_steps: u64,
}

/// What the worker has reported so far, kept outside the unwind boundary.
#[derive(Debug, Default)]
struct Track {
    steps: u64,
    completed: bool,
}

impl Worker {
    fn run(self) {
        let emitter = self.emitter.clone();
        let dof = self.problem.degrees_of_freedom();
        let mut track = Track::default();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.drive(&mut track)));
        let Err(payload) = result else {
            return;
        };
        if track.completed {
            warn!(job_id = %emitter.job_id(), "Fitter panicked after completion");
            return;
        }
        let reason = format!("fitter panicked: {}", panic_message(payload.as_ref()));
        warn!(job_id = %emitter.job_id(), steps = track.steps, %reason, "Fit thread panicked");
        emitter.emit(FitEvent::Complete(FitCompletion {
            outcome: FitOutcome::Failed {
                reason: reason.clone(),
            },
            point: Vec::new(),
            value: f64::INFINITY,
            dof,
            steps: track.steps,
            info: reason,
        }));
    }

    fn drive(mut self, track: &mut Track) {
        let dof = self.problem.degrees_of_freedom();
        let labels = self.problem.labels();

        if let Err(e) = self.fitter.start(&mut self.problem, &self.options) {
            warn!(job_id = %self.emitter.job_id(), error = %e, "Fitter failed to start");
            self.emitter.emit(FitEvent::Complete(FitCompletion {
                outcome: FitOutcome::Failed {
                    reason: e.to_string(),
                },
                point: Vec::new(),
                value: f64::INFINITY,
                dof,
                steps: 0,
                info: e.to_string(),
            }));
            track.completed = true;
            return;
        }

        let mut pending_rows: Vec<ConvergenceRow> = Vec::new();
        let mut step: u64 = 0;
        let mut pending_improvement = false;
        let now = Instant::now();
        let (mut last_progress, mut last_convergence, mut last_uncertainty) = (now, now, now);

        let outcome = loop {
            if self.token.is_aborted() {
                break FitOutcome::Aborted;
            }
            let report = match self.fitter.step(&mut self.problem) {
                Ok(report) => report,
                Err(e) => {
                    break FitOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
            };
            step = step.saturating_add(1);
            track.steps = step;
            pending_rows.push(self.fitter.convergence_row(step));
            pending_improvement |= report.improved;

            let now = Instant::now();
            if now.duration_since(last_progress) >= self.cadence.progress {
                last_progress = now;
                let (point, value) = self.fitter.best();
                self.emitter.emit(FitEvent::Progress(ProgressUpdate {
                    step,
                    num_steps: self.num_steps,
                    value,
                    chisq: format::format_chisq(value, dof),
                    point: point.clone(),
                }));
                if pending_improvement {
                    pending_improvement = false;
                    self.emitter.emit(FitEvent::Improvement { point, value });
                }
            }
            if now.duration_since(last_convergence) >= self.cadence.convergence {
                last_convergence = now;
                self.emitter.emit(FitEvent::ConvergenceUpdate {
                    rows: std::mem::take(&mut pending_rows),
                });
            }
            if now.duration_since(last_uncertainty) >= self.cadence.uncertainty {
                last_uncertainty = now;
                if let Some(summary) = self.fitter.uncertainty(&labels) {
                    self.emitter.emit(FitEvent::UncertaintyUpdate { summary });
                }
            }
            if report.done {
                break FitOutcome::Completed;
            }
        };

        self.emitter.emit(FitEvent::ConvergenceUpdate { rows: pending_rows });
        if let Some(summary) = self.fitter.uncertainty(&labels) {
            self.emitter.emit(FitEvent::UncertaintyFinal { summary });
        }

        let (point, value) = self.fitter.best();
        let info = match &outcome {
            FitOutcome::Failed { reason } => reason.clone(),
            FitOutcome::Completed | FitOutcome::Aborted => {
                format!("chisq={}", format::format_chisq(value, dof))
            }
        };
        debug!(job_id = %self.emitter.job_id(), steps = step, ?outcome, "Fit thread finishing");
        self.emitter.emit(FitEvent::Complete(FitCompletion {
            outcome,
            point,
            value,
            dof,
            steps: step,
            info,
        }));
        track.completed = true;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
