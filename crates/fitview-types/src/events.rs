//! Events emitted by a running fit job.
//!
//! [`FitEvent`] is the closed set of event kinds a fit worker can produce.
//! Events are created on the worker thread, relayed in order to the event
//! loop, and consumed exactly once by the event handlers there.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Periodic progress report from a running fit.
///
/// Broadcast to clients as the ephemeral `fit_progress` event; it is not
/// retained in any topic history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ProgressUpdate {
    /// Iterations completed so far.
    pub step: u64,
    /// Expected total number of iterations.
    pub num_steps: u64,
    /// Best objective value (negative log likelihood) so far.
    #[serde(with = "crate::float::scalar")]
    #[ts(type = "number | string")]
    pub value: f64,
    /// Normalized chi-squared of the best point, formatted for display.
    pub chisq: String,
    /// Best point so far, one entry per fitted parameter.
    #[serde(with = "crate::float::vector")]
    #[ts(type = "Array<number | string>")]
    pub point: Vec<f64>,
}

/// One row of convergence history: the best value and population spread
/// after one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ConvergenceRow {
    /// Iteration number (1-based).
    pub step: u64,
    /// Best objective value in this iteration.
    #[serde(with = "crate::float::scalar")]
    #[ts(type = "number | string")]
    pub best: f64,
    /// Population quantiles (0%, 20%, 50%, 80%, 100%) of the objective,
    /// empty for single-point algorithms.
    #[serde(with = "crate::float::vector")]
    #[ts(type = "Array<number | string>")]
    pub population: Vec<f64>,
}

/// Summary statistics of a population-based fit, per fitted parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct UncertaintySummary {
    /// Parameter names, in point order.
    pub labels: Vec<String>,
    /// Population mean of each parameter.
    #[serde(with = "crate::float::vector")]
    #[ts(type = "Array<number | string>")]
    pub mean: Vec<f64>,
    /// Population standard deviation of each parameter.
    #[serde(with = "crate::float::vector")]
    #[ts(type = "Array<number | string>")]
    pub std: Vec<f64>,
    /// Number of population members the statistics were drawn from.
    pub samples: u64,
}

/// How a fit job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "status", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum FitOutcome {
    /// The fitter ran to its own stopping criterion or step budget.
    Completed,
    /// A stop was requested before the fitter finished.
    Aborted,
    /// The fitter reported an error.
    Failed {
        /// Description of the failure.
        reason: String,
    },
}

/// Terminal payload of a fit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FitCompletion {
    /// Completed, aborted or failed.
    pub outcome: FitOutcome,
    /// Best point found (empty if the fit failed before evaluating one).
    #[serde(with = "crate::float::vector")]
    #[ts(type = "Array<number | string>")]
    pub point: Vec<f64>,
    /// Objective value at `point`.
    #[serde(with = "crate::float::scalar")]
    #[ts(type = "number | string")]
    pub value: f64,
    /// Degrees of freedom used to normalize `value` into chi-squared.
    #[serde(with = "crate::float::scalar")]
    #[ts(type = "number | string")]
    pub dof: f64,
    /// Iterations completed.
    pub steps: u64,
    /// Human-readable summary of the result.
    pub info: String,
}

/// An event produced by a fit job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "message", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum FitEvent {
    /// Periodic progress.
    Progress(ProgressUpdate),
    /// Convergence rows added since the previous update. Concatenating
    /// every update of a job gives its full history.
    ConvergenceUpdate {
        /// One row per iteration.
        rows: Vec<ConvergenceRow>,
    },
    /// Intermediate uncertainty statistics.
    UncertaintyUpdate {
        /// Population statistics.
        summary: UncertaintySummary,
    },
    /// Final uncertainty statistics, sent once before completion.
    UncertaintyFinal {
        /// Population statistics.
        summary: UncertaintySummary,
    },
    /// The best point improved.
    Improvement {
        /// New best point.
        #[serde(with = "crate::float::vector")]
        #[ts(type = "Array<number | string>")]
        point: Vec<f64>,
        /// Objective value at `point`.
        #[serde(with = "crate::float::scalar")]
        #[ts(type = "number | string")]
        value: f64,
    },
    /// The job finished. Always the last event of a job.
    Complete(FitCompletion),
}

impl FitEvent {
    /// Wire name of the event kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::ConvergenceUpdate { .. } => "convergence_update",
            Self::UncertaintyUpdate { .. } => "uncertainty_update",
            Self::UncertaintyFinal { .. } => "uncertainty_final",
            Self::Improvement { .. } => "improvement",
            Self::Complete(_) => "complete",
        }
    }

    /// Whether this is the terminal event of a job.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}
