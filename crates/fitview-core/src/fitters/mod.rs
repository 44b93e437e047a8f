//! Fitting algorithms and the registry that names them.
//!
//! A [`Fitter`] is driven one iteration at a time by the worker thread
//! runner ([`crate::fit_thread`]), which is what lets cancellation be
//! polled between iterations. Algorithms are looked up by id in a
//! [`FitterRegistry`]; hosts and tests may register their own.
//!
//! # Built-in algorithms
//!
//! - [`amoeba`] -- Nelder-Mead downhill simplex with random restarts.
//! - [`de`] -- Differential evolution (rand/1/bin).

pub mod amoeba;
pub mod de;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use fitview_types::{ConvergenceRow, FitterInfo, FitterOptions, UncertaintySummary};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::model::{ModelError, Problem};

/// Errors raised by a fitting algorithm.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    /// An option had the wrong type or an out-of-range value.
    #[error("invalid option {name}: {reason}")]
    InvalidOption {
        /// Option name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The problem could not be evaluated.
    #[error("model error: {source}")]
    Model {
        /// The underlying model error.
        #[from]
        source: ModelError,
    },

    /// The objective became non-finite everywhere the algorithm looked.
    #[error("fit diverged: {0}")]
    Diverged(String),
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// The best point improved during this iteration.
    pub improved: bool,
    /// The algorithm has met its stopping criterion or step budget.
    pub done: bool,
}

/// An iterative optimizer.
///
/// The runner calls [`start`](Fitter::start) once, then
/// [`step`](Fitter::step) until it reports `done` or the job is aborted.
/// Fitters evaluate the objective through [`Problem::nllf_at`] on the
/// worker's private copy of the problem.
pub trait Fitter: Send {
    /// Prepare a run from the problem's current point.
    fn start(&mut self, problem: &mut Problem, options: &FitterOptions) -> Result<(), FitError>;

    /// Advance one iteration.
    fn step(&mut self, problem: &mut Problem) -> Result<StepReport, FitError>;

    /// Best point found so far and its objective value.
    fn best(&self) -> (Vec<f64>, f64);

    /// Objective values of the current population. Empty for
    /// single-point algorithms.
    fn population_values(&self) -> Vec<f64> {
        Vec::new()
    }

    /// Convergence history row for iteration `step`.
    fn convergence_row(&self, step: u64) -> ConvergenceRow {
        ConvergenceRow {
            step,
            best: self.best().1,
            population: quantiles(self.population_values()),
        }
    }

    /// Population statistics, for algorithms that keep a population.
    fn uncertainty(&self, _labels: &[String]) -> Option<UncertaintySummary> {
        None
    }
}

/// Constructor for a fresh fitter instance.
pub type FitterFactory = Arc<dyn Fn() -> Box<dyn Fitter> + Send + Sync>;

#[derive(Clone)]
struct RegisteredFitter {
    info: FitterInfo,
    factory: FitterFactory,
}

/// Fitter ids mapped to display info, default settings and a constructor.
#[derive(Clone, Default)]
pub struct FitterRegistry {
    entries: BTreeMap<String, RegisteredFitter>,
}

impl fmt::Debug for FitterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FitterRegistry")
            .field("fitters", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FitterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in algorithms.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            amoeba::ID,
            "Nelder-Mead Simplex",
            amoeba::default_settings(),
            Arc::new(|| Box::new(amoeba::Amoeba::default())),
        );
        registry.register(
            de::ID,
            "Differential Evolution",
            de::default_settings(),
            Arc::new(|| Box::new(de::DifferentialEvolution::default())),
        );
        registry
    }

    /// Add or replace a fitter.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        settings: FitterOptions,
        factory: FitterFactory,
    ) {
        self.entries.insert(
            id.into(),
            RegisteredFitter {
                info: FitterInfo {
                    name: name.into(),
                    settings,
                },
                factory,
            },
        );
    }

    /// Whether `id` names a registered fitter.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Display info and default settings for every fitter, keyed by id.
    pub fn defaults(&self) -> BTreeMap<String, FitterInfo> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.info.clone()))
            .collect()
    }

    /// Construct a fresh instance of fitter `id`.
    pub fn create(&self, id: &str) -> Option<Box<dyn Fitter>> {
        self.entries.get(id).map(|entry| (entry.factory)())
    }

    /// `options` laid over the defaults of fitter `id`.
    pub fn resolve_options(&self, id: &str, options: &FitterOptions) -> Option<FitterOptions> {
        self.entries.get(id).map(|entry| {
            let mut merged = entry.info.settings.clone();
            merged.extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        })
    }
}

/// Expected number of iterations for a run, used for progress reporting.
///
/// The `steps` option, except for `dream` with `steps == 0`, where the
/// budget is `burn + samples / (pop * num_fit_params)`.
pub fn num_steps(fitter_id: &str, num_fit_params: usize, options: &FitterOptions) -> u64 {
    let steps = option_u64(options, "steps").unwrap_or(0);
    if fitter_id == "dream" && steps == 0 {
        let burn = option_u64(options, "burn").unwrap_or(0);
        let samples = option_u64(options, "samples").unwrap_or(0);
        let pop = option_u64(options, "pop").unwrap_or(0);
        let per_step = pop.saturating_mul(u64::try_from(num_fit_params).unwrap_or(u64::MAX));
        burn.saturating_add(samples.checked_div(per_step).unwrap_or(0))
    } else {
        steps
    }
}

// ---------------------------------------------------------------------------
// Option helpers
// ---------------------------------------------------------------------------

/// Read a non-negative integer option. Accepts integral floats.
pub fn option_u64(options: &FitterOptions, name: &str) -> Option<u64> {
    let value = options.get(name)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
            // Range checked above.
            .map(|f| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let n = f as u64;
                n
            })
    })
}

/// Read a numeric option.
pub fn option_f64(options: &FitterOptions, name: &str) -> Option<f64> {
    options.get(name).and_then(serde_json::Value::as_f64)
}

/// Read a required non-negative integer option, failing on a wrong type.
pub(crate) fn require_u64(options: &FitterOptions, name: &str, default: u64) -> Result<u64, FitError> {
    match options.get(name) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(_) => option_u64(options, name).ok_or_else(|| FitError::InvalidOption {
            name: name.to_owned(),
            reason: "expected a non-negative integer".to_owned(),
        }),
    }
}

/// Read a required finite numeric option, failing on a wrong type.
pub(crate) fn require_f64(options: &FitterOptions, name: &str, default: f64) -> Result<f64, FitError> {
    match options.get(name) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(_) => option_f64(options, name)
            .filter(|f| f.is_finite())
            .ok_or_else(|| FitError::InvalidOption {
                name: name.to_owned(),
                reason: "expected a finite number".to_owned(),
            }),
    }
}

/// Random source for a run: seeded from the `seed` option when present.
pub(crate) fn rng_from_options(options: &FitterOptions) -> StdRng {
    option_u64(options, "seed").map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64)
}

/// Build a settings map from `(name, value)` pairs.
pub(crate) fn settings<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> FitterOptions {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_owned(), value))
        .collect()
}

/// Population quantiles at 0%, 20%, 50%, 80% and 100%. Empty input gives
/// an empty result; non-finite values are ignored.
pub fn quantiles(mut values: Vec<f64>) -> Vec<f64> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return Vec::new();
    }
    values.sort_by(f64::total_cmp);
    let last = values.len().saturating_sub(1);
    [0.0, 0.2, 0.5, 0.8, 1.0]
        .iter()
        .filter_map(|q| {
            // Index is within [0, last] for q in [0, 1].
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let index = (q * last as f64).round() as usize;
            values.get(index).copied()
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builtin_registry_lists_defaults() {
        let registry = FitterRegistry::builtin();
        let defaults = registry.defaults();
        assert!(defaults.contains_key("amoeba"));
        assert!(defaults.contains_key("de"));
        assert!(!registry.contains("dream"));
        assert!(registry.create("amoeba").is_some());
        assert!(registry.create("nope").is_none());
    }

    #[test]
    fn options_are_merged_over_defaults() {
        let registry = FitterRegistry::builtin();
        let overrides = settings([("steps", json!(50))]);
        let merged = registry.resolve_options("amoeba", &overrides).unwrap();
        assert_eq!(option_u64(&merged, "steps"), Some(50));
        assert_eq!(option_u64(&merged, "starts"), Some(1));
    }

    #[test]
    fn num_steps_uses_steps_option() {
        let options = settings([("steps", json!(250))]);
        assert_eq!(num_steps("amoeba", 3, &options), 250);
    }

    #[test]
    fn dream_num_steps_derives_from_samples() {
        let options = settings([
            ("samples", json!(10_000)),
            ("burn", json!(100)),
            ("pop", json!(10)),
            ("steps", json!(0)),
        ]);
        // 100 + 10000 / (10 * 4)
        assert_eq!(num_steps("dream", 4, &options), 350);
        let explicit = settings([("steps", json!(7)), ("burn", json!(100))]);
        assert_eq!(num_steps("dream", 4, &explicit), 7);
    }

    #[test]
    fn option_u64_accepts_integral_floats_only() {
        let options = settings([("a", json!(3.0)), ("b", json!(2.5)), ("c", json!("x"))]);
        assert_eq!(option_u64(&options, "a"), Some(3));
        assert_eq!(option_u64(&options, "b"), None);
        assert!(require_u64(&options, "c", 1).is_err());
        assert_eq!(require_u64(&options, "missing", 9).ok(), Some(9));
    }

    #[test]
    fn quantiles_pick_order_statistics() {
        let values: Vec<f64> = (0..=10).map(f64::from).rev().collect();
        assert_eq!(quantiles(values), vec![0.0, 2.0, 5.0, 8.0, 10.0]);
        assert!(quantiles(Vec::new()).is_empty());
    }
}
