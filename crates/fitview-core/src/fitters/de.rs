//! Differential evolution (rand/1/bin).
//!
//! Each [`Fitter::step`] is one generation: every member proposes a trial
//! vector `a + F (b - c)` crossed over with itself at rate `CR`, and keeps
//! whichever of member and trial scores better. The population doubles as
//! the sample for uncertainty statistics.

use fitview_types::{FitterOptions, UncertaintySummary};
use rand::Rng;
use rand::rngs::StdRng;
use serde_json::json;

use super::amoeba::{clip, evaluate};
use super::{FitError, Fitter, StepReport, require_f64, require_u64, rng_from_options, settings};
use crate::model::Problem;

/// Registry id.
pub const ID: &str = "de";

/// Smallest population that still allows three distinct donors.
const MIN_POPULATION: usize = 5;

/// Default settings.
pub fn default_settings() -> FitterOptions {
    settings([
        ("steps", json!(1000)),
        ("pop", json!(10)),
        ("CR", json!(0.9)),
        ("F", json!(2.0)),
        ("ftol", json!(1e-8)),
        ("xtol", json!(1e-6)),
    ])
}

/// Differential evolution state.
#[derive(Debug, Default)]
pub struct DifferentialEvolution {
    bounds: Vec<(f64, f64)>,
    members: Vec<Vec<f64>>,
    values: Vec<f64>,
    best: (Vec<f64>, f64),
    steps: u64,
    taken: u64,
    crossover: f64,
    weight: f64,
    ftol: f64,
    xtol: f64,
    rng: Option<StdRng>,
}

impl DifferentialEvolution {
    fn track_best(&mut self) -> bool {
        let Some((index, value)) = self
            .values
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return false;
        };
        match self.members.get(index) {
            Some(member) if value < self.best.1 => {
                self.best = (member.clone(), value);
                true
            }
            _ => false,
        }
    }

    fn converged(&self) -> bool {
        let finite = self.values.iter().copied().filter(|v| v.is_finite());
        let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        let f_ok = hi - lo <= self.ftol * (lo.abs() + hi.abs()).max(f64::MIN_POSITIVE);
        let x_ok = self.members.iter().all(|member| {
            member
                .iter()
                .zip(&self.best.0)
                .all(|(x, b)| (x - b).abs() <= self.xtol)
        });
        f_ok && x_ok
    }

    /// Three distinct member indices, all different from `skip`.
    fn donors(rng: &mut StdRng, size: usize, skip: usize) -> [usize; 3] {
        let mut picked = [skip; 3];
        for slot in 0..3 {
            let mut candidate = rng.random_range(0..size);
            while candidate == skip || picked.get(..slot).is_some_and(|p| p.contains(&candidate)) {
                candidate = rng.random_range(0..size);
            }
            if let Some(entry) = picked.get_mut(slot) {
                *entry = candidate;
            }
        }
        picked
    }
}

impl Fitter for DifferentialEvolution {
    fn start(&mut self, problem: &mut Problem, options: &FitterOptions) -> Result<(), FitError> {
        self.steps = require_u64(options, "steps", 1000)?;
        let pop = require_u64(options, "pop", 10)?;
        self.crossover = require_f64(options, "CR", 0.9)?;
        self.weight = require_f64(options, "F", 2.0)?;
        self.ftol = require_f64(options, "ftol", 1e-8)?;
        self.xtol = require_f64(options, "xtol", 1e-6)?;
        if !(0.0..=1.0).contains(&self.crossover) {
            return Err(FitError::InvalidOption {
                name: "CR".to_owned(),
                reason: "must lie in [0, 1]".to_owned(),
            });
        }
        self.taken = 0;
        self.bounds = problem.bounds();

        let origin = clip(problem.current_point(), &self.bounds);
        let size = usize::try_from(pop)
            .unwrap_or(usize::MAX)
            .saturating_mul(origin.len())
            .max(MIN_POPULATION);

        let mut rng = rng_from_options(options);
        let mut members = Vec::with_capacity(size);
        members.push(origin.clone());
        while members.len() < size {
            let member = self
                .bounds
                .iter()
                .zip(&origin)
                .map(|((lo, hi), x)| {
                    if (hi - lo).is_finite() && hi > lo {
                        rng.random_range(*lo..=*hi)
                    } else {
                        x + 0.1 * x.abs().max(1.0) * rng.random_range(-1.0..=1.0)
                    }
                })
                .collect();
            members.push(member);
        }
        self.values = members.iter().map(|m| evaluate(problem, m)).collect();
        self.members = members;
        self.rng = Some(rng);
        self.best = (origin, f64::INFINITY);
        self.track_best();

        if !self.best.1.is_finite() {
            return Err(FitError::Diverged(
                "objective is not finite anywhere in the initial population".to_owned(),
            ));
        }
        Ok(())
    }

    fn step(&mut self, problem: &mut Problem) -> Result<StepReport, FitError> {
        let Some(mut rng) = self.rng.take() else {
            return Ok(StepReport {
                improved: false,
                done: true,
            });
        };
        let size = self.members.len();
        let dims = self.bounds.len();

        for i in 0..size {
            let [a, b, c] = Self::donors(&mut rng, size, i);
            let (Some(target), Some(a), Some(b), Some(c)) = (
                self.members.get(i),
                self.members.get(a),
                self.members.get(b),
                self.members.get(c),
            ) else {
                continue;
            };
            let forced = rng.random_range(0..dims.max(1));
            let trial: Vec<f64> = (0..dims)
                .map(|j| {
                    let own = target.get(j).copied().unwrap_or_default();
                    if j == forced || rng.random::<f64>() < self.crossover {
                        let (aj, bj, cj) = (
                            a.get(j).copied().unwrap_or(own),
                            b.get(j).copied().unwrap_or(own),
                            c.get(j).copied().unwrap_or(own),
                        );
                        aj + self.weight * (bj - cj)
                    } else {
                        own
                    }
                })
                .collect();
            let trial = clip(trial, &self.bounds);
            let value = evaluate(problem, &trial);
            if let (Some(member), Some(current)) = (self.members.get_mut(i), self.values.get_mut(i)) {
                if value <= *current {
                    *member = trial;
                    *current = value;
                }
            }
        }
        self.rng = Some(rng);

        let improved = self.track_best();
        self.taken = self.taken.saturating_add(1);
        let done = self.taken >= self.steps || self.converged();
        Ok(StepReport { improved, done })
    }

    fn best(&self) -> (Vec<f64>, f64) {
        self.best.clone()
    }

    fn population_values(&self) -> Vec<f64> {
        self.values.clone()
    }

    fn uncertainty(&self, labels: &[String]) -> Option<UncertaintySummary> {
        let count = self.members.len();
        if count < 2 {
            return None;
        }
        let n = count as f64;
        let dims = self.bounds.len();
        let mean: Vec<f64> = (0..dims)
            .map(|j| self.members.iter().filter_map(|m| m.get(j)).sum::<f64>() / n)
            .collect();
        let std = mean
            .iter()
            .enumerate()
            .map(|(j, mu)| {
                let ss: f64 = self
                    .members
                    .iter()
                    .filter_map(|m| m.get(j))
                    .map(|x| (x - mu) * (x - mu))
                    .sum();
                (ss / (n - 1.0)).sqrt()
            })
            .collect();
        Some(UncertaintySummary {
            labels: labels.to_vec(),
            mean,
            std,
            samples: u64::try_from(count).unwrap_or(u64::MAX),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{CurveObjective, Parameter, ParameterNode, ParameterTable};

    fn constant_problem() -> Problem {
        let level = Parameter::fitted("level", 0.0, -5.0, 5.0).unwrap();
        let id = level.id;
        let curve = CurveObjective {
            x: vec![0.0, 1.0, 2.0],
            y: vec![1.5, 1.5, 1.5],
            dy: vec![0.5; 3],
            coefficients: vec![id],
        };
        let table: ParameterTable = std::iter::once(level).collect();
        Problem::new("constant", table, ParameterNode::leaf(id), Arc::new(curve)).unwrap()
    }

    fn seeded(steps: u64) -> FitterOptions {
        let mut options = default_settings();
        options.insert("steps".to_owned(), json!(steps));
        options.insert("F".to_owned(), json!(0.8));
        options.insert("seed".to_owned(), json!(11));
        options
    }

    #[test]
    fn evolution_converges_on_constant_level() {
        let mut problem = constant_problem();
        let mut fitter = DifferentialEvolution::default();
        fitter.start(&mut problem, &seeded(300)).unwrap();
        while !fitter.step(&mut problem).unwrap().done {}
        let (point, value) = fitter.best();
        assert!((point[0] - 1.5).abs() < 1e-3, "level = {}", point[0]);
        assert!(value < 1e-5);
    }

    #[test]
    fn population_reports_quantiles_and_uncertainty() {
        let mut problem = constant_problem();
        let mut fitter = DifferentialEvolution::default();
        fitter.start(&mut problem, &seeded(5)).unwrap();
        fitter.step(&mut problem).unwrap();

        let row = fitter.convergence_row(1);
        assert_eq!(row.step, 1);
        assert_eq!(row.population.len(), 5);
        assert!(row.population.windows(2).all(|w| w[0] <= w[1]));

        let summary = fitter.uncertainty(&["level".to_owned()]).unwrap();
        assert_eq!(summary.labels, vec!["level"]);
        assert_eq!(summary.mean.len(), 1);
        assert_eq!(summary.samples, 10);
    }

    #[test]
    fn crossover_rate_is_validated() {
        let mut problem = constant_problem();
        let mut fitter = DifferentialEvolution::default();
        let mut options = default_settings();
        options.insert("CR".to_owned(), json!(1.5));
        assert!(matches!(
            fitter.start(&mut problem, &options),
            Err(FitError::InvalidOption { .. })
        ));
    }
}
