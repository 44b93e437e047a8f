//! Nelder-Mead downhill simplex.
//!
//! Each [`Fitter::step`] performs one simplex update (reflect, expand,
//! contract or shrink). When the simplex collapses below `xtol`/`ftol` and
//! restarts remain (`starts > 1`), a new simplex is built around a random
//! point within the parameter bounds.

use fitview_types::FitterOptions;
use rand::Rng;
use rand::rngs::StdRng;
use serde_json::json;

use super::{FitError, Fitter, StepReport, require_f64, require_u64, rng_from_options, settings};
use crate::model::Problem;

/// Registry id.
pub const ID: &str = "amoeba";

/// Default settings.
pub fn default_settings() -> FitterOptions {
    settings([
        ("steps", json!(1000)),
        ("starts", json!(1)),
        ("radius", json!(0.15)),
        ("xtol", json!(1e-6)),
        ("ftol", json!(1e-8)),
    ])
}

type Vertex = (Vec<f64>, f64);

/// Nelder-Mead simplex state.
#[derive(Debug, Default)]
pub struct Amoeba {
    bounds: Vec<(f64, f64)>,
    simplex: Vec<Vertex>,
    best: Vertex,
    steps: u64,
    taken: u64,
    starts_left: u64,
    radius: f64,
    xtol: f64,
    ftol: f64,
    rng: Option<StdRng>,
}

impl Amoeba {
    /// Replace the simplex with one around `origin`; returns whether the
    /// best point improved.
    fn build_simplex(&mut self, problem: &mut Problem, origin: Vec<f64>) -> bool {
        let mut simplex = Vec::with_capacity(origin.len().saturating_add(1));
        for dim in 0..origin.len() {
            let mut vertex = origin.clone();
            if let (Some(x), Some((lo, hi))) = (vertex.get_mut(dim), self.bounds.get(dim)) {
                let width = if (hi - lo).is_finite() { hi - lo } else { x.abs().max(1.0) };
                let moved = *x + self.radius * width;
                *x = if moved > *hi { *x - self.radius * width } else { moved };
            }
            let vertex = clip(vertex, &self.bounds);
            let value = evaluate(problem, &vertex);
            simplex.push((vertex, value));
        }
        let value = evaluate(problem, &origin);
        simplex.push((origin, value));
        sort_simplex(&mut simplex);
        self.simplex = simplex;
        self.track_best()
    }

    /// Update the best vertex; returns whether it improved.
    fn track_best(&mut self) -> bool {
        match self.simplex.first() {
            Some((point, value)) if *value < self.best.1 => {
                self.best = (point.clone(), *value);
                true
            }
            _ => false,
        }
    }

    fn converged(&self) -> bool {
        let (Some((best, f_best)), Some((_, f_worst))) = (self.simplex.first(), self.simplex.last()) else {
            return true;
        };
        let f_spread = (f_worst - f_best).abs();
        let f_ok = 2.0 * f_spread <= self.ftol * (f_worst.abs() + f_best.abs()) || f_spread <= f64::EPSILON;
        let x_ok = self
            .simplex
            .iter()
            .flat_map(|(point, _)| point.iter().zip(best).map(|(a, b)| (a - b).abs()))
            .all(|d| d <= self.xtol);
        f_ok && x_ok
    }

    fn random_origin(&mut self) -> Vec<f64> {
        let best = self.best.0.clone();
        let Some(rng) = self.rng.as_mut() else {
            return best;
        };
        self.bounds
            .iter()
            .zip(best)
            .map(|((lo, hi), x)| {
                if (hi - lo).is_finite() && hi > lo {
                    rng.random_range(*lo..=*hi)
                } else {
                    x + x.abs().max(1.0) * rng.random_range(-1.0..=1.0)
                }
            })
            .collect()
    }

    fn replace_worst(&mut self, vertex: Vertex) {
        if let Some(worst) = self.simplex.last_mut() {
            *worst = vertex;
        }
    }
}

impl Fitter for Amoeba {
    fn start(&mut self, problem: &mut Problem, options: &FitterOptions) -> Result<(), FitError> {
        self.steps = require_u64(options, "steps", 1000)?;
        self.starts_left = require_u64(options, "starts", 1)?.max(1);
        self.radius = require_f64(options, "radius", 0.15)?;
        self.xtol = require_f64(options, "xtol", 1e-6)?;
        self.ftol = require_f64(options, "ftol", 1e-8)?;
        self.rng = Some(rng_from_options(options));
        self.taken = 0;
        self.bounds = problem.bounds();

        let origin = clip(problem.current_point(), &self.bounds);
        self.best = (origin.clone(), f64::INFINITY);
        self.build_simplex(problem, origin);
        if !self.best.1.is_finite() {
            return Err(FitError::Diverged(
                "objective is not finite at any starting vertex".to_owned(),
            ));
        }
        Ok(())
    }

    fn step(&mut self, problem: &mut Problem) -> Result<StepReport, FitError> {
        let n = self.simplex.len().saturating_sub(1);
        let (Some((best_point, f_best)), Some((worst_point, f_worst))) =
            (self.simplex.first().cloned(), self.simplex.last().cloned())
        else {
            return Ok(StepReport {
                improved: false,
                done: true,
            });
        };
        let f_second = self
            .simplex
            .get(n.saturating_sub(1))
            .map_or(f_worst, |(_, f)| *f);

        let centroid = centroid(self.simplex.get(..n).unwrap_or_default());
        let along = |t: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(&worst_point)
                .map(|(c, w)| c + t * (c - w))
                .collect()
        };

        let reflected = clip(along(1.0), &self.bounds);
        let f_reflected = evaluate(problem, &reflected);

        if f_reflected < f_best {
            let expanded = clip(along(2.0), &self.bounds);
            let f_expanded = evaluate(problem, &expanded);
            if f_expanded < f_reflected {
                self.replace_worst((expanded, f_expanded));
            } else {
                self.replace_worst((reflected, f_reflected));
            }
        } else if f_reflected < f_second {
            self.replace_worst((reflected, f_reflected));
        } else {
            let t = if f_reflected < f_worst { 0.5 } else { -0.5 };
            let contracted = clip(along(t), &self.bounds);
            let f_contracted = evaluate(problem, &contracted);
            if f_contracted < f_reflected.min(f_worst) {
                self.replace_worst((contracted, f_contracted));
            } else {
                // Shrink every vertex halfway toward the best one.
                for (point, value) in self.simplex.iter_mut().skip(1) {
                    for (x, b) in point.iter_mut().zip(&best_point) {
                        *x = b + 0.5 * (*x - b);
                    }
                    *value = evaluate(problem, point);
                }
            }
        }
        sort_simplex(&mut self.simplex);
        let mut improved = self.track_best();
        self.taken = self.taken.saturating_add(1);

        let mut done = self.taken >= self.steps;
        if !done && self.converged() {
            if self.starts_left > 1 {
                self.starts_left = self.starts_left.saturating_sub(1);
                let origin = clip(self.random_origin(), &self.bounds);
                tracing::debug!(starts_left = self.starts_left, "Simplex converged, restarting");
                improved |= self.build_simplex(problem, origin);
            } else {
                done = true;
            }
        }
        Ok(StepReport { improved, done })
    }

    fn best(&self) -> (Vec<f64>, f64) {
        self.best.clone()
    }
}

/// Objective at `point`, with NaN treated as infinitely bad.
pub(crate) fn evaluate(problem: &mut Problem, point: &[f64]) -> f64 {
    let value = problem.nllf_at(point);
    if value.is_nan() { f64::INFINITY } else { value }
}

/// Clamp each coordinate into its bounds.
pub(crate) fn clip(mut point: Vec<f64>, bounds: &[(f64, f64)]) -> Vec<f64> {
    for (x, (lo, hi)) in point.iter_mut().zip(bounds) {
        *x = x.clamp(*lo, *hi);
    }
    point
}

fn sort_simplex(simplex: &mut [Vertex]) {
    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
}

fn centroid(vertices: &[Vertex]) -> Vec<f64> {
    let Some((first, _)) = vertices.first() else {
        return Vec::new();
    };
    let count = vertices.len() as f64;
    let mut sum = vec![0.0; first.len()];
    for (point, _) in vertices {
        for (s, x) in sum.iter_mut().zip(point) {
            *s += x;
        }
    }
    sum.iter().map(|s| s / count).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{CurveObjective, Parameter, ParameterNode, ParameterTable};

    fn quadratic_problem() -> Problem {
        let c0 = Parameter::fitted("c0", 0.0, -10.0, 10.0).unwrap();
        let c1 = Parameter::fitted("c1", 0.0, -10.0, 10.0).unwrap();
        let ids = vec![c0.id, c1.id];
        let x: Vec<f64> = (0..8).map(f64::from).collect();
        let y = x.iter().map(|x| 2.0 - 0.5 * x).collect();
        let curve = CurveObjective {
            dy: vec![0.1; x.len()],
            x,
            y,
            coefficients: ids.clone(),
        };
        let table: ParameterTable = [c0, c1].into_iter().collect();
        let root = ParameterNode::list(ids.into_iter().map(ParameterNode::leaf));
        Problem::new("line", table, root, Arc::new(curve)).unwrap()
    }

    #[test]
    fn simplex_finds_line_coefficients() {
        let mut problem = quadratic_problem();
        let mut fitter = Amoeba::default();
        let options = settings([("steps", json!(2000)), ("seed", json!(7))]);
        fitter.start(&mut problem, &options).unwrap();

        let mut steps = 0;
        while !fitter.step(&mut problem).unwrap().done {
            steps += 1;
            assert!(steps < 5000);
        }
        let (point, value) = fitter.best();
        assert!((point[0] - 2.0).abs() < 1e-3, "c0 = {}", point[0]);
        assert!((point[1] + 0.5).abs() < 1e-3, "c1 = {}", point[1]);
        assert!(value < 1e-3);
    }

    #[test]
    fn step_budget_is_respected() {
        let mut problem = quadratic_problem();
        let mut fitter = Amoeba::default();
        fitter
            .start(&mut problem, &settings([("steps", json!(3))]))
            .unwrap();
        assert!(!fitter.step(&mut problem).unwrap().done);
        assert!(!fitter.step(&mut problem).unwrap().done);
        assert!(fitter.step(&mut problem).unwrap().done);
    }

    #[test]
    fn bad_option_type_is_rejected() {
        let mut problem = quadratic_problem();
        let mut fitter = Amoeba::default();
        let result = fitter.start(&mut problem, &settings([("radius", json!("big"))]));
        assert!(matches!(result, Err(FitError::InvalidOption { .. })));
    }

    #[test]
    fn clip_respects_bounds() {
        let clipped = clip(vec![-5.0, 0.5, 5.0], &[(0.0, 1.0); 3]);
        assert_eq!(clipped, vec![0.0, 0.5, 1.0]);
    }
}
