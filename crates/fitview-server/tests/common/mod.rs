//! Fixtures shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use fitview_core::config::FitviewConfig;
use fitview_core::fitters::{FitError, Fitter, FitterRegistry, StepReport};
use fitview_core::model::{CurveObjective, Parameter, ParameterNode, ParameterTable, Problem};
use fitview_server::ServerState;
use fitview_server::topics::PushFrame;
use fitview_types::{FitterOptions, ParameterId, Topic};
use tokio::sync::broadcast;

/// Point the scripted fitter reports as its best.
pub const SCRIPTED_POINT: [f64; 2] = [1.234_567_89, 2.000_000_123];

/// Ids of the problem built by [`line_problem`].
pub struct LineIds {
    pub intercept: ParameterId,
    pub slope: ParameterId,
    pub offset: ParameterId,
}

/// `y = 1 + 2x` with two fitted coefficients and one fixed, unbounded
/// parameter. The slope is referenced from two paths.
pub fn line_problem() -> (Problem, LineIds) {
    let intercept = Parameter::fitted("intercept", 0.0, -10.0, 10.0).unwrap();
    let slope = Parameter::fitted("slope", 0.0, -10.0, 10.0).unwrap();
    let offset = Parameter::new("offset", 0.5);
    let ids = LineIds {
        intercept: intercept.id,
        slope: slope.id,
        offset: offset.id,
    };
    let curve = CurveObjective {
        x: vec![0.0, 1.0, 2.0, 3.0, 4.0],
        y: vec![1.0, 3.0, 5.0, 7.0, 9.0],
        dy: vec![1.0; 5],
        coefficients: vec![ids.intercept, ids.slope],
    };
    let root = ParameterNode::map([
        (
            "line",
            ParameterNode::list([ParameterNode::leaf(ids.intercept), ParameterNode::leaf(ids.slope)]),
        ),
        (
            "meta",
            ParameterNode::map([
                ("offset", ParameterNode::leaf(ids.offset)),
                ("slope", ParameterNode::leaf(ids.slope)),
            ]),
        ),
    ]);
    let table: ParameterTable = [intercept, slope, offset].into_iter().collect();
    let problem = Problem::new("line", table, root, Arc::new(curve)).unwrap();
    (problem, ids)
}

/// Three iterations: improves to [`SCRIPTED_POINT`] on the first, finishes
/// on the third.
#[derive(Default)]
pub struct Scripted {
    step: u64,
    point: Vec<f64>,
    value: f64,
}

impl Fitter for Scripted {
    fn start(&mut self, problem: &mut Problem, _options: &FitterOptions) -> Result<(), FitError> {
        self.point = problem.current_point();
        self.value = problem.objective();
        Ok(())
    }

    fn step(&mut self, problem: &mut Problem) -> Result<StepReport, FitError> {
        self.step += 1;
        let improved = self.step == 1;
        if improved {
            self.point = SCRIPTED_POINT.to_vec();
            self.value = problem.nllf_at(&self.point);
        }
        Ok(StepReport {
            improved,
            done: self.step >= 3,
        })
    }

    fn best(&self) -> (Vec<f64>, f64) {
        (self.point.clone(), self.value)
    }
}

/// Steps slowly and never finishes on its own.
#[derive(Default)]
pub struct Endless {
    point: Vec<f64>,
}

impl Fitter for Endless {
    fn start(&mut self, problem: &mut Problem, _options: &FitterOptions) -> Result<(), FitError> {
        self.point = problem.current_point();
        Ok(())
    }

    fn step(&mut self, _problem: &mut Problem) -> Result<StepReport, FitError> {
        std::thread::sleep(Duration::from_millis(2));
        Ok(StepReport::default())
    }

    fn best(&self) -> (Vec<f64>, f64) {
        (self.point.clone(), 1.0)
    }
}

/// Reports [`FAULTY_POINT`] as its best but fails on the first step.
#[derive(Default)]
pub struct Faulty;

/// Point the faulty fitter claims as its best.
pub const FAULTY_POINT: [f64; 2] = [9.0, 9.0];

impl Fitter for Faulty {
    fn start(&mut self, _problem: &mut Problem, _options: &FitterOptions) -> Result<(), FitError> {
        Ok(())
    }

    fn step(&mut self, _problem: &mut Problem) -> Result<StepReport, FitError> {
        Err(FitError::Diverged("objective went to nan".to_owned()))
    }

    fn best(&self) -> (Vec<f64>, f64) {
        (FAULTY_POINT.to_vec(), 0.0)
    }
}

/// Rejects its options before the first step.
#[derive(Default)]
pub struct Unstartable;

impl Fitter for Unstartable {
    fn start(&mut self, _problem: &mut Problem, _options: &FitterOptions) -> Result<(), FitError> {
        Err(FitError::InvalidOption {
            name: "steps".to_owned(),
            reason: "must be positive".to_owned(),
        })
    }

    fn step(&mut self, _problem: &mut Problem) -> Result<StepReport, FitError> {
        Ok(StepReport {
            improved: false,
            done: true,
        })
    }

    fn best(&self) -> (Vec<f64>, f64) {
        (Vec::new(), f64::INFINITY)
    }
}

/// How long a [`Lingering`] fitter blocks its thread after finishing.
pub const LINGER: Duration = Duration::from_millis(300);

/// Finishes after one step, then holds its worker thread for [`LINGER`]
/// while being dropped.
#[derive(Default)]
pub struct Lingering {
    point: Vec<f64>,
}

impl Fitter for Lingering {
    fn start(&mut self, problem: &mut Problem, _options: &FitterOptions) -> Result<(), FitError> {
        self.point = problem.current_point();
        Ok(())
    }

    fn step(&mut self, _problem: &mut Problem) -> Result<StepReport, FitError> {
        Ok(StepReport {
            improved: false,
            done: true,
        })
    }

    fn best(&self) -> (Vec<f64>, f64) {
        (self.point.clone(), 1.0)
    }
}

impl Drop for Lingering {
    fn drop(&mut self) {
        std::thread::sleep(LINGER);
    }
}

/// Panics on its first step.
#[derive(Default)]
pub struct Panicky;

impl Fitter for Panicky {
    fn start(&mut self, _problem: &mut Problem, _options: &FitterOptions) -> Result<(), FitError> {
        Ok(())
    }

    fn step(&mut self, _problem: &mut Problem) -> Result<StepReport, FitError> {
        panic!("panicky fitter gave up");
    }

    fn best(&self) -> (Vec<f64>, f64) {
        (Vec::new(), f64::INFINITY)
    }
}

/// Built-in fitters plus the scripted test fitters.
pub fn registry() -> FitterRegistry {
    let mut registry = FitterRegistry::builtin();
    registry.register(
        "scripted",
        "Scripted",
        FitterOptions::from([("steps".to_owned(), serde_json::json!(3))]),
        Arc::new(|| Box::new(Scripted::default())),
    );
    registry.register(
        "endless",
        "Endless",
        FitterOptions::new(),
        Arc::new(|| Box::new(Endless::default())),
    );
    registry.register("faulty", "Faulty", FitterOptions::new(), Arc::new(|| Box::new(Faulty)));
    registry.register(
        "unstartable",
        "Unstartable",
        FitterOptions::new(),
        Arc::new(|| Box::new(Unstartable)),
    );
    registry.register(
        "lingering",
        "Lingering",
        FitterOptions::new(),
        Arc::new(|| Box::new(Lingering::default())),
    );
    registry.register("panicky", "Panicky", FitterOptions::new(), Arc::new(|| Box::new(Panicky)));
    registry
}

/// Progress on every iteration; everything else at defaults.
pub fn config() -> FitviewConfig {
    let mut config = FitviewConfig::default();
    config.fit.progress_interval_ms = 0;
    config
}

/// Fresh state with no problem loaded.
pub fn empty_state() -> Arc<ServerState> {
    ServerState::bootstrap(config(), registry())
}

/// Fresh state with [`line_problem`] installed and nothing published.
pub async fn loaded_state() -> (Arc<ServerState>, LineIds) {
    loaded_state_with(config()).await
}

/// [`loaded_state`] with a caller-supplied configuration.
pub async fn loaded_state_with(config: FitviewConfig) -> (Arc<ServerState>, LineIds) {
    let state = ServerState::bootstrap(config, registry());
    let (problem, ids) = line_problem();
    state
        .install_problem(problem, vec!["data".to_owned()], "line.json".to_owned())
        .await;
    (state, ids)
}

/// Receive frames until the `log` record titled `done with chisq ...` or
/// `fit failed: ...`, the last publication of a finished fit. Returns
/// every frame seen.
pub async fn frames_until_done(rx: &mut broadcast::Receiver<PushFrame>) -> Vec<PushFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let done = matches!(
            &frame,
            PushFrame::Topic { topic: Topic::Log, contents }
                if contents.message["title"]
                    .as_str()
                    .is_some_and(|title| {
                        title.starts_with("done with chisq") || title.starts_with("fit failed")
                    })
        );
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

/// Number of topic frames on `topic`.
pub fn count_topic(frames: &[PushFrame], wanted: Topic) -> usize {
    frames
        .iter()
        .filter(|frame| matches!(frame, PushFrame::Topic { topic, .. } if *topic == wanted))
        .count()
}
