//! Parameter model and fit problem.
//!
//! A [`Problem`] owns a [`ParameterTable`] (identity to parameter, O(1)
//! lookup), a [`ParameterNode`] tree describing where each parameter sits
//! in the model, and an [`Objective`] that scores the current values.
//!
//! The tree stores parameter *ids*, not parameters. A parameter that is
//! shared between several parts of a model ("linked") appears as the same
//! [`ParameterId`] at several leaves, so identity survives cloning and
//! serialization.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use fitview_types::ParameterId;
use serde::{Deserialize, Serialize};

use crate::format;

/// Errors raised while building or mutating a problem.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Bounds were not finite or were inverted.
    #[error("invalid bounds [{lo}, {hi}]")]
    InvalidBounds {
        /// Requested lower bound.
        lo: f64,
        /// Requested upper bound.
        hi: f64,
    },

    /// A parameter id was not found in the table.
    #[error("parameter {0} does not exist")]
    UnknownParameter(ParameterId),

    /// The parameter has no bounds, so bound-relative operations are undefined.
    #[error("parameter {0} has no bounds")]
    NoBounds(ParameterId),

    /// A point had the wrong number of entries for the fitted parameters.
    #[error("point has {actual} values but the problem fits {expected} parameters")]
    PointLength {
        /// Number of fitted parameters.
        expected: usize,
        /// Length of the supplied point.
        actual: usize,
    },

    /// The problem definition is inconsistent.
    #[error("invalid problem definition: {0}")]
    Definition(String),

    /// The objective cannot be written back to a definition.
    #[error("objective {0} cannot be serialized")]
    NotSerializable(String),
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Inclusive value range of a parameter. Always finite with `lo <= hi`.
///
/// Serialized as a two-element array `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(f64, f64)", into = "(f64, f64)")]
pub struct Bounds {
    lo: f64,
    hi: f64,
}

impl Bounds {
    /// Create bounds, rejecting non-finite or inverted ranges.
    pub fn new(lo: f64, hi: f64) -> Result<Self, ModelError> {
        if lo.is_finite() && hi.is_finite() && lo <= hi {
            Ok(Self { lo, hi })
        } else {
            Err(ModelError::InvalidBounds { lo, hi })
        }
    }

    /// Lower bound.
    pub const fn lo(&self) -> f64 {
        self.lo
    }

    /// Upper bound.
    pub const fn hi(&self) -> f64 {
        self.hi
    }

    /// Clamp `value` into the range.
    pub fn clip(&self, value: f64) -> f64 {
        value.clamp(self.lo, self.hi)
    }

    /// Position of `value` within the range, in `[0, 1]` for in-range values.
    pub fn get01(&self, value: f64) -> f64 {
        let width = self.hi - self.lo;
        if width > 0.0 {
            (value - self.lo) / width
        } else {
            0.0
        }
    }

    /// Value at relative position `v01` within the range.
    pub fn put01(&self, v01: f64) -> f64 {
        self.lo + v01 * (self.hi - self.lo)
    }
}

impl TryFrom<(f64, f64)> for Bounds {
    type Error = ModelError;

    fn try_from((lo, hi): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lo, hi)
    }
}

impl From<Bounds> for (f64, f64) {
    fn from(bounds: Bounds) -> Self {
        (bounds.lo, bounds.hi)
    }
}

/// How a parameter's value is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// A plain value that clients may set.
    #[default]
    Value,
    /// A value computed from other parameters; read-only for clients.
    Derived,
}

/// One tunable value of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Stable identity.
    pub id: ParameterId,
    /// Human-readable name.
    pub name: String,
    /// Current value.
    pub value: f64,
    /// Whether the parameter may take part in a fit.
    #[serde(default = "default_true")]
    pub fittable: bool,
    /// Whether the parameter is currently held constant.
    #[serde(default)]
    pub fixed: bool,
    /// Storage kind; derived parameters are not writable.
    #[serde(default)]
    pub slot: Slot,
    /// Allowed range, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

impl Parameter {
    /// A fixed, unbounded parameter with a fresh identity.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            id: ParameterId::new(),
            name: name.into(),
            value,
            fittable: true,
            fixed: true,
            slot: Slot::Value,
            bounds: None,
        }
    }

    /// A parameter free to vary within `[lo, hi]`.
    pub fn fitted(name: impl Into<String>, value: f64, lo: f64, hi: f64) -> Result<Self, ModelError> {
        let mut parameter = Self::new(name, value);
        parameter.set_range(lo, hi)?;
        Ok(parameter)
    }

    /// Give the parameter a range and release it for fitting.
    pub fn set_range(&mut self, lo: f64, hi: f64) -> Result<(), ModelError> {
        self.bounds = Some(Bounds::new(lo, hi)?);
        self.fixed = false;
        Ok(())
    }

    /// Set the value, clamped to the bounds when present.
    pub fn clip_set(&mut self, value: f64) {
        self.value = self.bounds.map_or(value, |bounds| bounds.clip(value));
    }

    /// Whether clients may set the value directly.
    pub fn writable(&self) -> bool {
        self.slot == Slot::Value
    }

    /// Whether the parameter takes part in a fit.
    pub const fn is_free(&self) -> bool {
        self.fittable && !self.fixed
    }
}

const fn default_true() -> bool {
    true
}

/// Identity-keyed parameter storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTable {
    by_id: HashMap<ParameterId, Parameter>,
}

impl ParameterTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, returning its id. Replaces any parameter with
    /// the same id.
    pub fn insert(&mut self, parameter: Parameter) -> ParameterId {
        let id = parameter.id;
        self.by_id.insert(id, parameter);
        id
    }

    /// Look up a parameter by identity.
    pub fn get(&self, id: ParameterId) -> Option<&Parameter> {
        self.by_id.get(&id)
    }

    /// Mutable lookup by identity.
    pub fn get_mut(&mut self, id: ParameterId) -> Option<&mut Parameter> {
        self.by_id.get_mut(&id)
    }

    /// Current value of a parameter.
    pub fn value(&self, id: ParameterId) -> Option<f64> {
        self.get(id).map(|p| p.value)
    }

    /// Whether the id is present.
    pub fn contains(&self, id: ParameterId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// All parameters, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.by_id.values()
    }
}

impl FromIterator<Parameter> for ParameterTable {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        let mut table = Self::new();
        for parameter in iter {
            table.insert(parameter);
        }
        table
    }
}

// ---------------------------------------------------------------------------
// Parameter tree
// ---------------------------------------------------------------------------

/// Nested structure locating parameters within a model.
///
/// Serialized untagged: a string is a leaf (parameter id), an array is a
/// list, an object is a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterNode {
    /// A reference to one parameter.
    Leaf(ParameterId),
    /// Children addressed by index.
    List(Vec<ParameterNode>),
    /// Children addressed by key; traversed in sorted key order.
    Map(BTreeMap<String, ParameterNode>),
}

impl ParameterNode {
    /// A leaf referencing `id`.
    pub const fn leaf(id: ParameterId) -> Self {
        Self::Leaf(id)
    }

    /// A list node.
    pub fn list(children: impl IntoIterator<Item = Self>) -> Self {
        Self::List(children.into_iter().collect())
    }

    /// A map node.
    pub fn map<K: Into<String>>(children: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Map(children.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Leaf ids in traversal order, including repeats.
    pub fn leaf_ids(&self) -> Vec<ParameterId> {
        let mut ids = Vec::new();
        self.collect_leaves(&mut ids);
        ids
    }

    fn collect_leaves(&self, ids: &mut Vec<ParameterId>) {
        match self {
            Self::Leaf(id) => ids.push(*id),
            Self::List(children) => children.iter().for_each(|c| c.collect_leaves(ids)),
            Self::Map(children) => children.values().for_each(|c| c.collect_leaves(ids)),
        }
    }
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// Scores a set of parameter values. Supplied by the physical model.
pub trait Objective: Send + Sync + fmt::Debug {
    /// Negative log likelihood of the current parameter values.
    fn nllf(&self, table: &ParameterTable) -> f64;

    /// Number of data points the objective is computed over.
    fn data_points(&self) -> usize;

    /// Serializable form, when the objective has one.
    fn definition(&self) -> Option<ObjectiveDefinition> {
        None
    }
}

/// Serializable objectives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectiveDefinition {
    /// Polynomial least squares.
    Curve(CurveObjective),
}

impl ObjectiveDefinition {
    fn into_objective(self) -> Arc<dyn Objective> {
        match self {
            Self::Curve(curve) => Arc::new(curve),
        }
    }

    fn referenced_ids(&self) -> &[ParameterId] {
        match self {
            Self::Curve(curve) => &curve.coefficients,
        }
    }
}

/// Least-squares fit of `y = c0 + c1 x + c2 x^2 + ...` to data with
/// uncertainties `dy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveObjective {
    /// Abscissa.
    pub x: Vec<f64>,
    /// Measured values.
    pub y: Vec<f64>,
    /// One-sigma uncertainty of each measurement.
    pub dy: Vec<f64>,
    /// Polynomial coefficients, lowest order first.
    pub coefficients: Vec<ParameterId>,
}

impl CurveObjective {
    /// Check that the data columns line up and uncertainties are positive.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.x.len() != self.y.len() || self.x.len() != self.dy.len() {
            return Err(ModelError::Definition(format!(
                "curve data columns differ in length (x={}, y={}, dy={})",
                self.x.len(),
                self.y.len(),
                self.dy.len()
            )));
        }
        if self.dy.iter().any(|d| !(d.is_finite() && *d > 0.0)) {
            return Err(ModelError::Definition(
                "curve uncertainties must be positive and finite".to_owned(),
            ));
        }
        Ok(())
    }

    fn theory(&self, table: &ParameterTable, x: f64) -> f64 {
        // Horner, highest order first.
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, id| acc * x + table.value(*id).unwrap_or(0.0))
    }
}

impl Objective for CurveObjective {
    fn nllf(&self, table: &ParameterTable) -> f64 {
        let sum_sq: f64 = self
            .x
            .iter()
            .zip(&self.y)
            .zip(&self.dy)
            .map(|((x, y), dy)| {
                let residual = (y - self.theory(table, *x)) / dy;
                residual * residual
            })
            .sum();
        0.5 * sum_sq
    }

    fn data_points(&self) -> usize {
        self.x.len()
    }

    fn definition(&self) -> Option<ObjectiveDefinition> {
        Some(ObjectiveDefinition::Curve(self.clone()))
    }
}

// ---------------------------------------------------------------------------
// Problem
// ---------------------------------------------------------------------------

/// A loaded fit problem.
///
/// Cloning is cheap for the objective (shared) and copies the parameter
/// values, which is how a fit worker gets a private working copy.
#[derive(Debug, Clone)]
pub struct Problem {
    name: String,
    table: ParameterTable,
    root: ParameterNode,
    objective: Arc<dyn Objective>,
    free: Vec<ParameterId>,
    nllf: f64,
}

impl Problem {
    /// Build a problem, checking that every leaf refers to a known parameter.
    pub fn new(
        name: impl Into<String>,
        table: ParameterTable,
        root: ParameterNode,
        objective: Arc<dyn Objective>,
    ) -> Result<Self, ModelError> {
        if let Some(missing) = root.leaf_ids().into_iter().find(|id| !table.contains(*id)) {
            return Err(ModelError::UnknownParameter(missing));
        }
        let mut problem = Self {
            name: name.into(),
            table,
            root,
            objective,
            free: Vec::new(),
            nllf: 0.0,
        };
        problem.refresh();
        Ok(problem)
    }

    /// Problem name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter tree.
    pub const fn root(&self) -> &ParameterNode {
        &self.root
    }

    /// Parameter table.
    pub const fn table(&self) -> &ParameterTable {
        &self.table
    }

    /// Look up a parameter by identity.
    pub fn parameter(&self, id: ParameterId) -> Option<&Parameter> {
        self.table.get(id)
    }

    /// Mutable lookup. Call [`refresh`](Self::refresh) after changing
    /// `fixed` or the value so cached state follows.
    pub fn parameter_mut(&mut self, id: ParameterId) -> Option<&mut Parameter> {
        self.table.get_mut(id)
    }

    /// Ids of the fitted parameters, unique, in tree traversal order.
    pub fn free_parameters(&self) -> &[ParameterId] {
        &self.free
    }

    /// Names of the fitted parameters, in point order.
    pub fn labels(&self) -> Vec<String> {
        self.free
            .iter()
            .filter_map(|id| self.table.get(*id).map(|p| p.name.clone()))
            .collect()
    }

    /// Values of the fitted parameters, in point order.
    pub fn current_point(&self) -> Vec<f64> {
        self.free
            .iter()
            .filter_map(|id| self.table.value(*id))
            .collect()
    }

    /// Bounds of the fitted parameters, in point order. Unbounded
    /// parameters report an infinite range.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.free
            .iter()
            .map(|id| {
                self.table
                    .get(*id)
                    .and_then(|p| p.bounds)
                    .map_or((f64::NEG_INFINITY, f64::INFINITY), Into::into)
            })
            .collect()
    }

    /// Write `point` into the fitted parameters, clipping to bounds.
    ///
    /// Does not recompute the objective; call [`refresh`](Self::refresh).
    pub fn apply(&mut self, point: &[f64]) -> Result<(), ModelError> {
        if point.len() != self.free.len() {
            return Err(ModelError::PointLength {
                expected: self.free.len(),
                actual: point.len(),
            });
        }
        for (id, value) in self.free.iter().zip(point) {
            if let Some(parameter) = self.table.get_mut(*id) {
                parameter.clip_set(*value);
            }
        }
        Ok(())
    }

    /// Recompute the fitted parameter set and the cached objective value.
    pub fn refresh(&mut self) {
        let mut seen = HashSet::new();
        self.free = self
            .root
            .leaf_ids()
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter(|id| self.table.get(*id).is_some_and(Parameter::is_free))
            .collect();
        self.nllf = self.objective.nllf(&self.table);
    }

    /// Objective value at `point`; leaves `point` applied.
    pub fn nllf_at(&mut self, point: &[f64]) -> f64 {
        if self.apply(point).is_err() {
            return f64::INFINITY;
        }
        self.nllf = self.objective.nllf(&self.table);
        self.nllf
    }

    /// Cached objective value (negative log likelihood).
    pub const fn objective(&self) -> f64 {
        self.nllf
    }

    /// Data points minus fitted parameters.
    pub fn degrees_of_freedom(&self) -> f64 {
        self.objective.data_points() as f64 - self.free.len() as f64
    }

    /// Normalized chi-squared of the current values, formatted for display.
    pub fn chisq_str(&self) -> String {
        format::format_chisq(self.nllf, self.degrees_of_freedom())
    }

    /// Serializable form of the problem.
    pub fn definition(&self) -> Result<ProblemDefinition, ModelError> {
        let objective = self
            .objective
            .definition()
            .ok_or_else(|| ModelError::NotSerializable(format!("{:?}", self.objective)))?;
        let mut parameters: Vec<Parameter> = self.table.iter().cloned().collect();
        parameters.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(ProblemDefinition {
            name: self.name.clone(),
            parameters,
            model: self.root.clone(),
            objective,
        })
    }
}

/// On-disk (JSON) form of a [`Problem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDefinition {
    /// Problem name.
    pub name: String,
    /// Every parameter referenced by `model` or `objective`.
    pub parameters: Vec<Parameter>,
    /// Parameter tree.
    pub model: ParameterNode,
    /// Scoring function.
    pub objective: ObjectiveDefinition,
}

impl ProblemDefinition {
    /// Parse a definition from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ModelError> {
        serde_json::from_str(text).map_err(|e| ModelError::Definition(e.to_string()))
    }

    /// Build the problem, validating references and data.
    pub fn into_problem(self) -> Result<Problem, ModelError> {
        let ObjectiveDefinition::Curve(curve) = &self.objective;
        curve.validate()?;
        let table: ParameterTable = self.parameters.into_iter().collect();
        if let Some(missing) = self
            .objective
            .referenced_ids()
            .iter()
            .find(|id| !table.contains(**id))
        {
            return Err(ModelError::UnknownParameter(*missing));
        }
        Problem::new(self.name, table, self.model, self.objective.into_objective())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn line_problem() -> Problem {
        let intercept = Parameter::fitted("intercept", 0.0, -10.0, 10.0).unwrap();
        let slope = Parameter::fitted("slope", 0.0, -10.0, 10.0).unwrap();
        let (a, b) = (intercept.id, slope.id);
        let curve = CurveObjective {
            x: vec![0.0, 1.0, 2.0, 3.0],
            y: vec![1.0, 3.0, 5.0, 7.0],
            dy: vec![1.0; 4],
            coefficients: vec![a, b],
        };
        let table: ParameterTable = [intercept, slope].into_iter().collect();
        let root = ParameterNode::map([(
            "line",
            ParameterNode::list([ParameterNode::leaf(a), ParameterNode::leaf(b)]),
        )]);
        Problem::new("line", table, root, Arc::new(curve)).unwrap()
    }

    #[test]
    fn bounds_reject_inverted_and_non_finite() {
        assert!(Bounds::new(1.0, 0.0).is_err());
        assert!(Bounds::new(f64::NEG_INFINITY, 0.0).is_err());
        assert!(Bounds::new(0.0, 0.0).is_ok());
    }

    #[test]
    fn bounds_relative_position_round_trips() {
        let bounds = Bounds::new(10.0, 20.0).unwrap();
        assert!((bounds.get01(15.0) - 0.5).abs() < 1e-12);
        assert!((bounds.put01(0.25) - 12.5).abs() < 1e-12);
        assert!((bounds.clip(25.0) - 20.0).abs() < 1e-12);
    }

    #[test]
    fn new_parameter_is_fixed_until_ranged() {
        let mut p = Parameter::new("thickness", 50.0);
        assert!(!p.is_free());
        assert!(p.set_range(0.0, 100.0).is_ok());
        assert!(p.is_free());
        p.clip_set(150.0);
        assert!((p.value - 100.0).abs() < 1e-12);
    }

    #[test]
    fn problem_tracks_free_parameters_and_dof() {
        let problem = line_problem();
        assert_eq!(problem.free_parameters().len(), 2);
        assert!((problem.degrees_of_freedom() - 2.0).abs() < 1e-12);
        assert_eq!(problem.labels(), vec!["intercept", "slope"]);
    }

    #[test]
    fn nllf_is_zero_at_exact_solution() {
        let mut problem = line_problem();
        let at_start = problem.objective();
        let at_solution = problem.nllf_at(&[1.0, 2.0]);
        assert!(at_start > 0.0);
        assert!(at_solution.abs() < 1e-12);
        assert_eq!(problem.current_point(), vec![1.0, 2.0]);
    }

    #[test]
    fn apply_rejects_wrong_length() {
        let mut problem = line_problem();
        assert_eq!(
            problem.apply(&[1.0]),
            Err(ModelError::PointLength {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn fixing_a_parameter_shrinks_the_point_after_refresh() {
        let mut problem = line_problem();
        let slope = problem.free_parameters().get(1).copied();
        if let Some(p) = slope.and_then(|id| problem.parameter_mut(id)) {
            p.fixed = true;
        }
        problem.refresh();
        assert_eq!(problem.free_parameters().len(), 1);
        assert_eq!(problem.current_point().len(), 1);
    }

    #[test]
    fn unknown_leaf_is_rejected() {
        let root = ParameterNode::leaf(ParameterId::new());
        let curve = CurveObjective {
            x: Vec::new(),
            y: Vec::new(),
            dy: Vec::new(),
            coefficients: Vec::new(),
        };
        let result = Problem::new("bad", ParameterTable::new(), root, Arc::new(curve));
        assert!(matches!(result, Err(ModelError::UnknownParameter(_))));
    }

    #[test]
    fn definition_round_trips_through_json() {
        let problem = line_problem();
        let definition = problem.definition().unwrap();
        let text = serde_json::to_string(&definition).unwrap();
        let parsed = ProblemDefinition::from_json(&text).unwrap();
        assert_eq!(parsed, definition);
        let rebuilt = parsed.into_problem().unwrap();
        assert_eq!(rebuilt.free_parameters(), problem.free_parameters());
    }

    #[test]
    fn mismatched_curve_columns_are_rejected() {
        let c = Parameter::new("c", 1.0);
        let definition = ProblemDefinition {
            name: String::from("bad"),
            model: ParameterNode::leaf(c.id),
            objective: ObjectiveDefinition::Curve(CurveObjective {
                x: vec![0.0, 1.0],
                y: vec![0.0],
                dy: vec![1.0, 1.0],
                coefficients: vec![c.id],
            }),
            parameters: vec![c],
        };
        assert!(matches!(
            definition.into_problem(),
            Err(ModelError::Definition(_))
        ));
    }

    #[test]
    fn bundled_demo_problem_loads() {
        let text = include_str!("../../../demos/quadratic.json");
        let problem = ProblemDefinition::from_json(text)
            .unwrap()
            .into_problem()
            .unwrap();
        assert_eq!(problem.name(), "quadratic");
        assert_eq!(problem.labels(), ["c0", "c1", "c2"]);
        assert!((problem.degrees_of_freedom() - 3.0).abs() < 1e-12);
    }
}
