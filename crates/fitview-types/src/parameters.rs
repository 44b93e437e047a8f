//! Display-oriented parameter records.
//!
//! A [`ParameterRecord`] is the flattened view of one tunable parameter
//! sent to clients. It is recomputed on every query and never persisted.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::ParameterId;

/// Flattened, de-duplicated view of one tunable parameter.
///
/// A parameter referenced from several places in a model ("linked")
/// produces a single record whose `paths` lists every occurrence in the
/// order the traversal met them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ParameterRecord {
    /// Stable identity of the parameter.
    pub id: ParameterId,
    /// Human-readable name.
    pub name: String,
    /// Structural paths at which the parameter occurs, e.g. `sample[0].thickness`.
    pub paths: Vec<String>,
    /// Current value rounded and formatted to six significant digits.
    pub value_str: String,
    /// Whether the parameter can take part in a fit.
    pub fittable: bool,
    /// Whether the parameter is currently held constant.
    pub fixed: bool,
    /// Whether the value can be set directly (not derived).
    pub writable: bool,
    /// Position of the value within its bounds, in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub value01: Option<f64>,
    /// Lower bound, formatted like `value_str`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub min_str: Option<String>,
    /// Upper bound, formatted like `value_str`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub max_str: Option<String>,
}

impl ParameterRecord {
    /// Whether the record takes part in a fit: fittable and not fixed.
    pub const fn is_free(&self) -> bool {
        self.fittable && !self.fixed
    }
}
