//! Fitter descriptions exposed to clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Algorithm options keyed by setting name (`steps`, `pop`, `ftol`, ...).
pub type FitterOptions = BTreeMap<String, serde_json::Value>;

/// Display name and default settings of one fitter.
///
/// `get_fitter_defaults` returns a map of fitter id to this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FitterInfo {
    /// Human-readable algorithm name.
    pub name: String,
    /// Default option values.
    #[ts(type = "Record<string, unknown>")]
    pub settings: FitterOptions,
}

/// Payload of the `fit_active` topic while a fit is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ActiveFit {
    /// Id of the running fitter.
    pub fitter_id: String,
    /// Options the fit was started with, merged over the defaults.
    #[ts(type = "Record<string, unknown>")]
    pub options: FitterOptions,
    /// Expected number of steps, used for progress bars.
    pub num_steps: u64,
}
