//! Shared type definitions for the Fitview fit-job coordinator.
//!
//! This crate is the single source of truth for everything that crosses
//! the wire between the server and its clients. Types defined here flow
//! downstream to `TypeScript` via `ts-rs` for the web client.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for parameters, jobs and sessions
//! - [`topics`] -- Topic names and retained topic records
//! - [`parameters`] -- Flattened parameter records
//! - [`events`] -- Events emitted by a running fit job
//! - [`fitters`] -- Fitter descriptions and options
//! - [`float`] -- JSON encoding of possibly infinite floats

pub mod events;
pub mod fitters;
pub mod float;
pub mod ids;
pub mod parameters;
pub mod topics;

// Re-export all public types at crate root for convenience.
pub use events::{
    ConvergenceRow, FitCompletion, FitEvent, FitOutcome, ProgressUpdate, UncertaintySummary,
};
pub use fitters::{ActiveFit, FitterInfo, FitterOptions};
pub use ids::{JobId, ParameterId, SessionId};
pub use parameters::ParameterRecord;
pub use topics::{Topic, TopicRecord, UnknownTopic};
