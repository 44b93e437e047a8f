//! Fit problem model, fitting algorithms and the background job machinery
//! for the Fitview server.
//!
//! Everything here is independent of the transport: the server crate wires
//! these pieces to HTTP and `WebSocket` clients.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `fitview-config.yaml` into
//!   strongly-typed structs.
//! - [`format`] -- Significant-digit rounding and `%g` style formatting.
//! - [`model`] -- Parameters, the parameter tree, objectives and [`Problem`].
//! - [`flatten`] -- Parameter tree to de-duplicated display records.
//! - [`fitters`] -- [`Fitter`] trait, registry and built-in algorithms.
//! - [`abort`] -- Cancellation flag shared with a worker thread.
//! - [`bridge`] -- Worker to event loop channel and ordered dispatcher.
//! - [`fit_thread`] -- Starts and drives a fit job on its own thread.
//!
//! [`Problem`]: model::Problem
//! [`Fitter`]: fitters::Fitter

pub mod abort;
pub mod bridge;
pub mod config;
pub mod fit_thread;
pub mod fitters;
pub mod flatten;
pub mod format;
pub mod model;
