//! HTTP and `WebSocket` server for the Fitview fit-job coordinator.
//!
//! This crate wires the fit machinery of `fitview-core` to remote clients:
//!
//! - **`WebSocket` endpoint** (`/ws`) pushing topic records and
//!   `fit_progress` events, and answering RPC requests
//! - **REST endpoints** for every operation, plus `POST /api/rpc`
//! - **Fit event handlers** that apply worker events to the loaded problem
//!   and publish the resulting topic updates
//!
//! # Architecture
//!
//! [`ServerState`] owns the topic store, the loaded problem and the active
//! job. Fit workers run on their own threads and report through the event
//! bridge; a single dispatcher task applies their events in order via
//! [`fit_events::FitEventHandler`]. Clients read topics through a
//! broadcast channel with automatic lag handling.

pub mod error;
pub mod fit_events;
pub mod handlers;
pub mod operations;
pub mod router;
pub mod server;
pub mod sessions;
pub mod state;
pub mod topics;
pub mod ws;

// Re-export primary types for convenience.
pub use error::ServerError;
pub use operations::Operation;
pub use router::build_router;
pub use server::{LifecycleError, shutdown, start_server};
pub use state::ServerState;
