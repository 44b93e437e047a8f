//! Error types for the Fitview server.
//!
//! [`ServerError`] unifies every operation failure into a single enum. It
//! converts into an Axum HTTP response via
//! [`IntoResponse`](axum::response::IntoResponse) for REST callers, and into
//! a JSON error object for `WebSocket` RPC replies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fitview_core::fit_thread::StartError;
use fitview_core::model::ModelError;
use fitview_types::{ParameterId, UnknownTopic};

/// Errors that can occur while serving an operation.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The operation needs a loaded problem.
    #[error("no problem loaded")]
    NoProblem,

    /// The problem has nothing to fit.
    #[error("problem has no fittable parameters")]
    NoFittableParameters,

    /// A fit is already running; the running job is untouched.
    #[error("Can't start fit, a fit is already running")]
    AlreadyRunning,

    /// The operation would modify the problem while a fit is running.
    #[error("not allowed while a fit is running")]
    FitActive,

    /// The topic name is not one the server publishes on.
    #[error("{0}")]
    UnknownTopic(#[from] UnknownTopic),

    /// No parameter has the given id.
    #[error("parameter {0} not found")]
    UnknownParameter(ParameterId),

    /// No fitter is registered under the given id.
    #[error("unknown fitter: {0}")]
    UnknownFitter(String),

    /// The RPC event name does not name an operation.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// The request was malformed or had invalid arguments.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A value could not be encoded (for example NaN).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading or writing a problem file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status used when the error is returned over REST.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::UnknownTopic(_) | Self::UnknownParameter(_) | Self::UnknownOperation(_) => {
                StatusCode::NOT_FOUND
            }
            Self::UnknownFitter(_) | Self::InvalidRequest(_) | Self::NoFittableParameters => {
                StatusCode::BAD_REQUEST
            }
            Self::NoProblem | Self::AlreadyRunning | Self::FitActive => StatusCode::CONFLICT,
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoProblem => "no_problem",
            Self::NoFittableParameters => "no_fittable_parameters",
            Self::AlreadyRunning => "already_running",
            Self::FitActive => "fit_active",
            Self::UnknownTopic(_) => "unknown_topic",
            Self::UnknownParameter(_) => "unknown_parameter",
            Self::UnknownFitter(_) => "unknown_fitter",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    /// JSON body shared by REST responses and RPC replies.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": self.status().as_u16(),
        })
    }
}

impl From<StartError> for ServerError {
    fn from(error: StartError) -> Self {
        match error {
            StartError::UnknownFitter(id) => Self::UnknownFitter(id),
            StartError::NoFittableParameters => Self::NoFittableParameters,
            StartError::Spawn { source } => Self::Internal(format!("failed to spawn fit thread: {source}")),
        }
    }
}

impl From<ModelError> for ServerError {
    fn from(error: ModelError) -> Self {
        match error {
            ModelError::UnknownParameter(id) => Self::UnknownParameter(id),
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), axum::Json(self.to_json())).into_response()
    }
}
