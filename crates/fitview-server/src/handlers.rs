//! REST API endpoint handlers.
//!
//! Each handler parses its inputs into an [`Operation`] and runs it, so
//! REST and `WebSocket` RPC share one implementation.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and connection counts |
//! | `GET` | `/api/sessions` | Connected `WebSocket` sessions |
//! | `POST` | `/api/rpc` | Run any operation from an RPC envelope |
//! | `GET` | `/api/parameters` | Flattened parameters (`?only_fittable=`) |
//! | `POST` | `/api/parameters/{id}` | Set one parameter property |
//! | `GET` | `/api/topics/{topic}` | Retained records (`?max_num=`) |
//! | `POST` | `/api/topics/{topic}` | Publish a message |
//! | `GET` | `/api/fitters` | Fitter names and default settings |
//! | `POST` | `/api/fit/start` | Start a fit |
//! | `POST` | `/api/fit/stop` | Stop the running fit |
//! | `GET` | `/api/fit/status` | Active job and last result |
//! | `GET` | `/api/fit/convergence` | Stored convergence history |
//! | `GET` | `/api/fit/uncertainty` | Stored uncertainty summary |
//! | `GET` | `/api/model` | Serialized problem definition |
//! | `GET` | `/api/model/pathlist` | Directory of the loaded problem |
//! | `POST` | `/api/model/load` | Load a problem file |
//! | `POST` | `/api/model/save` | Save the problem file |
//! | `POST` | `/api/files` | List a directory (`{pathlist}`) |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use fitview_types::ParameterId;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ServerError;
use crate::operations::{
    self, DirListingArgs, GetParametersArgs, LoadProblemArgs, Operation, ParameterProperty,
    PublishArgs, RpcRequest, SaveProblemArgs, SetParameterArgs, StartFitArgs, TopicMessagesArgs,
};
use crate::state::ServerState;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Body of `POST /api/parameters/{id}`.
#[derive(Debug, Deserialize)]
pub struct SetParameterBody {
    /// Property to change.
    pub property: ParameterProperty,
    /// New value.
    pub value: Value,
}

/// Query of `GET /api/topics/{topic}`.
#[derive(Debug, Deserialize)]
pub struct TopicQuery {
    /// Most recent records to return.
    pub max_num: Option<usize>,
}

async fn run(state: &ServerState, operation: Operation) -> Result<Json<Value>, ServerError> {
    operation.execute(state).await.map(Json)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Liveness probe with connection counts.
pub async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let fitting = state.fitting.lock().await.active.is_some();
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.count().await,
        "subscribers": state.topics.subscriber_count(),
        "fitting": fitting,
    }))
}

/// List connected sessions.
pub async fn list_sessions(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let sessions = state.sessions.list().await;
    Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

/// Run an operation from an RPC envelope. Operation failures are reported
/// in the reply body, not the HTTP status.
pub async fn rpc(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RpcRequest>,
) -> impl IntoResponse {
    Json(operations::dispatch(&state, request).await)
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Flattened parameter records.
pub async fn get_parameters(
    State(state): State<Arc<ServerState>>,
    Query(args): Query<GetParametersArgs>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetParameters(args)).await
}

/// Set one property of one parameter.
pub async fn set_parameter(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(body): Json<SetParameterBody>,
) -> Result<impl IntoResponse, ServerError> {
    let parameter_id: ParameterId = id
        .parse()
        .map_err(|e| ServerError::InvalidRequest(format!("invalid parameter id {id}: {e}")))?;
    let args = SetParameterArgs {
        parameter_id,
        property: body.property,
        value: body.value,
    };
    run(&state, Operation::SetParameter(args)).await
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Retained records of a topic.
pub async fn get_topic_messages(
    State(state): State<Arc<ServerState>>,
    Path(topic): Path<String>,
    Query(query): Query<TopicQuery>,
) -> Result<impl IntoResponse, ServerError> {
    let args = TopicMessagesArgs {
        topic: Some(topic),
        max_num: query.max_num,
    };
    run(&state, Operation::GetTopicMessages(args)).await
}

/// Publish the request body on a topic.
pub async fn publish(
    State(state): State<Arc<ServerState>>,
    Path(topic): Path<String>,
    Json(message): Json<Value>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::Publish(PublishArgs { topic, message })).await
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

/// Fitter names and default settings.
pub async fn get_fitter_defaults(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetFitterDefaults).await
}

/// Start a fit.
pub async fn start_fit(
    State(state): State<Arc<ServerState>>,
    Json(args): Json<StartFitArgs>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::StartFitThread(args)).await
}

/// Stop the running fit.
pub async fn stop_fit(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::StopFit).await
}

/// Active job and last result.
pub async fn get_fit_status(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetFitStatus).await
}

/// Stored convergence history.
pub async fn get_convergence(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetConvergence).await
}

/// Stored uncertainty summary.
pub async fn get_uncertainty(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetUncertainty).await
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Serialized definition of the loaded problem.
pub async fn get_model(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetModel).await
}

/// Directory of the loaded problem.
pub async fn get_current_pathlist(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetCurrentPathlist).await
}

/// Subfolders and files of a directory.
pub async fn get_dirlisting(
    State(state): State<Arc<ServerState>>,
    Json(args): Json<DirListingArgs>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::GetDirlisting(args)).await
}

/// Load a problem file.
pub async fn load_problem(
    State(state): State<Arc<ServerState>>,
    Json(args): Json<LoadProblemArgs>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::LoadProblemFile(args)).await
}

/// Save the loaded problem.
pub async fn save_problem(
    State(state): State<Arc<ServerState>>,
    Json(args): Json<SaveProblemArgs>,
) -> Result<impl IntoResponse, ServerError> {
    run(&state, Operation::SaveProblemFile(args)).await
}
