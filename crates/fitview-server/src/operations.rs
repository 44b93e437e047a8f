//! Client operations.
//!
//! Every request a client can make, whether over `WebSocket` RPC or REST,
//! is parsed into an [`Operation`] and run by [`Operation::execute`]. The
//! RPC envelope is `{id, event, args}` in and `{id, ok, result | error}`
//! out; a missing or `null` `args` is treated as `{}`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fitview_core::fit_thread::{JobHandle, start_fit};
use fitview_core::flatten::flatten;
use fitview_core::format::{VALUE_PRECISION, nice};
use fitview_core::model::{Bounds, ModelError, ProblemDefinition};
use fitview_types::{FitterOptions, ParameterId, ParameterRecord, Topic};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::ServerError;
use crate::state::ServerState;
use crate::topics::PushEvent;

/// Extension of problem files written by `save_problem_file`.
pub const PROBLEM_EXTENSION: &str = "json";

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Arguments of `start_fit_thread`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartFitArgs {
    /// Registered fitter id.
    pub fitter_id: String,
    /// Options laid over the fitter defaults.
    #[serde(default)]
    pub options: Option<FitterOptions>,
}

/// Arguments of `publish`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishArgs {
    /// Topic name.
    pub topic: String,
    /// Payload to retain and broadcast.
    #[serde(default)]
    pub message: Value,
}

/// Arguments of `get_parameters`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct GetParametersArgs {
    /// Only parameters that are fittable and not fixed.
    #[serde(default)]
    pub only_fittable: bool,
}

/// Parameter property targeted by `set_parameter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterProperty {
    /// Relative position within the bounds.
    #[serde(rename = "value01")]
    Value01,
    /// Absolute value.
    Value,
    /// Lower bound.
    Min,
    /// Upper bound.
    Max,
    /// Whether the parameter is held constant.
    Fixed,
}

/// Arguments of `set_parameter`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetParameterArgs {
    /// Parameter to change.
    pub parameter_id: ParameterId,
    /// Property to change.
    pub property: ParameterProperty,
    /// New value: a number (or numeric string), or a boolean for `fixed`.
    pub value: Value,
}

/// Arguments of `get_topic_messages`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TopicMessagesArgs {
    /// Topic name; no topic yields an empty list.
    #[serde(default)]
    pub topic: Option<String>,
    /// Most recent records to return; all when absent.
    #[serde(default)]
    pub max_num: Option<usize>,
}

/// Arguments of `load_problem_file`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadProblemArgs {
    /// Directory components.
    pub pathlist: Vec<String>,
    /// File name within the directory.
    pub filename: String,
}

/// Arguments of `save_problem_file`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SaveProblemArgs {
    /// Target directory; defaults to the loaded problem's directory.
    #[serde(default)]
    pub pathlist: Option<Vec<String>>,
    /// Target name, whose stem is kept; defaults to the loaded file name.
    #[serde(default)]
    pub filename: Option<String>,
    /// Replace an existing file.
    #[serde(default)]
    pub overwrite: bool,
}

/// Arguments of `get_dirlisting`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DirListingArgs {
    /// Directory components; empty lists the working directory.
    #[serde(default)]
    pub pathlist: Vec<String>,
}

/// One file of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the platform reports one.
    pub modified: Option<DateTime<Utc>>,
}

/// Contents of one directory, each list sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirListing {
    /// Names of child directories.
    pub subfolders: Vec<String>,
    /// Everything that is not a directory.
    pub files: Vec<FileEntry>,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// The closed set of client operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Start a fit on a worker thread.
    StartFitThread(StartFitArgs),
    /// Request cancellation of the running fit.
    StopFit,
    /// Publish a client message on a topic.
    Publish(PublishArgs),
    /// Flattened parameter records.
    GetParameters(GetParametersArgs),
    /// Change one property of one parameter.
    SetParameter(SetParameterArgs),
    /// Retained records of a topic.
    GetTopicMessages(TopicMessagesArgs),
    /// Display name and defaults of every fitter.
    GetFitterDefaults,
    /// Load a problem definition from disk.
    LoadProblemFile(LoadProblemArgs),
    /// Save the loaded problem to disk.
    SaveProblemFile(SaveProblemArgs),
    /// Serialized definition of the loaded problem.
    GetModel,
    /// Directory of the loaded problem.
    GetCurrentPathlist,
    /// Subfolders and files of a directory.
    GetDirlisting(DirListingArgs),
    /// Stored convergence history.
    GetConvergence,
    /// Stored uncertainty summary.
    GetUncertainty,
    /// Active job and last result.
    GetFitStatus,
}

impl Operation {
    /// Parse an operation from its event name and arguments.
    pub fn parse(event: &str, args: Value) -> Result<Self, ServerError> {
        let args = if args.is_null() {
            Value::Object(Map::new())
        } else {
            args
        };
        let operation = match event {
            "start_fit_thread" => Self::StartFitThread(parse_args(args)?),
            "stop_fit" => Self::StopFit,
            "publish" => Self::Publish(parse_args(args)?),
            "get_parameters" => Self::GetParameters(parse_args(args)?),
            "set_parameter" => Self::SetParameter(parse_args(args)?),
            "get_topic_messages" => Self::GetTopicMessages(parse_args(args)?),
            "get_fitter_defaults" => Self::GetFitterDefaults,
            "load_problem_file" => Self::LoadProblemFile(parse_args(args)?),
            "save_problem_file" => Self::SaveProblemFile(parse_args(args)?),
            "get_model" => Self::GetModel,
            "get_current_pathlist" => Self::GetCurrentPathlist,
            "get_dirlisting" => Self::GetDirlisting(parse_args(args)?),
            "get_convergence" => Self::GetConvergence,
            "get_uncertainty" => Self::GetUncertainty,
            "get_fit_status" => Self::GetFitStatus,
            other => return Err(ServerError::UnknownOperation(other.to_owned())),
        };
        Ok(operation)
    }

    /// Event name of the operation.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartFitThread(_) => "start_fit_thread",
            Self::StopFit => "stop_fit",
            Self::Publish(_) => "publish",
            Self::GetParameters(_) => "get_parameters",
            Self::SetParameter(_) => "set_parameter",
            Self::GetTopicMessages(_) => "get_topic_messages",
            Self::GetFitterDefaults => "get_fitter_defaults",
            Self::LoadProblemFile(_) => "load_problem_file",
            Self::SaveProblemFile(_) => "save_problem_file",
            Self::GetModel => "get_model",
            Self::GetCurrentPathlist => "get_current_pathlist",
            Self::GetDirlisting(_) => "get_dirlisting",
            Self::GetConvergence => "get_convergence",
            Self::GetUncertainty => "get_uncertainty",
            Self::GetFitStatus => "get_fit_status",
        }
    }

    /// Run the operation and return its JSON result.
    pub async fn execute(self, state: &ServerState) -> Result<Value, ServerError> {
        debug!(operation = self.name(), "Executing operation");
        match self {
            Self::StartFitThread(args) => start_fit_thread(state, args).await,
            Self::StopFit => Ok(Value::Bool(stop_fit(state).await)),
            Self::Publish(args) => publish(state, args).await,
            Self::GetParameters(args) => to_json(&get_parameters(state, args).await),
            Self::SetParameter(args) => set_parameter(state, args).await.map(|()| Value::Null),
            Self::GetTopicMessages(args) => get_topic_messages(state, args).await,
            Self::GetFitterDefaults => to_json(&state.fitters.defaults()),
            Self::LoadProblemFile(args) => load_problem_file(state, args).await,
            Self::SaveProblemFile(args) => save_problem_file(state, args).await,
            Self::GetModel => get_model(state).await,
            Self::GetCurrentPathlist => {
                let problem = state.problem.read().await;
                to_json(&problem.as_ref().map(|loaded| &loaded.pathlist))
            }
            Self::GetDirlisting(args) => to_json(&get_dirlisting(args).await?),
            Self::GetConvergence => to_json(&state.fitting.lock().await.convergence),
            Self::GetUncertainty => to_json(&state.fitting.lock().await.uncertainty),
            Self::GetFitStatus => get_fit_status(state).await,
        }
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ServerError> {
    serde_json::from_value(args).map_err(|e| ServerError::InvalidRequest(e.to_string()))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value, ServerError> {
    Ok(serde_json::to_value(value)?)
}

// ---------------------------------------------------------------------------
// RPC envelope
// ---------------------------------------------------------------------------

/// An RPC request frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcRequest {
    /// Client-chosen correlation id, echoed in the reply.
    #[serde(default)]
    pub id: Value,
    /// Operation name.
    pub event: String,
    /// Operation arguments.
    #[serde(default)]
    pub args: Value,
}

/// An RPC reply frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcReply {
    /// Correlation id from the request.
    pub id: Value,
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error body on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcReply {
    /// Wrap an operation result.
    pub fn from_result(id: Value, result: Result<Value, ServerError>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                id,
                ok: false,
                result: None,
                error: Some(e.to_json()),
            },
        }
    }
}

/// Parse and run one RPC request.
pub async fn dispatch(state: &ServerState, request: RpcRequest) -> RpcReply {
    let result = match Operation::parse(&request.event, request.args) {
        Ok(operation) => operation.execute(state).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        debug!(event = %request.event, error = %e, "Operation failed");
    }
    RpcReply::from_result(request.id, result)
}

// ---------------------------------------------------------------------------
// Fit control
// ---------------------------------------------------------------------------

async fn start_fit_thread(state: &ServerState, args: StartFitArgs) -> Result<Value, ServerError> {
    let mut fitting = state.fitting.lock().await;
    if fitting.active.is_some() {
        state
            .log("Can't start fit, a fit is already running...", None)
            .await;
        return Err(ServerError::AlreadyRunning);
    }

    let options = args.options.unwrap_or_default();
    let job = {
        let problem = state.problem.read().await;
        let Some(loaded) = problem.as_ref() else {
            state
                .log("Error: Can't start fit if no problem loaded", None)
                .await;
            return Err(ServerError::NoProblem);
        };
        start_fit(
            &loaded.problem,
            &state.fitters,
            &args.fitter_id,
            &options,
            state.cadence(),
            state.events(),
        )?
    };

    let active = job.active.clone();
    let job_id = job.job_id;
    fitting.convergence = None;
    fitting.uncertainty = None;
    fitting.active = Some(job);

    // Published before the lock is released so the job's own terminal
    // `fit_active` can never precede this one.
    state.topics.emit(PushEvent::FitProgress, json!({})).await;
    let payload = serde_json::to_value(&active)?;
    state.topics.publish(Topic::FitActive, payload).await;
    let pretty = serde_json::to_string_pretty(&active.options)?;
    state
        .log(pretty, Some(&format!("starting fitter {}", active.fitter_id)))
        .await;
    drop(fitting);

    Ok(json!({
        "job_id": job_id,
        "fitter_id": active.fitter_id,
        "options": active.options,
        "num_steps": active.num_steps,
    }))
}

/// Request cancellation of the running fit. Returns `false` when there is
/// nothing to stop or a stop was already requested.
pub async fn stop_fit(state: &ServerState) -> bool {
    state
        .fitting
        .lock()
        .await
        .active
        .as_ref()
        .is_some_and(JobHandle::stop)
}

async fn get_fit_status(state: &ServerState) -> Result<Value, ServerError> {
    let fitting = state.fitting.lock().await;
    let active = fitting.active.as_ref().map(|job| {
        json!({
            "job_id": job.job_id,
            "fitter_id": job.active.fitter_id,
            "options": job.active.options,
            "num_steps": job.active.num_steps,
            "started_at": job.started_at,
            "stopping": job.is_stopping(),
        })
    });
    Ok(json!({
        "active": active,
        "last_result": serde_json::to_value(&fitting.last_result)?,
    }))
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

async fn publish(state: &ServerState, args: PublishArgs) -> Result<Value, ServerError> {
    let topic: Topic = args.topic.parse()?;
    let record = state.topics.publish(topic, args.message).await;
    to_json(&record)
}

async fn get_topic_messages(
    state: &ServerState,
    args: TopicMessagesArgs,
) -> Result<Value, ServerError> {
    let Some(name) = args.topic else {
        return Ok(Value::Array(Vec::new()));
    };
    let topic: Topic = name.parse()?;
    to_json(&state.topics.messages(topic, args.max_num).await)
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Flattened parameter records of the loaded problem, empty when none is
/// loaded.
pub async fn get_parameters(state: &ServerState, args: GetParametersArgs) -> Vec<ParameterRecord> {
    let problem = state.problem.read().await;
    problem.as_ref().map_or_else(Vec::new, |loaded| {
        flatten(
            loaded.problem.root(),
            loaded.problem.table(),
            args.only_fittable,
        )
    })
}

async fn set_parameter(state: &ServerState, args: SetParameterArgs) -> Result<(), ServerError> {
    let fitting = state.fitting.lock().await;
    if fitting.active.is_some() {
        return Err(ServerError::FitActive);
    }

    let model_changed = {
        let mut problem = state.problem.write().await;
        let loaded = problem.as_mut().ok_or(ServerError::NoProblem)?;
        let id = args.parameter_id;
        let parameter = loaded
            .problem
            .parameter_mut(id)
            .ok_or(ServerError::UnknownParameter(id))?;

        let mut model_changed = false;
        match args.property {
            ParameterProperty::Value01 => {
                let bounds = parameter.bounds.ok_or(ModelError::NoBounds(id))?;
                require_writable(parameter.writable(), id)?;
                let value = bounds.put01(number(&args.value)?);
                parameter.clip_set(nice(value, VALUE_PRECISION));
            }
            ParameterProperty::Value => {
                require_writable(parameter.writable(), id)?;
                parameter.clip_set(nice(number(&args.value)?, VALUE_PRECISION));
            }
            ParameterProperty::Min => {
                let bounds = parameter.bounds.ok_or(ModelError::NoBounds(id))?;
                parameter.bounds = Some(Bounds::new(number(&args.value)?, bounds.hi())?);
                parameter.clip_set(parameter.value);
            }
            ParameterProperty::Max => {
                let bounds = parameter.bounds.ok_or(ModelError::NoBounds(id))?;
                parameter.bounds = Some(Bounds::new(bounds.lo(), number(&args.value)?)?);
                parameter.clip_set(parameter.value);
            }
            ParameterProperty::Fixed => {
                let fixed = boolean(&args.value)?;
                if parameter.fittable && parameter.fixed != fixed {
                    if !fixed && parameter.bounds.is_none() {
                        return Err(ModelError::NoBounds(id).into());
                    }
                    parameter.fixed = fixed;
                    model_changed = true;
                }
            }
        }
        loaded.problem.refresh();
        model_changed
    };
    drop(fitting);

    if model_changed {
        state
            .topics
            .publish(Topic::UpdateModel, Value::Bool(true))
            .await;
    }
    state
        .topics
        .publish(Topic::UpdateParameters, Value::Bool(true))
        .await;
    Ok(())
}

fn require_writable(writable: bool, id: ParameterId) -> Result<(), ServerError> {
    if writable {
        Ok(())
    } else {
        Err(ServerError::InvalidRequest(format!(
            "parameter {id} is derived and cannot be set"
        )))
    }
}

/// A finite number given as a JSON number or numeric string.
fn number(value: &Value) -> Result<f64, ServerError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| ServerError::InvalidRequest(format!("expected a finite number, got {value}")))
}

/// A boolean given as a JSON bool, number or `"true"`/`"false"`.
fn boolean(value: &Value) -> Result<bool, ServerError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(ServerError::InvalidRequest(format!(
            "expected a boolean, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Problem files
// ---------------------------------------------------------------------------

async fn load_problem_file(state: &ServerState, args: LoadProblemArgs) -> Result<Value, ServerError> {
    let mut fitting = state.fitting.lock().await;
    if fitting.active.is_some() {
        return Err(ServerError::FitActive);
    }

    let path: PathBuf = args.pathlist.iter().chain([&args.filename]).collect();
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PROBLEM_EXTENSION));
    if !is_json {
        return Err(ServerError::InvalidRequest(format!(
            "unsupported problem file {}; expected .{PROBLEM_EXTENSION}",
            path.display()
        )));
    }

    state
        .log(format!("model loading: {}", path.display()), None)
        .await;
    let text = tokio::fs::read_to_string(&path).await?;
    let problem = ProblemDefinition::from_json(&text)?.into_problem()?;
    info!(
        path = %path.display(),
        name = problem.name(),
        parameters = problem.table().len(),
        free = problem.free_parameters().len(),
        "Problem loaded"
    );

    state
        .install_problem(problem, args.pathlist.clone(), args.filename.clone())
        .await;
    fitting.convergence = None;
    fitting.uncertainty = None;
    drop(fitting);

    state
        .log(format!("model loaded: {}", path.display()), None)
        .await;
    let source = json!({ "pathlist": args.pathlist, "filename": args.filename });
    state.topics.publish(Topic::ModelLoaded, source.clone()).await;
    state
        .topics
        .publish(Topic::UpdateModel, Value::Bool(true))
        .await;
    state
        .topics
        .publish(Topic::UpdateParameters, Value::Bool(true))
        .await;
    Ok(source)
}

/// Writes `<stem>.json`. Returns the file name, without writing, when the
/// file exists and `overwrite` is off, and `false` once saved.
async fn save_problem_file(state: &ServerState, args: SaveProblemArgs) -> Result<Value, ServerError> {
    let (definition, pathlist, filename) = {
        let problem = state.problem.read().await;
        let loaded = problem.as_ref().ok_or(ServerError::NoProblem)?;
        (
            loaded.problem.definition()?,
            args.pathlist.unwrap_or_else(|| loaded.pathlist.clone()),
            args.filename.unwrap_or_else(|| loaded.filename.clone()),
        )
    };

    let stem = std::path::Path::new(&filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| ServerError::InvalidRequest(format!("invalid file name {filename:?}")))?;
    let save_filename = format!("{stem}.{PROBLEM_EXTENSION}");
    let dir: PathBuf = pathlist.iter().collect();
    let target = dir.join(&save_filename);

    if !args.overwrite && tokio::fs::try_exists(&target).await? {
        debug!(path = %target.display(), "Save needs confirmation");
        return Ok(Value::String(save_filename));
    }

    let serialized = serde_json::to_string(&definition)?;
    tokio::fs::write(&target, serialized).await?;
    info!(path = %target.display(), "Problem saved");
    state
        .log(
            format!("Saved: {save_filename} at path: {}", dir.display()),
            None,
        )
        .await;
    Ok(Value::Bool(false))
}

/// List a directory for file browsing. Symlinks are classified by their
/// target; a dangling link is listed as a file.
pub async fn get_dirlisting(args: DirListingArgs) -> Result<DirListing, ServerError> {
    let dir: PathBuf = if args.pathlist.is_empty() {
        PathBuf::from(".")
    } else {
        args.pathlist.iter().collect()
    };

    let mut listing = DirListing::default();
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = match tokio::fs::metadata(entry.path()).await {
            Ok(metadata) => metadata,
            Err(_) => entry.metadata().await?,
        };
        if metadata.is_dir() {
            listing.subfolders.push(name);
        } else {
            listing.files.push(FileEntry {
                name,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
    }
    listing.subfolders.sort();
    listing.files.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(
        path = %dir.display(),
        subfolders = listing.subfolders.len(),
        files = listing.files.len(),
        "Directory listed"
    );
    Ok(listing)
}

async fn get_model(state: &ServerState) -> Result<Value, ServerError> {
    let problem = state.problem.read().await;
    match problem.as_ref() {
        Some(loaded) => to_json(&loaded.problem.definition()?),
        None => Ok(Value::Null),
    }
}
