//! Task routes: listing, lookup, cancellation and output streams.

use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use director_core::{codes, DirectorError};
use director_state::{OutputStream, Task, TaskState};
use director_tasks::{read_output, ByteRange, TaskFilter};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::ApiState;

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskView {
    pub id: u64,
    pub state: String,
    pub description: String,
    /// Creation time, epoch seconds.
    pub timestamp: u64,
    pub started_at: Option<u64>,
    pub result: Option<String>,
    pub user: String,
    pub deployment: Option<String>,
    pub context_id: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            state: task.state.as_str().to_string(),
            description: task.description.clone(),
            timestamp: task.created_at / 1000,
            started_at: task.started_at.map(|ms| ms / 1000),
            result: task.result.clone(),
            user: task.username.clone(),
            deployment: task.deployment.clone(),
            context_id: task.context_id.clone(),
        }
    }
}

/// `302 Found` pointing at the task, the reply to every task-creating request.
pub fn task_redirect(task: &Task) -> Response {
    (
        StatusCode::FOUND,
        [(LOCATION, format!("/tasks/{}", task.id))],
        Json(TaskView::from(task)),
    )
        .into_response()
}

fn not_found(id: u64) -> ApiError {
    DirectorError::TaskNotFound(id).into()
}

/// The task, if the caller may see it. Hidden tasks read as missing.
fn visible_task(state: &ApiState, identity: &Identity, id: u64) -> ApiResult<Task> {
    let task = state.queue.manager().find_task(id)?;
    if identity.can_see_task(&task.teams) {
        Ok(task)
    } else {
        Err(not_found(id))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Comma separated states, e.g. `queued,processing`.
    pub state: Option<String>,
    pub deployment: Option<String>,
    pub context_id: Option<String>,
    pub limit: Option<usize>,
}

/// GET /tasks
pub async fn list_tasks(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<TaskView>>> {
    let states = params
        .state
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    TaskState::parse(s).ok_or_else(|| {
                        ApiError::from(DirectorError::validation(
                            codes::VALIDATION_INVALID_VALUE,
                            format!("Unknown task state '{s}'"),
                        ))
                    })
                })
                .collect::<ApiResult<Vec<_>>>()
        })
        .transpose()?;
    let filter = TaskFilter {
        states,
        deployment: params.deployment,
        context_id: params.context_id,
        teams: (!identity.can_read_all()).then(|| identity.read_teams()),
        limit: params.limit,
        ..Default::default()
    };
    let tasks = state.queue.manager().select(&filter)?;
    Ok(Json(tasks.iter().map(TaskView::from).collect()))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
) -> ApiResult<Json<TaskView>> {
    let task = visible_task(&state, &identity, id)?;
    Ok(Json(TaskView::from(&task)))
}

/// DELETE /tasks/{id}
pub async fn cancel_task(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    let task = visible_task(&state, &identity, id)?;
    if !identity.can_cancel_task(&task.teams) {
        return Err(DirectorError::Unauthorized(format!(
            "User '{}' is not authorized to cancel task {id}",
            identity.username
        ))
        .into());
    }
    state.queue.manager().cancel(id)?;
    info!(task_id = id, user = %identity.username, "task cancel requested");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct OutputParams {
    #[serde(rename = "type", default = "default_stream")]
    pub stream: String,
}

fn default_stream() -> String {
    OutputStream::Result.as_str().to_string()
}

/// GET /tasks/{id}/output?type=event|result|debug
///
/// Honors `Range: bytes=...` with `206 Partial Content`.
pub async fn task_output(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<u64>,
    Query(params): Query<OutputParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    visible_task(&state, &identity, id)?;
    let stream = OutputStream::parse(&params.stream).ok_or_else(|| {
        DirectorError::validation(
            codes::VALIDATION_INVALID_VALUE,
            format!("Unknown output type '{}'", params.stream),
        )
    })?;

    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse_header);
    let Some(slice) = read_output(&state.store, id, stream, range)? else {
        return Ok(StatusCode::RANGE_NOT_SATISFIABLE.into_response());
    };

    let content_type = [(CONTENT_TYPE, "text/plain")];
    if range.is_none() || slice.bytes.is_empty() {
        return Ok((StatusCode::OK, content_type, slice.bytes).into_response());
    }
    let content_range = format!("bytes {}-{}/{}", slice.range.start, slice.range.end - 1, slice.total);
    Ok((
        StatusCode::PARTIAL_CONTENT,
        content_type,
        [(CONTENT_RANGE, content_range)],
        slice.bytes,
    )
        .into_response())
}
