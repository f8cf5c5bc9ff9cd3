//! Read-mostly routes: director info, locks, releases, stemcells and
//! orphaned disks.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use director_core::{codes, DirectorError};
use director_jobs::DeleteOrphanDisksArgs;
use director_lock::LockInfo;
use director_state::{OrphanDisk, Stemcell};
use director_tasks::NewTask;
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::Identity;
use crate::error::ApiResult;
use crate::tasks::task_redirect;
use crate::ApiState;

/// GET /info
///
/// Unauthenticated. Reports the caller when identity headers are present.
pub async fn info(State(state): State<ApiState>, headers: HeaderMap) -> Json<Value> {
    let user = Identity::from_headers(&headers).map(|i| i.username);
    Json(json!({
        "name": state.config.name,
        "version": env!("CARGO_PKG_VERSION"),
        "user": user,
        "cpi": state.config.cpi.kind,
        "features": {
            "create_swap_delete": state.config.enable_create_swap_delete,
        },
    }))
}

/// GET /locks
pub async fn list_locks(State(state): State<ApiState>) -> ApiResult<Json<Vec<LockInfo>>> {
    Ok(Json(state.locks.list_locks()?))
}

#[derive(Debug, Serialize)]
pub struct ReleaseView {
    pub name: String,
    pub versions: Vec<ReleaseVersionView>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseVersionView {
    pub version: String,
    pub jobs: Vec<String>,
    /// Whether any deployment's manifest references this version.
    pub currently_deployed: bool,
}

/// GET /releases
pub async fn list_releases(State(state): State<ApiState>) -> ApiResult<Json<Vec<ReleaseView>>> {
    let deployed: Vec<(String, String)> = state
        .store
        .list_deployments()?
        .iter()
        .flat_map(|d| d.manifest["releases"].as_array().cloned().unwrap_or_default())
        .filter_map(|r| Some((r["name"].as_str()?.to_string(), r["version"].as_str()?.to_string())))
        .collect();

    let mut by_name: BTreeMap<String, Vec<ReleaseVersionView>> = BTreeMap::new();
    for release in state.store.list_releases()? {
        let currently_deployed = deployed
            .iter()
            .any(|(name, version)| *name == release.name && *version == release.version);
        by_name.entry(release.name.clone()).or_default().push(ReleaseVersionView {
            version: release.version,
            jobs: release.jobs.into_iter().map(|j| j.name).collect(),
            currently_deployed,
        });
    }
    Ok(Json(
        by_name
            .into_iter()
            .map(|(name, versions)| ReleaseView { name, versions })
            .collect(),
    ))
}

/// GET /stemcells
pub async fn list_stemcells(State(state): State<ApiState>) -> ApiResult<Json<Vec<Stemcell>>> {
    Ok(Json(state.store.list_stemcells()?))
}

/// GET /disks
pub async fn list_orphan_disks(State(state): State<ApiState>) -> ApiResult<Json<Vec<OrphanDisk>>> {
    Ok(Json(state.store.list_orphan_disks()?))
}

/// DELETE /disks/{cid}
pub async fn delete_orphan_disk(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(cid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.store.get_orphan_disk(&cid)?.is_none() {
        return Err(DirectorError::not_found(
            codes::RESOURCE_NOT_FOUND,
            format!("Orphan disk '{cid}' not found"),
        )
        .into());
    }
    let args = DeleteOrphanDisksArgs { cids: vec![cid.clone()] };
    let task = state.queue.enqueue(NewTask {
        username: identity.username,
        job_type: director_jobs::delete_orphan_disks::JOB_TYPE.to_string(),
        description: format!("delete orphan disk {cid}"),
        args: serde_json::to_value(&args)?,
        ..Default::default()
    })?;
    Ok(task_redirect(&task))
}
