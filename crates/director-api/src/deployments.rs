//! Deployment routes: listing, manifests, deploys, deletes, diff preview,
//! instances and resurrection toggles.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use director_changeset::Changeset;
use director_core::manifest::{parse_yaml, CountOrPercent};
use director_core::{codes, DeploymentManifest, DirectorError};
use director_jobs::{
    change_vm_resurrection, resurrection_state, DeleteDeploymentArgs, UpdateDeploymentArgs, CLOUD_CONFIG,
    RUNTIME_CONFIG,
};
use director_state::{Deployment, Instance, StateStore};
use director_tasks::NewTask;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::auth::{check, Identity, Permission};
use crate::error::ApiResult;
use crate::tasks::task_redirect;
use crate::ApiState;

// ── Views ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct NameVersion {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentView {
    pub name: String,
    pub releases: Vec<NameVersion>,
    pub stemcells: Vec<NameVersion>,
    /// `latest`, `outdated` or `none`.
    pub cloud_config: String,
    pub teams: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: String,
    pub job: String,
    pub index: u32,
    pub az: Option<String>,
    pub state: String,
    pub vm_cid: Option<String>,
    pub bootstrap: bool,
    pub resurrection_paused: bool,
}

fn name_versions(manifest: &Value, section: &str, name_keys: &[&str]) -> Vec<NameVersion> {
    manifest[section]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|entry| NameVersion {
                    name: name_keys
                        .iter()
                        .find_map(|k| entry[*k].as_str())
                        .unwrap_or_default()
                        .to_string(),
                    version: match &entry["version"] {
                        Value::String(s) => s.clone(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

fn latest_config_ids(store: &StateStore, kind: &str) -> ApiResult<Vec<u64>> {
    Ok(store.latest_configs(kind)?.into_iter().map(|c| c.id).collect())
}

fn view(deployment: &Deployment, latest_cloud: &[u64]) -> DeploymentView {
    let cloud_config = if deployment.cloud_config_ids.is_empty() {
        "none"
    } else if deployment.cloud_config_ids == latest_cloud {
        "latest"
    } else {
        "outdated"
    };
    DeploymentView {
        name: deployment.name.clone(),
        releases: name_versions(&deployment.manifest, "releases", &["name"]),
        stemcells: name_versions(&deployment.manifest, "stemcells", &["name", "os"]),
        cloud_config: cloud_config.to_string(),
        teams: deployment.teams.clone(),
    }
}

fn instance_view(store: &StateStore, instance: &Instance) -> ApiResult<InstanceView> {
    Ok(InstanceView {
        id: instance.uuid.clone(),
        job: instance.job.clone(),
        index: instance.index,
        az: instance.az.clone(),
        state: instance.state.as_str().to_string(),
        vm_cid: store.active_vm(&instance.uuid)?.map(|vm| vm.cid),
        bootstrap: instance.bootstrap,
        resurrection_paused: instance.resurrection_paused,
    })
}

fn require_deployment(store: &StateStore, name: &str) -> ApiResult<Deployment> {
    store.get_deployment(name)?.ok_or_else(|| {
        DirectorError::not_found(codes::DEPLOYMENT_NOT_FOUND, format!("Deployment '{name}' doesn't exist")).into()
    })
}

// ── Listing ────────────────────────────────────────────────────

/// GET /deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Vec<DeploymentView>>> {
    let latest_cloud = latest_config_ids(&state.store, CLOUD_CONFIG)?;
    let teams = identity.read_teams();
    let views = state
        .store
        .list_deployments()?
        .iter()
        .filter(|d| identity.can_read_all() || d.teams.iter().any(|t| teams.contains(t)))
        .map(|d| view(d, &latest_cloud))
        .collect();
    Ok(Json(views))
}

/// GET /deployments/{deployment}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let deployment = require_deployment(&state.store, &name)?;
    Ok(Json(serde_json::json!({ "manifest": deployment.manifest_text })))
}

/// GET /deployments/{deployment}/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<InstanceView>>> {
    require_deployment(&state.store, &name)?;
    let views = state
        .store
        .list_instances(&name)?
        .iter()
        .map(|i| instance_view(&state.store, i))
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(views))
}

// ── Deploy ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DeployParams {
    #[serde(default)]
    pub recreate: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub canaries: Option<String>,
    pub max_in_flight: Option<String>,
    pub context_id: Option<String>,
}

fn count_or_percent(field: &str, raw: Option<&str>) -> ApiResult<Option<CountOrPercent>> {
    raw.map(|s| {
        CountOrPercent::try_from(Value::String(s.to_string())).map_err(|e| {
            DirectorError::validation(codes::VALIDATION_INVALID_VALUE, format!("Invalid '{field}': {e}")).into()
        })
    })
    .transpose()
}

/// POST /deployments
///
/// The manifest is validated synchronously; an invalid one never creates a task.
pub async fn create_deployment(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<DeployParams>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let (manifest, _) = DeploymentManifest::from_yaml(&body)?;
    let name = manifest.name.clone();
    check(&state.store, &identity, &Permission::DeploymentAdmin(name.clone()))?;

    let teams = match state.store.get_deployment(&name)? {
        Some(existing) => existing.teams,
        None if identity.is_admin() => Vec::new(),
        None => identity.admin_teams(),
    };
    let args = UpdateDeploymentArgs {
        manifest_text: body,
        recreate: params.recreate,
        dry_run: params.dry_run,
        canaries: count_or_percent("canaries", params.canaries.as_deref())?,
        max_in_flight: count_or_percent("max_in_flight", params.max_in_flight.as_deref())?,
        teams: teams.clone(),
    };
    let description = if params.dry_run {
        "create deployment (dry run)"
    } else {
        "create deployment"
    };
    let task = state.queue.enqueue(NewTask {
        username: identity.username.clone(),
        job_type: director_jobs::update_deployment::JOB_TYPE.to_string(),
        description: description.to_string(),
        args: serde_json::to_value(&args)?,
        deployment: Some(name.clone()),
        context_id: params.context_id,
        teams,
    })?;
    info!(deployment = %name, task_id = task.id, user = %identity.username, "deploy queued");
    Ok(task_redirect(&task))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /deployments/{deployment}
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(name): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<impl IntoResponse> {
    let deployment = require_deployment(&state.store, &name)?;
    let args = DeleteDeploymentArgs {
        deployment: name.clone(),
        force: params.force,
    };
    let task = state.queue.enqueue(NewTask {
        username: identity.username.clone(),
        job_type: director_jobs::delete_deployment::JOB_TYPE.to_string(),
        description: format!("delete deployment {name}"),
        args: serde_json::to_value(&args)?,
        deployment: Some(name.clone()),
        teams: deployment.teams,
        ..Default::default()
    })?;
    info!(deployment = %name, task_id = task.id, "delete queued");
    Ok(task_redirect(&task))
}

// ── Diff ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DiffParams {
    #[serde(default = "default_redact")]
    pub redact: bool,
}

fn default_redact() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub context: DiffContext,
    pub diff: Changeset,
}

#[derive(Debug, Serialize)]
pub struct DiffContext {
    pub cloud_config_ids: Vec<u64>,
    pub runtime_config_ids: Vec<u64>,
}

/// POST /deployments/{deployment}/diff
///
/// Compares the submitted manifest with the deployed one without queuing
/// anything. A deployment that does not exist yet diffs against nothing.
pub async fn diff_deployment(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<DiffParams>,
    body: String,
) -> ApiResult<Json<DiffResponse>> {
    let (manifest, new) = DeploymentManifest::from_yaml(&body)?;
    if manifest.name != name {
        return Err(DirectorError::bad_manifest(format!(
            "Manifest name '{}' does not match deployment '{name}'",
            manifest.name
        ))
        .into());
    }
    let old = match state.store.get_deployment(&name)? {
        Some(deployment) => parse_yaml(&deployment.manifest_text)?,
        None => Value::Object(Default::default()),
    };
    Ok(Json(DiffResponse {
        context: DiffContext {
            cloud_config_ids: latest_config_ids(&state.store, CLOUD_CONFIG)?,
            runtime_config_ids: latest_config_ids(&state.store, RUNTIME_CONFIG)?,
        },
        diff: Changeset::diff(&old, &new, params.redact),
    }))
}

// ── Resurrection ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResurrectionRequest {
    /// `on` or `off`.
    pub state: String,
    pub index: Option<String>,
}

/// PUT /deployments/{deployment}/jobs/{job}/resurrection
pub async fn set_resurrection(
    State(state): State<ApiState>,
    Path((name, job)): Path<(String, String)>,
    Json(req): Json<ResurrectionRequest>,
) -> ApiResult<Json<InstanceView>> {
    require_deployment(&state.store, &name)?;
    let instance = resurrection_state(&state.store, &name, &job, req.index.as_deref(), &req.state)?;
    Ok(Json(instance_view(&state.store, &instance)?))
}

#[derive(Debug, Deserialize)]
pub struct ResurrectionPaused {
    pub resurrection_paused: bool,
}

/// PUT /deployments/{deployment}/jobs/{job}/{index}/resurrection
pub async fn set_instance_resurrection(
    State(state): State<ApiState>,
    Path((name, job, index)): Path<(String, String, u32)>,
    Json(req): Json<ResurrectionPaused>,
) -> ApiResult<impl IntoResponse> {
    require_deployment(&state.store, &name)?;
    change_vm_resurrection(&state.store, &name, &job, index, req.resurrection_paused)?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{body_json, request, TestDirector, ADMIN};
    use axum::http::header::LOCATION;

    const CLOUD: &str = r#"
azs: [{name: z1}]
networks: [{name: private, subnets: [{range: 10.0.0.0/24, azs: [z1]}]}]
vm_types: [{name: small}]
"#;

    fn manifest(instances: u32, password: &str) -> String {
        format!(
            r#"
name: app
releases: [{{name: app, version: "1"}}]
stemcells: [{{alias: default, os: ubuntu-jammy, version: latest}}]
update: {{canaries: 1, max_in_flight: 1, canary_watch_time: 1-100, update_watch_time: 1-100}}
properties: {{admin_password: {password}}}
instance_groups:
- name: web
  instances: {instances}
  azs: [z1]
  vm_type: small
  stemcell: default
  networks: [{{name: private}}]
  jobs: [{{name: server, release: app}}]
"#
        )
    }

    #[tokio::test]
    async fn invalid_manifest_is_rejected_without_a_task() {
        let director = TestDirector::new();
        let resp = director.send(request("POST", "/deployments", ADMIN).body("releases: []".into()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["code"], codes::VALIDATION_MISSING_FIELD);
        assert!(director.store.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deploy_redirects_to_the_task() {
        let director = TestDirector::new();
        director.seed(CLOUD);
        let resp = director
            .send(request("POST", "/deployments?dry_run=true", ADMIN).body(manifest(1, "x").into()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers()[LOCATION].to_str().unwrap().to_string();
        let task = director.store.list_tasks().unwrap().pop().unwrap();
        assert_eq!(location, format!("/tasks/{}", task.id));
        assert_eq!(task.description, "create deployment (dry run)");
        assert_eq!(task.deployment.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn bad_canaries_are_a_validation_error() {
        let director = TestDirector::new();
        let resp = director
            .send(request("POST", "/deployments?canaries=lots", ADMIN).body(manifest(1, "x").into()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], codes::VALIDATION_INVALID_VALUE);
    }

    #[tokio::test]
    async fn unknown_deployment_is_404() {
        let director = TestDirector::new();
        let resp = director.send(request("GET", "/deployments/nope", ADMIN).body(Default::default()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], codes::DEPLOYMENT_NOT_FOUND);
    }

    #[tokio::test]
    async fn team_members_see_only_their_deployments() {
        let director = TestDirector::new();
        director.put_deployment("dev-app", &["dev"]);
        director.put_deployment("ops-app", &["ops"]);

        let resp = director
            .send(request("GET", "/deployments", "bosh.teams.dev.read").body(Default::default()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let names: Vec<String> = body_json(resp)
            .await
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["dev-app"]);

        let resp = director
            .send(request("GET", "/deployments/ops-app", "bosh.teams.dev.read").body(Default::default()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["code"], codes::UNAUTHORIZED);

        let resp = director
            .send(request("DELETE", "/deployments/dev-app", "bosh.teams.dev.read").body(Default::default()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn diff_redacts_properties_by_default() {
        let director = TestDirector::new();
        director.put_manifest(&manifest(1, "old-secret"));

        let resp = director
            .send(request("POST", "/deployments/app/diff", ADMIN).body(manifest(2, "new-secret").into()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let lines = body["diff"].to_string();
        assert!(lines.contains("instances: 2"));
        assert!(!lines.contains("new-secret"));
        assert!(!lines.contains("old-secret"));

        let resp = director
            .send(request("POST", "/deployments/app/diff?redact=false", ADMIN).body(manifest(1, "new-secret").into()).unwrap())
            .await;
        let lines = body_json(resp).await["diff"].to_string();
        assert!(lines.contains("new-secret"));
        assert!(!lines.contains("instances"));
    }

    #[tokio::test]
    async fn resurrection_requires_an_index_for_many_instances() {
        let director = TestDirector::new();
        director.put_deployment("app", &[]);
        director.put_instance("app", "web", 0);
        director.put_instance("app", "web", 1);

        let body = r#"{"state": "off"}"#;
        let resp = director
            .send(request("PUT", "/deployments/app/jobs/web/resurrection", ADMIN)
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], codes::INSTANCE_INVALID_INDEX);

        let body = r#"{"state": "off", "index": "1"}"#;
        let resp = director
            .send(request("PUT", "/deployments/app/jobs/web/resurrection", ADMIN)
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let view = body_json(resp).await;
        assert_eq!(view["index"], 1);
        assert_eq!(view["resurrection_paused"], true);
    }
}
