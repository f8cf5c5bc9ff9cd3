//! director-api — REST API for the director.
//!
//! Every route except `/info` runs behind the `auth::authorize` middleware
//! with the requirement listed below. Task-creating routes answer
//! `302 Found` with `Location: /tasks/{id}`. Errors are
//! `{"code": <u32>, "description": <string>}`.
//!
//! # API Routes
//!
//! | Method | Path | Requirement | Description |
//! |---|---|---|---|
//! | GET | `/info` | none | Director name, version, caller |
//! | GET | `/deployments` | authenticated | Deployments visible to the caller |
//! | POST | `/deployments` | deployment admin | Deploy a manifest (task) |
//! | GET | `/deployments/{deployment}` | deployment read | Deployed manifest |
//! | DELETE | `/deployments/{deployment}` | deployment admin | Delete a deployment (task) |
//! | POST | `/deployments/{deployment}/diff` | deployment admin | Diff a manifest against the deployed one |
//! | GET | `/deployments/{deployment}/instances` | deployment read | Instances and their VMs |
//! | PUT | `/deployments/{deployment}/jobs/{job}/resurrection` | deployment admin | Resurrection on/off |
//! | PUT | `/deployments/{deployment}/jobs/{job}/{index}/resurrection` | deployment admin | Pause one instance |
//! | GET | `/tasks` | authenticated | List tasks |
//! | GET | `/tasks/{id}` | authenticated | Task details |
//! | DELETE | `/tasks/{id}` | authenticated | Cancel a task |
//! | GET | `/tasks/{id}/output` | authenticated | Task output stream, `Range` aware |
//! | GET | `/configs` | read | List configs |
//! | POST | `/configs` | admin | Upload a config version |
//! | GET | `/configs/{id}` | read | One config version |
//! | POST | `/configs/diff` | read | Diff config versions |
//! | GET | `/locks` | read | Live locks |
//! | GET | `/releases` | read | Uploaded releases |
//! | GET | `/stemcells` | read | Uploaded stemcells |
//! | GET | `/disks` | read | Orphaned disks |
//! | DELETE | `/disks/{cid}` | admin | Delete an orphaned disk (task) |

pub mod auth;
pub mod configs;
pub mod deployments;
pub mod error;
pub mod resources;
pub mod tasks;

use std::sync::Arc;

use axum::handler::Handler;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use director_core::DirectorConfig;
use director_lock::LockManager;
use director_state::StateStore;
use director_tasks::JobQueue;

pub use auth::{Identity, Permission, Requirement};
pub use error::{ApiError, ApiResult, ErrorBody};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub queue: JobQueue,
    pub locks: LockManager,
    pub config: Arc<DirectorConfig>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let guard = |requirement: Requirement| middleware::from_fn_with_state((state.clone(), requirement), auth::authorize);
    let user = guard(Requirement::Authenticated);
    let read = guard(Requirement::Read);
    let admin = guard(Requirement::Admin);
    let deployment_read = guard(Requirement::DeploymentRead);
    let deployment_admin = guard(Requirement::DeploymentAdmin);

    Router::new()
        .route("/info", get(resources::info))
        .route(
            "/deployments",
            get(deployments::list_deployments.layer(user.clone()))
                .post(deployments::create_deployment.layer(user.clone())),
        )
        .route(
            "/deployments/{deployment}",
            get(deployments::get_deployment.layer(deployment_read.clone()))
                .delete(deployments::delete_deployment.layer(deployment_admin.clone())),
        )
        .route(
            "/deployments/{deployment}/diff",
            post(deployments::diff_deployment.layer(deployment_admin.clone())),
        )
        .route(
            "/deployments/{deployment}/instances",
            get(deployments::list_instances.layer(deployment_read.clone())),
        )
        .route(
            "/deployments/{deployment}/jobs/{job}/resurrection",
            put(deployments::set_resurrection.layer(deployment_admin.clone())),
        )
        .route(
            "/deployments/{deployment}/jobs/{job}/{index}/resurrection",
            put(deployments::set_instance_resurrection.layer(deployment_admin)),
        )
        .route("/tasks", get(tasks::list_tasks.layer(user.clone())))
        .route(
            "/tasks/{id}",
            get(tasks::get_task.layer(user.clone())).delete(tasks::cancel_task.layer(user.clone())),
        )
        .route("/tasks/{id}/output", get(tasks::task_output.layer(user)))
        .route(
            "/configs",
            get(configs::list_configs.layer(read.clone())).post(configs::create_config.layer(admin.clone())),
        )
        .route("/configs/diff", post(configs::diff_configs.layer(read.clone())))
        .route("/configs/{id}", get(configs::get_config.layer(read.clone())))
        .route("/locks", get(resources::list_locks.layer(read.clone())))
        .route("/releases", get(resources::list_releases.layer(read.clone())))
        .route("/stemcells", get(resources::list_stemcells.layer(read.clone())))
        .route("/disks", get(resources::list_orphan_disks.layer(read)))
        .route("/disks/{cid}", delete(resources::delete_orphan_disk.layer(admin)))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use axum::body::Body;
    use axum::http::request::Builder;
    use axum::http::Request;
    use axum::response::Response;
    use director_cloud::{CpiRegistry, DummyCloud};
    use director_core::InstanceState;
    use director_jobs::{registry, JobEnv, CLOUD_CONFIG};
    use director_lock::LockConfig;
    use director_state::{Deployment, Instance, ReleaseJob, ReleaseVersion, Stemcell};
    use director_tasks::{TaskConfig, TaskManager};
    use serde_json::Value;
    use tokio::sync::watch;
    use tower::ServiceExt;

    pub const ADMIN: &str = "bosh.admin";

    /// A request from user `tester` holding `scopes`.
    pub fn request(method: &str, uri: &str, scopes: &str) -> Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(auth::USER_HEADER, "tester")
            .header(auth::SCOPES_HEADER, scopes)
    }

    pub async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub struct TestDirector {
        pub state: ApiState,
        pub store: StateStore,
        router: Router,
        _shutdown: watch::Sender<bool>,
    }

    impl TestDirector {
        pub fn new() -> Self {
            let store = StateStore::open_in_memory().unwrap();
            let config = Arc::new(DirectorConfig::default());
            let locks = LockManager::new(store.clone(), LockConfig::from_director(&config));
            let cloud = DummyCloud::new("dummy");
            let env = JobEnv::new(
                store.clone(),
                locks.clone(),
                CpiRegistry::new(Arc::new(cloud.clone())),
                Arc::new(cloud),
                config.clone(),
            );
            let (shutdown, rx) = watch::channel(false);
            let manager = TaskManager::new(store.clone(), TaskConfig::default());
            let (queue, _pool) = JobQueue::start(manager, registry(env), 1, rx);
            let state = ApiState {
                store: store.clone(),
                queue,
                locks,
                config,
            };
            Self {
                router: build_router(state.clone()),
                state,
                store,
                _shutdown: shutdown,
            }
        }

        pub async fn send(&self, request: Request<Body>) -> Response {
            self.router.clone().oneshot(request).await.unwrap()
        }

        pub fn manager(&self) -> &TaskManager {
            self.state.queue.manager()
        }

        /// Cloud config plus the `app` release and a stemcell.
        pub fn seed(&self, cloud: &str) {
            self.store.create_config(CLOUD_CONFIG, "default", cloud, None, 0).unwrap();
            self.store
                .put_release(&ReleaseVersion {
                    name: "app".into(),
                    version: "1".into(),
                    jobs: vec![ReleaseJob {
                        name: "server".into(),
                        ..Default::default()
                    }],
                    uploaded_at: 0,
                })
                .unwrap();
            self.store
                .put_stemcell(&Stemcell {
                    name: "bosh-dummy".into(),
                    os: "ubuntu-jammy".into(),
                    version: "1".into(),
                    cid: "sc-1".into(),
                    cpi: String::new(),
                    uploaded_at: 0,
                })
                .unwrap();
        }

        pub fn put_deployment(&self, name: &str, teams: &[&str]) {
            self.store
                .put_deployment(&Deployment {
                    name: name.into(),
                    manifest_text: format!("name: {name}\n"),
                    manifest: serde_json::json!({ "name": name }),
                    cloud_config_ids: Vec::new(),
                    runtime_config_ids: Vec::new(),
                    teams: teams.iter().map(|t| t.to_string()).collect(),
                    created_at: 0,
                    updated_at: 0,
                })
                .unwrap();
        }

        /// Record `text` as the deployed manifest.
        pub fn put_manifest(&self, text: &str) {
            let (manifest, raw) = director_core::DeploymentManifest::from_yaml(text).unwrap();
            self.store
                .put_deployment(&Deployment {
                    name: manifest.name,
                    manifest_text: text.into(),
                    manifest: raw,
                    cloud_config_ids: Vec::new(),
                    runtime_config_ids: Vec::new(),
                    teams: Vec::new(),
                    created_at: 0,
                    updated_at: 0,
                })
                .unwrap();
        }

        pub fn put_instance(&self, deployment: &str, job: &str, index: u32) {
            self.store
                .put_instance(&Instance {
                    uuid: format!("{job}-{index}"),
                    deployment: deployment.into(),
                    job: job.into(),
                    index,
                    state: InstanceState::Started,
                    az: None,
                    spec: Value::Null,
                    variable_set_id: None,
                    bootstrap: index == 0,
                    resurrection_paused: false,
                    ignore: false,
                    created_at: 0,
                })
                .unwrap();
        }
    }
}
