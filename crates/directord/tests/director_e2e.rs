//! End-to-end tests: a fully assembled director driven through its API
//! against the dummy CPI.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::LOCATION;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use director_api::auth::{SCOPES_HEADER, USER_HEADER};
use director_core::DirectorConfig;
use director_state::{ReleaseJob, ReleaseVersion, StateStore, Stemcell};
use director_tasks::{NewTask, TaskConfig, TaskManager};
use directord::Director;
use serde_json::{json, Value};
use tower::ServiceExt;

const CLOUD: &str = r#"
azs: [{name: z1}, {name: z2}]
networks: [{name: private, subnets: [{range: 10.0.0.0/24, azs: [z1, z2]}]}]
vm_types: [{name: small}]
"#;

const MANIFEST: &str = r#"
name: simple
releases: [{name: app, version: "1"}]
stemcells: [{alias: default, os: ubuntu-jammy, version: latest}]
update: {canaries: 1, max_in_flight: 2, canary_watch_time: 1-100, update_watch_time: 1-100}
instance_groups:
- name: web
  instances: 2
  azs: [z1, z2]
  vm_type: small
  stemcell: default
  persistent_disk: 1024
  networks: [{name: private}]
  jobs: [{name: server, release: app}]
"#;

fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(USER_HEADER, "admin")
        .header(SCOPES_HEADER, "bosh.admin")
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn body_json(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn seed_release_and_stemcell(store: &StateStore) {
    store
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
    store
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

/// The task a `302 Found` reply points at.
fn task_location(redirect: &Response) -> String {
    assert_eq!(redirect.status(), StatusCode::FOUND);
    redirect.headers()[LOCATION].to_str().unwrap().to_string()
}

/// Poll a task until it leaves the active states.
async fn wait_for_task(router: &Router, location: &str) -> Value {
    for _ in 0..500 {
        let task = body_json(send(router, request("GET", location).body(Body::empty()).unwrap()).await).await;
        if !matches!(task["state"].as_str(), Some("queued" | "processing" | "cancelling")) {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task at {location} did not finish");
}

#[tokio::test]
async fn deploy_and_delete_through_the_api() {
    let store = StateStore::open_in_memory().unwrap();
    seed_release_and_stemcell(&store);
    let director = Director::assemble(DirectorConfig::default(), store.clone()).unwrap();
    let router = director.router();

    let upload = json!({"type": "cloud", "name": "default", "content": CLOUD});
    let resp = send(
        &router,
        request("POST", "/configs")
            .header("content-type", "application/json")
            .body(Body::from(upload.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = send(
        &router,
        request("POST", "/deployments")
            .header("content-type", "text/yaml")
            .body(Body::from(MANIFEST))
            .unwrap(),
    )
    .await;
    let task = wait_for_task(&router, &task_location(&resp)).await;
    assert_eq!(task["state"], "done", "deploy task: {task}");

    let resp = send(&router, request("GET", "/deployments/simple/instances").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let instances = body_json(resp).await;
    let instances = instances.as_array().unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i["vm_cid"].is_string()));

    let resp = send(&router, request("GET", "/deployments").body(Body::empty()).unwrap()).await;
    let deployments = body_json(resp).await;
    assert_eq!(deployments[0]["name"], "simple");

    let uri = format!("/tasks/{}/output?type=result", task["id"]);
    let resp = send(&router, request("GET", &uri).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let result = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(!result.is_empty());

    let resp = send(&router, request("GET", "/locks").body(Body::empty()).unwrap()).await;
    assert_eq!(body_json(resp).await, json!([]));

    let resp = send(&router, request("DELETE", "/deployments/simple").body(Body::empty()).unwrap()).await;
    let task = wait_for_task(&router, &task_location(&resp)).await;
    assert_eq!(task["state"], "done", "delete task: {task}");

    let resp = send(&router, request("GET", "/deployments/simple").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = send(&router, request("GET", "/disks").body(Body::empty()).unwrap()).await;
    assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);

    director.shutdown().await;
}

#[tokio::test]
async fn queued_tasks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = DirectorConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let queued = {
        let store = StateStore::open(&config.db_path()).unwrap();
        TaskManager::new(store, TaskConfig::default())
            .create_task(NewTask {
                username: "admin".into(),
                job_type: director_jobs::delete_orphan_disks::JOB_TYPE.into(),
                description: "delete orphan disks".into(),
                args: json!({"cids": []}),
                ..Default::default()
            })
            .unwrap()
    };

    let store = StateStore::open(&config.db_path()).unwrap();
    let director = Director::assemble(config, store).unwrap();
    let router = director.router();

    let task = wait_for_task(&router, &format!("/tasks/{}", queued.id)).await;
    assert_eq!(task["state"], "done");
    assert_eq!(task["result"], "orphaned disk(s) deleted: 0");

    director.shutdown().await;
}

#[tokio::test]
async fn unsupported_cpi_is_refused() {
    let mut config = DirectorConfig::default();
    config.cpi.kind = "aws".into();
    let store = StateStore::open_in_memory().unwrap();
    assert!(Director::assemble(config, store).is_err());
}
