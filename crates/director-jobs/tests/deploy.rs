use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use director_cloud::{Agent, AgentState, CloudResult, CpiRegistry, DummyCloud};
use director_core::{codes, epoch_ms, DirectorConfig};
use director_jobs::{registry, JobEnv, CLOUD_CONFIG};
use director_lock::{deployment_lock, LockConfig, LockManager};
use director_state::{OutputStream, ReleaseJob, ReleaseVersion, StateStore, Stemcell, Task, TaskState};
use director_tasks::{read_output, run_task, JobRegistry, NewTask, TaskConfig, TaskManager};
use serde_json::{json, Value};

const CLOUD: &str = r#"
azs: [{name: z1}, {name: z2}]
networks: [{name: private, subnets: [{range: 10.0.0.0/24, azs: [z1, z2]}]}]
vm_types: [{name: small, cloud_properties: {cpu: 2}}]
"#;

fn manifest(instances: u32) -> String {
    format!(
        r#"
name: simple
releases: [{{name: app, version: "1"}}]
stemcells: [{{alias: default, os: ubuntu-jammy, version: latest}}]
update: {{canaries: 1, max_in_flight: 2, canary_watch_time: 1-100, update_watch_time: 1-100}}
variables: [{{name: admin_password, type: password}}]
properties: {{password: ((admin_password))}}
instance_groups:
- name: web
  instances: {instances}
  azs: [z1, z2]
  vm_type: small
  stemcell: default
  persistent_disk: 1024
  networks: [{{name: private}}]
  jobs: [{{name: server, release: app}}]
"#
    )
}

struct Director {
    store: StateStore,
    cloud: DummyCloud,
    manager: TaskManager,
    registry: JobRegistry,
}

impl Director {
    fn new() -> Self {
        let config = DirectorConfig::default();
        Self::build(LockConfig::from_director(&config), |cloud, _| Arc::new(cloud))
    }

    /// A director whose agent RPCs go through `agent`.
    fn build(locks: LockConfig, agent: impl FnOnce(DummyCloud, StateStore) -> Arc<dyn Agent>) -> Self {
        let store = StateStore::open_in_memory().unwrap();
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
        store.create_config(CLOUD_CONFIG, "default", CLOUD, None, 0).unwrap();

        let config = DirectorConfig::default();
        let cloud = DummyCloud::new("dummy");
        let env = JobEnv::new(
            store.clone(),
            LockManager::new(store.clone(), locks),
            CpiRegistry::new(Arc::new(cloud.clone())),
            agent(cloud.clone(), store.clone()),
            Arc::new(config),
        );
        Self {
            manager: TaskManager::new(store.clone(), TaskConfig::default()),
            registry: registry(env),
            store,
            cloud,
        }
    }

    async fn run(&self, job_type: &str, args: Value) -> Task {
        let task = self
            .manager
            .create_task(NewTask {
                username: "admin".into(),
                job_type: job_type.into(),
                description: job_type.into(),
                args,
                deployment: Some("simple".into()),
                ..Default::default()
            })
            .unwrap();
        run_task(&self.manager, &self.registry, task.id).await.unwrap();
        self.manager.find_task(task.id).unwrap()
    }

    async fn deploy(&self, instances: u32) -> Task {
        self.run("update_deployment", json!({"manifest_text": manifest(instances)}))
            .await
    }

    /// The `{code, description}` line a failed task leaves on its result
    /// stream.
    fn error_result(&self, task: &Task) -> Value {
        let stream = read_output(&self.store, task.id, OutputStream::Result, None)
            .unwrap()
            .unwrap();
        let line = String::from_utf8(stream.bytes).unwrap();
        serde_json::from_str(line.trim_end()).unwrap()
    }
}

#[tokio::test]
async fn deploy_scale_and_delete() {
    let director = Director::new();

    let task = director.deploy(3).await;
    assert_eq!(task.state, TaskState::Done, "{:?}", task.result);
    assert_eq!(task.result.as_deref(), Some("/deployments/simple"));

    let instances = director.store.list_instances("simple").unwrap();
    assert_eq!(instances.len(), 3);
    for instance in &instances {
        assert!(director.store.active_vm(&instance.uuid).unwrap().is_some());
        let password = &instance.spec["properties"]["server"]["password"];
        assert!(password.as_str().is_some_and(|p| !p.is_empty() && !p.contains("((")));
        assert!(instance.variable_set_id.is_some());
    }
    assert_eq!(director.cloud.vm_cids().await.len(), 3);
    assert!(director.store.get_deployment("simple").unwrap().is_some());
    assert!(director.store.get_lock(&deployment_lock("simple")).unwrap().is_none());

    let set = director.store.current_variable_set("simple").unwrap().unwrap();
    assert!(set.deployed_successfully);
    assert!(!set.writable);

    // Same password on redeploy: the value carries into the new set.
    let before = instances[0].spec["properties"]["server"]["password"].clone();
    let task = director.deploy(1).await;
    assert_eq!(task.state, TaskState::Done, "{:?}", task.result);
    let remaining = director.store.list_instances("simple").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].spec["properties"]["server"]["password"], before);
    assert_eq!(director.store.list_orphan_disks().unwrap().len(), 2);

    let task = director
        .run("delete_deployment", json!({"deployment": "simple"}))
        .await;
    assert_eq!(task.state, TaskState::Done, "{:?}", task.result);
    assert!(director.store.list_instances("simple").unwrap().is_empty());
    assert!(director.store.get_deployment("simple").unwrap().is_none());
    assert!(director.cloud.vm_cids().await.is_empty());
    assert_eq!(director.store.list_orphan_disks().unwrap().len(), 3);

    let task = director.run("delete_orphan_disks", json!({})).await;
    assert_eq!(task.state, TaskState::Done, "{:?}", task.result);
    assert!(director.store.list_orphan_disks().unwrap().is_empty());
    assert!(director.cloud.disk_cids().await.is_empty());
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let director = Director::new();
    let task = director
        .run(
            "update_deployment",
            json!({"manifest_text": manifest(2), "dry_run": true}),
        )
        .await;
    assert_eq!(task.state, TaskState::Done, "{:?}", task.result);
    assert!(director.store.list_instances("simple").unwrap().is_empty());
    assert!(director.cloud.calls().await.is_empty());
    assert!(director.store.get_deployment("simple").unwrap().is_none());
    assert!(director.store.list_variable_sets("simple").unwrap().is_empty());
}

#[tokio::test]
async fn missing_release_fails_before_any_cloud_call() {
    let director = Director::new();
    let text = manifest(1).replace(r#"version: "1"}"#, r#"version: "9"}"#);
    let task = director
        .run("update_deployment", json!({"manifest_text": text}))
        .await;
    assert_eq!(task.state, TaskState::Error);
    let result = director.error_result(&task);
    assert_eq!(result["code"], codes::RELEASE_VERSION_NOT_FOUND);
    assert_eq!(result["description"].as_str(), task.result.as_deref());
    assert!(director.cloud.calls().await.is_empty());
    assert!(director.store.list_instances("simple").unwrap().is_empty());
}

#[tokio::test]
async fn canary_failure_fails_the_task() {
    let director = Director::new();
    assert_eq!(director.deploy(3).await.state, TaskState::Done);

    director.cloud.fail_instance("web", 0).await;
    let text = manifest(3).replace("password: ((admin_password))", "password: changed");
    let task = director
        .run("update_deployment", json!({"manifest_text": text}))
        .await;
    assert_eq!(task.state, TaskState::Error);

    let untouched = director
        .store
        .list_instances("simple")
        .unwrap()
        .into_iter()
        .filter(|i| i.index != 0)
        .all(|i| i.spec["properties"]["server"]["password"] != "changed");
    assert!(untouched);
    let set = director.store.current_variable_set("simple").unwrap().unwrap();
    assert!(!set.deployed_successfully);
    assert!(!set.writable);
}

#[tokio::test]
async fn deleting_an_unknown_deployment_fails() {
    let director = Director::new();
    let task = director
        .run("delete_deployment", json!({"deployment": "simple"}))
        .await;
    assert_eq!(task.state, TaskState::Error);
    assert_eq!(task.result.as_deref(), Some("Deployment 'simple' doesn't exist"));
    assert_eq!(director.error_result(&task)["code"], codes::DEPLOYMENT_NOT_FOUND);
}

#[tokio::test]
async fn failed_first_deploy_can_be_deleted() {
    let director = Director::new();
    director.cloud.fail_instance("web", 1).await;

    let task = director.deploy(3).await;
    assert_eq!(task.state, TaskState::Error);
    let deployment = director.store.get_deployment("simple").unwrap().unwrap();
    assert_eq!(deployment.manifest_text, manifest(3));
    assert!(deployment.cloud_config_ids.is_empty());
    assert!(!director.store.list_instances("simple").unwrap().is_empty());
    assert!(!director.cloud.vm_cids().await.is_empty());

    director.cloud.clear_faults().await;
    let task = director
        .run("delete_deployment", json!({"deployment": "simple"}))
        .await;
    assert_eq!(task.state, TaskState::Done, "{:?}", task.result);
    assert!(director.store.get_deployment("simple").unwrap().is_none());
    assert!(director.store.list_instances("simple").unwrap().is_empty());
    assert!(director.cloud.vm_cids().await.is_empty());
}

/// Hands the deployment lock to another holder during the first `apply`,
/// then lingers long enough for the renewer to notice.
struct LockStealingAgent {
    inner: DummyCloud,
    store: StateStore,
    stolen: AtomicBool,
    linger: Duration,
}

#[async_trait]
impl Agent for LockStealingAgent {
    async fn apply(&self, agent_id: &str, spec: &Value) -> CloudResult<()> {
        if !self.stolen.swap(true, Ordering::SeqCst) {
            let name = deployment_lock("simple");
            let ours = self.store.get_lock(&name).unwrap().unwrap();
            self.store.release_lock(&name, &ours.uid).unwrap();
            self.store
                .try_acquire_lock(&name, "intruder", None, 30_000, epoch_ms())
                .unwrap()
                .unwrap();
            tokio::time::sleep(self.linger).await;
        }
        self.inner.apply(agent_id, spec).await
    }
    async fn start(&self, agent_id: &str) -> CloudResult<()> {
        self.inner.start(agent_id).await
    }
    async fn stop(&self, agent_id: &str) -> CloudResult<()> {
        self.inner.stop(agent_id).await
    }
    async fn drain(&self, agent_id: &str) -> CloudResult<u64> {
        self.inner.drain(agent_id).await
    }
    async fn get_state(&self, agent_id: &str) -> CloudResult<AgentState> {
        self.inner.get_state(agent_id).await
    }
    async fn mount_disk(&self, agent_id: &str, disk_cid: &str) -> CloudResult<()> {
        self.inner.mount_disk(agent_id, disk_cid).await
    }
    async fn unmount_disk(&self, agent_id: &str, disk_cid: &str) -> CloudResult<()> {
        self.inner.unmount_disk(agent_id, disk_cid).await
    }
}

#[tokio::test]
async fn deploy_stops_when_its_lock_is_taken_over() {
    let locks = LockConfig {
        lease: Duration::from_secs(30),
        renew_interval: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    };
    let director = Director::build(locks, |cloud, store| {
        Arc::new(LockStealingAgent {
            inner: cloud,
            store,
            stolen: AtomicBool::new(false),
            linger: Duration::from_millis(150),
        })
    });

    let task = director.deploy(3).await;
    assert_eq!(task.state, TaskState::Error);
    assert!(task.result.as_deref().is_some_and(|r| r.contains("lost its deployment lock")), "{:?}", task.result);

    // Only the canary ran; the regular batch never started.
    assert_eq!(director.cloud.count_calls("create_vm").await, 1);
    assert_eq!(director.store.list_instances("simple").unwrap().len(), 1);
    let set = director.store.current_variable_set("simple").unwrap().unwrap();
    assert!(!set.deployed_successfully);
    // The new holder keeps its lock.
    let lock = director.store.get_lock(&deployment_lock("simple")).unwrap().unwrap();
    assert_eq!(lock.uid, "intruder");
}
