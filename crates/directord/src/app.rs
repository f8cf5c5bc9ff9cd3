//! Process assembly: wire the store, locks, CPI, tasks and API together and
//! run the background loops until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use director_api::{build_router, ApiState};
use director_cloud::{CpiRegistry, DummyCloud};
use director_core::DirectorConfig;
use director_jobs::{registry, JobEnv};
use director_lock::{run_sweeper, LockConfig, LockManager};
use director_state::StateStore;
use director_tasks::{run_timeout_sweeper, JobQueue, TaskConfig, TaskManager, WorkerPool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// A running director: API state plus the background work behind it.
pub struct Director {
    pub state: ApiState,
    shutdown: watch::Sender<bool>,
    pool: WorkerPool,
    background: Vec<JoinHandle<()>>,
}

impl Director {
    /// Build every subsystem on top of `store` and start the worker pool
    /// and sweepers. Tasks queued by a previous process are re-dispatched.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn assemble(config: DirectorConfig, store: StateStore) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        // ── CPI ────────────────────────────────────────────────────
        let cloud = match config.cpi.kind.as_str() {
            "dummy" => DummyCloud::new("dummy"),
            other => anyhow::bail!("unsupported cpi kind '{other}'"),
        };
        info!(cpi = %config.cpi.kind, "cpi initialized");

        // ── Locks and tasks ────────────────────────────────────────
        let locks = LockManager::new(store.clone(), LockConfig::from_director(&config));
        let manager = TaskManager::new(store.clone(), TaskConfig::from_director(&config));
        let env = JobEnv::new(
            store.clone(),
            locks.clone(),
            CpiRegistry::new(Arc::new(cloud.clone())),
            Arc::new(cloud),
            config.clone(),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (queue, pool) = JobQueue::start(manager.clone(), registry(env), config.workers, shutdown_rx.clone());
        let recovered = queue.recover()?;
        if recovered > 0 {
            info!(count = recovered, "recovered queued tasks");
        }

        // ── Background loops ───────────────────────────────────────
        let background = vec![
            tokio::spawn(run_sweeper(locks.clone(), config.lock_sweep_interval(), shutdown_rx.clone())),
            tokio::spawn(run_timeout_sweeper(manager, config.task_checkpoint_interval(), shutdown_rx)),
        ];

        let state = ApiState {
            store,
            queue,
            locks,
            config,
        };
        Ok(Self {
            state,
            shutdown,
            pool,
            background,
        })
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Signal every loop to stop and wait for in-flight tasks to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.pool.join().await;
        for handle in self.background {
            let _ = handle.await;
        }
    }
}

/// Open the on-disk store, start the director and serve the API until
/// Ctrl-C.
pub async fn serve(config: DirectorConfig) -> anyhow::Result<()> {
    info!(name = %config.name, "director starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let director = Director::assemble(config, store)?;
    let router = director.router();

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;

    director.shutdown().await;
    info!("director stopped");
    Ok(())
}
