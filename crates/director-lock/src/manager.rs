//! Lock manager: acquire with timeout, background renewal, release, sweep.
//!
//! Mutual exclusion comes from the store's atomic insert-or-steal on the
//! lock row. A holder that dies simply stops renewing; once `expired_at`
//! passes, the next acquirer takes the row over.

use std::time::Duration;

use director_core::{epoch_ms, DirectorConfig};
use director_state::{LockRecord, StateStore};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LockError, LockResult};
use crate::name::parse_lock_name;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long one acquisition or renewal keeps the lock.
    pub lease: Duration,
    /// Renewal period for held locks. Must stay below `lease`.
    pub renew_interval: Duration,
    /// Initial wait between acquire attempts.
    pub poll_interval: Duration,
    /// Upper bound for the growing wait between acquire attempts.
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl LockConfig {
    pub fn from_director(config: &DirectorConfig) -> Self {
        Self {
            lease: config.lock_lease(),
            renew_interval: config.lock_renew_interval(),
            poll_interval: config.lock_poll_interval(),
            max_backoff: config.lock_poll_interval() * 4,
        }
    }
}

/// Proof of holding a lock until `expired_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub uid: String,
    pub expired_at: u64,
    pub task_id: Option<u64>,
}

impl From<LockRecord> for Lease {
    fn from(r: LockRecord) -> Self {
        Self {
            name: r.name,
            uid: r.uid,
            expired_at: r.expired_at,
            task_id: r.task_id,
        }
    }
}

/// A live lock as reported by `list_locks`.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub resource: Vec<String>,
    pub timeout: u64,
    pub task_id: Option<u64>,
}

#[derive(Clone)]
pub struct LockManager {
    store: StateStore,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: StateStore, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// One acquisition attempt. `None` while another lease is live.
    pub fn try_acquire(&self, name: &str, task_id: Option<u64>) -> LockResult<Option<Lease>> {
        let uid = uuid::Uuid::new_v4().to_string();
        let lease_ms = self.config.lease.as_millis() as u64;
        let record = self
            .store
            .try_acquire_lock(name, &uid, task_id, lease_ms, epoch_ms())?;
        Ok(record.map(Lease::from))
    }

    /// Acquire `name`, polling with growing backoff until `timeout`.
    pub async fn acquire(&self, name: &str, timeout: Duration, task_id: Option<u64>) -> LockResult<Lease> {
        let deadline = Instant::now() + timeout;
        let mut backoff = self.config.poll_interval;
        loop {
            if let Some(lease) = self.try_acquire(name, task_id)? {
                debug!(lock = %name, uid = %lease.uid, ?task_id, "lock acquired");
                return Ok(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(lock = %name, ?timeout, "lock acquisition timed out");
                return Err(LockError::Timeout(name.to_string()));
            }
            let wait = backoff.min(deadline - now);
            debug!(lock = %name, wait_ms = wait.as_millis() as u64, "lock held, backing off");
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Push the lease expiry forward. Fails with `Lost` if the lock was
    /// taken over after expiring.
    pub fn renew(&self, lease: &Lease) -> LockResult<Lease> {
        let lease_ms = self.config.lease.as_millis() as u64;
        match self.store.renew_lock(&lease.name, &lease.uid, lease_ms, epoch_ms())? {
            Some(record) => Ok(record.into()),
            None => Err(LockError::Lost(lease.name.clone())),
        }
    }

    /// Release a lease. Releasing a lost lease is a no-op.
    pub fn release(&self, lease: &Lease) -> LockResult<()> {
        if self.store.release_lock(&lease.name, &lease.uid)? {
            debug!(lock = %lease.name, "lock released");
        } else {
            warn!(lock = %lease.name, "lock was no longer held at release");
        }
        Ok(())
    }

    /// Acquire and keep renewing in the background until released.
    pub async fn hold(&self, name: &str, timeout: Duration, task_id: Option<u64>) -> LockResult<HeldLock> {
        let lease = self.acquire(name, timeout, task_id).await?;
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let renewer = tokio::spawn(renew_loop(
            self.clone(),
            lease.clone(),
            stop.clone(),
            lost.clone(),
        ));
        Ok(HeldLock {
            manager: self.clone(),
            lease,
            stop,
            lost,
            renewer: Some(renewer),
        })
    }

    /// Live locks, soonest expiry first.
    pub fn list_locks(&self) -> LockResult<Vec<LockInfo>> {
        let now = epoch_ms();
        let mut locks: Vec<LockInfo> = self
            .store
            .list_locks()?
            .into_iter()
            .filter(|l| !l.is_expired(now))
            .map(|l| {
                let parsed = parse_lock_name(&l.name);
                LockInfo {
                    kind: parsed.as_ref().map(|p| p.kind.clone()).unwrap_or_default(),
                    resource: parsed.map(|p| p.resource).unwrap_or_default(),
                    name: l.name,
                    timeout: l.expired_at,
                    task_id: l.task_id,
                }
            })
            .collect();
        locks.sort_by_key(|l| l.timeout);
        Ok(locks)
    }

    /// Delete every expired lock row. Returns how many were removed.
    pub fn sweep_expired(&self) -> LockResult<usize> {
        let removed = self.store.delete_expired_locks(epoch_ms())?;
        for name in &removed {
            debug!(lock = %name, "expired lock swept");
        }
        Ok(removed.len())
    }
}

/// Renew until stopped. A store hiccup is retried on the next tick for as
/// long as the current lease is still ours; `lost` fires once the row
/// belongs to someone else or the lease ran out unrenewed.
async fn renew_loop(manager: LockManager, mut lease: Lease, stop: CancellationToken, lost: CancellationToken) {
    let interval = manager.config.renew_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match manager.renew(&lease) {
                    Ok(renewed) => lease = renewed,
                    Err(e @ LockError::Lost(_)) => {
                        warn!(lock = %lease.name, error = %e, "lock taken over by another holder");
                        lost.cancel();
                        return;
                    }
                    Err(e) if epoch_ms() < lease.expired_at => {
                        warn!(lock = %lease.name, error = %e, expired_at = lease.expired_at, "lock renewal failed, retrying");
                    }
                    Err(e) => {
                        warn!(lock = %lease.name, error = %e, "lock lease ran out while renewal kept failing");
                        lost.cancel();
                        return;
                    }
                }
            }
            _ = stop.cancelled() => return,
        }
    }
}

/// A lock renewed in the background for as long as it is held.
///
/// Dropping without `release` stops renewal and lets the lease lapse.
pub struct HeldLock {
    manager: LockManager,
    lease: Lease,
    stop: CancellationToken,
    lost: CancellationToken,
    renewer: Option<tokio::task::JoinHandle<()>>,
}

impl HeldLock {
    pub fn name(&self) -> &str {
        &self.lease.name
    }

    /// Whether the lock was taken over or its lease ran out unrenewed.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Fires when the lock is lost. Work done under the lock should stop
    /// at its next checkpoint once this is cancelled.
    pub fn lost_signal(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub async fn release(mut self) -> LockResult<()> {
        self.stop.cancel();
        if let Some(handle) = self.renewer.take() {
            let _ = handle.await;
        }
        self.manager.release(&self.lease)
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Periodically delete expired lock rows until shutdown is signalled.
pub async fn run_sweeper(manager: LockManager, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(?interval, "lock sweeper started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match manager.sweep_expired() {
                    Ok(0) => {}
                    Ok(n) => info!(removed = n, "swept expired locks"),
                    Err(e) => warn!(error = %e, "lock sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("lock sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::deployment_lock;

    fn manager(store: StateStore) -> LockManager {
        LockManager::new(
            store,
            LockConfig {
                lease: Duration::from_secs(30),
                renew_interval: Duration::from_millis(20),
                poll_interval: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_lease_live() {
        let mgr = manager(StateStore::open_in_memory().unwrap());
        let name = deployment_lock("test-deployment");
        let first = mgr.acquire(&name, Duration::from_millis(50), Some(1)).await.unwrap();
        let err = mgr
            .acquire(&name, Duration::from_millis(60), Some(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout(ref n) if n == &name));

        mgr.release(&first).unwrap();
        mgr.acquire(&name, Duration::from_millis(50), Some(2)).await.unwrap();
    }

    #[tokio::test]
    async fn expired_row_is_stolen_instead_of_timing_out() {
        let store = StateStore::open_in_memory().unwrap();
        let name = deployment_lock("test-deployment");
        // A lease that ran out long ago, left behind by a dead holder.
        store.try_acquire_lock(&name, "dead-worker", Some(9), 1, 0).unwrap();

        let mgr = manager(store.clone());
        let lease = mgr.acquire(&name, Duration::from_millis(10), Some(10)).await.unwrap();
        assert_ne!(lease.uid, "dead-worker");
        assert_eq!(store.get_lock(&name).unwrap().unwrap().task_id, Some(10));
    }

    #[tokio::test]
    async fn held_lock_is_renewed_and_released() {
        let store = StateStore::open_in_memory().unwrap();
        let mgr = manager(store.clone());
        let name = deployment_lock("renewed");
        let held = mgr.hold(&name, Duration::from_millis(50), None).await.unwrap();
        let before = store.get_lock(&name).unwrap().unwrap().expired_at;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let after = store.get_lock(&name).unwrap().unwrap().expired_at;
        assert!(after > before);
        assert!(!held.is_lost());

        held.release().await.unwrap();
        assert!(store.get_lock(&name).unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_after_steal_reports_lost() {
        let store = StateStore::open_in_memory().unwrap();
        let mgr = manager(store.clone());
        let name = deployment_lock("stolen");
        let lease: Lease = store
            .try_acquire_lock(&name, "old", None, 1, 0)
            .unwrap()
            .unwrap()
            .into();
        mgr.acquire(&name, Duration::from_millis(10), None).await.unwrap();
        assert!(matches!(mgr.renew(&lease), Err(LockError::Lost(_))));
    }

    #[tokio::test]
    async fn held_lock_signals_loss_after_takeover() {
        let store = StateStore::open_in_memory().unwrap();
        let mgr = manager(store.clone());
        let name = deployment_lock("taken");
        let held = mgr.hold(&name, Duration::from_millis(50), Some(1)).await.unwrap();
        let lost = held.lost_signal();

        let ours = store.get_lock(&name).unwrap().unwrap();
        assert!(store.release_lock(&name, &ours.uid).unwrap());
        store
            .try_acquire_lock(&name, "other-worker", Some(2), 30_000, epoch_ms())
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), lost.cancelled())
            .await
            .expect("loss was not signalled");
        assert!(held.is_lost());

        // Releasing a lost lock leaves the new holder alone.
        held.release().await.unwrap();
        assert_eq!(store.get_lock(&name).unwrap().unwrap().uid, "other-worker");
    }

    #[test]
    fn list_and_sweep() {
        let store = StateStore::open_in_memory().unwrap();
        let mgr = manager(store.clone());
        store.try_acquire_lock("lock:deployment:old", "x", None, 1, 0).unwrap();
        mgr.try_acquire("lock:deployment:live", Some(3)).unwrap().unwrap();

        let live = mgr.list_locks().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].kind, "deployment");
        assert_eq!(live[0].resource, vec!["live"]);

        assert_eq!(mgr.sweep_expired().unwrap(), 1);
        assert_eq!(store.list_locks().unwrap().len(), 1);
    }
}
