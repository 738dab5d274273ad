//! Warm sandbox pool
//!
//! Keeps `capacity` idle sandboxes ready and enforces single use:
//! - Acquisition pops a warm sandbox or creates one on demand
//! - Every run destroys its sandbox and refills the pool before returning
//! - Leftovers from a crashed process are pruned by ownership label at start-up
//! - An unreachable backend degrades the pool instead of failing construction;
//!   losing the backend mid-run degrades it too, and the next acquire that
//!   reaches the backend again restores it
//! - Shutdown removes leased sandboxes as well as warm ones

use crate::backend::{BackendHandle, ExecOutput, SandboxBackend};
use crate::error::SandboxError;
use crate::limits::{DeploymentProfile, ResourceLimits};
use crate::protocol::{self, RunFailure, RunOutcome, DATASET_PATH, RUN_ARGV, SCRIPT_PATH};
use crate::sandbox::{OwnerLabel, Sandbox, SandboxId, SandboxState};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pool sizing and per-sandbox caps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of warm sandboxes kept ready
    pub capacity: usize,
    /// Caps applied to every sandbox
    pub limits: ResourceLimits,
    /// Label marking sandboxes owned by this service
    pub owner_label: OwnerLabel,
}

impl PoolConfig {
    /// Capacity and limits derived from a deployment profile
    #[must_use]
    pub fn from_profile(profile: DeploymentProfile) -> Self {
        Self {
            capacity: profile.capacity(),
            limits: profile.limits(),
            owner_label: OwnerLabel::default(),
        }
    }

    /// With explicit capacity
    #[inline]
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// With explicit limits
    #[inline]
    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// With a different ownership label
    #[inline]
    #[must_use]
    pub fn with_owner_label(mut self, label: OwnerLabel) -> Self {
        self.owner_label = label;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_profile(DeploymentProfile::default())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured warm capacity
    pub capacity: usize,
    /// Sandboxes idle in the pool
    pub warm: usize,
    /// Sandboxes currently leased
    pub in_use: usize,
    /// Sandboxes created since start-up
    pub total_created: u64,
    /// Sandboxes destroyed since start-up
    pub total_destroyed: u64,
    /// Completed runs
    pub runs: u64,
    /// Sandboxes created because the pool was empty
    pub on_demand_creations: u64,
    /// Creation attempts the backend refused
    pub failed_creations: u64,
}

#[derive(Debug)]
struct PoolInner {
    backend: Arc<dyn SandboxBackend>,
    config: PoolConfig,
    /// Warm sandboxes (FIFO so the oldest is used first)
    warm: Mutex<VecDeque<Sandbox>>,
    /// Leased sandboxes
    in_use: DashMap<SandboxId, BackendHandle>,
    available: AtomicBool,
    unavailable_reason: parking_lot::Mutex<Option<String>>,
    /// Orphans pruned and warm set created
    primed: AtomicBool,
    shut_down: AtomicBool,
    stats: parking_lot::Mutex<PoolStats>,
    /// Background recycles spawned by abandoned leases
    pending: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

fn into_unavailable(e: SandboxError) -> SandboxError {
    match e {
        SandboxError::Unavailable(_) => e,
        other => SandboxError::Unavailable(other.to_string()),
    }
}

impl PoolInner {
    /// Fail fast while degraded, unless the backend answers again
    async fn ensure_available(&self) -> Result<(), SandboxError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SandboxError::Unavailable("sandbox pool has been shut down".into()));
        }
        if self.available.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Err(e) = self.backend.ping().await {
            let e = into_unavailable(e);
            self.mark_unavailable(&e);
            return Err(e);
        }
        self.available.store(true, Ordering::Release);
        *self.unavailable_reason.lock() = None;
        tracing::info!("isolation backend reachable again; sandbox pool restored");
        if !self.primed.swap(true, Ordering::AcqRel) {
            if let Err(e) = prune_orphans(self.backend.as_ref(), &self.config.owner_label).await {
                tracing::warn!(error = %e, "orphan pruning failed");
            }
        }
        Ok(())
    }

    fn mark_unavailable(&self, e: &SandboxError) {
        let reason = match e {
            SandboxError::Unavailable(msg) => msg.clone(),
            other => other.to_string(),
        };
        if self.available.swap(false, Ordering::AcqRel) {
            tracing::warn!(reason = %reason, "isolation backend lost; sandbox pool disabled");
        }
        *self.unavailable_reason.lock() = Some(reason);
    }

    /// Decide whether a backend failure during a run means the backend is gone
    async fn confirm_backend(&self, e: SandboxError) -> SandboxError {
        if e.is_unavailable() {
            return e;
        }
        match self.backend.ping().await {
            Ok(()) => e,
            Err(down) => into_unavailable(down),
        }
    }

    async fn create(&self) -> Result<Sandbox, SandboxError> {
        match self
            .backend
            .create(&self.config.limits, &self.config.owner_label)
            .await
        {
            Ok(handle) => {
                self.stats.lock().total_created += 1;
                let sandbox = Sandbox::warm(handle);
                tracing::debug!(sandbox_id = %sandbox.id(), handle = %sandbox.handle(), "sandbox created");
                Ok(sandbox)
            }
            Err(e) => {
                self.stats.lock().failed_creations += 1;
                Err(e)
            }
        }
    }

    async fn destroy(&self, mut sandbox: Sandbox) {
        sandbox.mark(SandboxState::Destroyed);
        if let Err(e) = self.backend.remove(sandbox.handle()).await {
            tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "failed to remove sandbox");
        }
        self.stats.lock().total_destroyed += 1;
        tracing::debug!(sandbox_id = %sandbox.id(), age_ms = sandbox.age().as_millis() as u64, "sandbox destroyed");
    }

    /// Top the warm list up to capacity
    ///
    /// Creation happens outside the lock; a sandbox that arrives after a
    /// concurrent refill already filled the pool is destroyed.
    async fn refill(&self) {
        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }
            let deficit = {
                let warm = self.warm.lock().await;
                self.config.capacity.saturating_sub(warm.len())
            };
            if deficit == 0 {
                return;
            }
            let sandbox = match self.create().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "refill failed; pool below capacity until next acquire");
                    return;
                }
            };
            let surplus = {
                let mut warm = self.warm.lock().await;
                if warm.len() < self.config.capacity && !self.shut_down.load(Ordering::Acquire) {
                    warm.push_back(sandbox);
                    None
                } else {
                    Some(sandbox)
                }
            };
            if let Some(extra) = surplus {
                self.destroy(extra).await;
                return;
            }
        }
    }

    async fn recycle(&self, sandbox: Sandbox) {
        if self.in_use.remove(&sandbox.id()).is_none() {
            tracing::debug!(sandbox_id = %sandbox.id(), "sandbox already removed by shutdown");
            return;
        }
        self.destroy(sandbox).await;
        self.refill().await;
    }
}

/// Remove every sandbox carrying `label`
///
/// # Errors
/// Returns the backend error if the labeled sandboxes cannot be listed.
/// Individual removal failures are logged and skipped.
pub async fn prune_orphans(
    backend: &dyn SandboxBackend,
    label: &OwnerLabel,
) -> Result<usize, SandboxError> {
    let orphans = backend.list_labeled(label).await?;
    let mut removed = 0;
    for handle in &orphans {
        match backend.remove(handle).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(handle = %handle, error = %e, "failed to prune orphaned sandbox"),
        }
    }
    if removed > 0 {
        tracing::info!(removed, label = %label, "pruned orphaned sandboxes");
    }
    Ok(removed)
}

/// Exclusive, single-use claim on one sandbox
///
/// Dropping a lease that was not retired destroys the sandbox and refills the
/// pool in a background task, which kills any execution still in flight.
#[derive(Debug)]
pub struct SandboxLease {
    pool: Arc<PoolInner>,
    id: SandboxId,
    handle: BackendHandle,
    sandbox: Option<Sandbox>,
}

impl SandboxLease {
    /// Leased sandbox ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Backend handle of the leased sandbox
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    /// Inject the dataset and the wrapped script, then run it
    ///
    /// # Errors
    /// Returns backend errors; script failures are part of the output.
    pub async fn execute(&self, script: &str, dataset: &[u8]) -> Result<ExecOutput, SandboxError> {
        let backend = &self.pool.backend;
        backend.put_file(&self.handle, DATASET_PATH, dataset).await?;
        backend
            .put_file(&self.handle, SCRIPT_PATH, script.as_bytes())
            .await?;
        backend.exec(&self.handle, &RUN_ARGV).await
    }

    /// Destroy the sandbox and refill the pool, waiting for both
    pub async fn retire(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            let pool = Arc::clone(&self.pool);
            pool.recycle(sandbox).await;
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        tracing::debug!(sandbox_id = %self.id, "lease abandoned; destroying sandbox in background");
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let pool = Arc::clone(&self.pool);
                let task = rt.spawn(async move { pool.recycle(sandbox).await });
                let mut pending = self.pool.pending.lock();
                pending.retain(|t| !t.is_finished());
                pending.push(task);
            }
            Err(_) => {
                tracing::error!(sandbox_id = %self.id, handle = %self.handle, "no runtime to destroy abandoned sandbox; it will be pruned on next start");
            }
        }
    }
}

/// Fixed-capacity pool of warm, single-use sandboxes
#[derive(Debug, Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    /// Prune orphans and create `capacity` warm sandboxes
    ///
    /// Never fails: if the backend is unreachable the pool is returned in the
    /// unavailable state and every run reports that.
    #[tracing::instrument(skip_all, fields(backend = backend.name(), capacity = config.capacity))]
    pub async fn initialize(backend: Arc<dyn SandboxBackend>, config: PoolConfig) -> Self {
        let capacity = config.capacity;
        let pool = Self {
            inner: Arc::new(PoolInner {
                backend,
                config,
                warm: Mutex::new(VecDeque::with_capacity(capacity)),
                in_use: DashMap::new(),
                available: AtomicBool::new(false),
                unavailable_reason: parking_lot::Mutex::new(None),
                primed: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                stats: parking_lot::Mutex::new(PoolStats {
                    capacity,
                    ..PoolStats::default()
                }),
                pending: parking_lot::Mutex::new(Vec::new()),
            }),
        };

        let inner = &pool.inner;
        if let Err(e) = inner.backend.ping().await {
            tracing::warn!(error = %e, "isolation backend unreachable; sandbox pool disabled");
            *inner.unavailable_reason.lock() = Some(e.to_string());
            return pool;
        }
        inner.available.store(true, Ordering::Release);
        inner.primed.store(true, Ordering::Release);

        let mut warm = inner.warm.lock().await;
        if let Err(e) = prune_orphans(inner.backend.as_ref(), &inner.config.owner_label).await {
            tracing::warn!(error = %e, "orphan pruning failed");
        }
        for _ in 0..capacity {
            match inner.create().await {
                Ok(sandbox) => warm.push_back(sandbox),
                Err(e) => tracing::warn!(error = %e, "failed to create warm sandbox"),
            }
        }
        tracing::info!(warm = warm.len(), capacity, "sandbox pool initialized");
        drop(warm);
        pool
    }

    /// Whether the isolation backend was reachable at last contact
    #[inline]
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire) && !self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Pool configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of warm sandboxes
    pub async fn warm_count(&self) -> usize {
        self.inner.warm.lock().await.len()
    }

    /// Snapshot of pool statistics
    pub async fn stats(&self) -> PoolStats {
        let warm = self.warm_count().await;
        let mut stats = self.inner.stats.lock().clone();
        stats.warm = warm;
        stats.in_use = self.inner.in_use.len();
        stats
    }

    /// Lease a sandbox, creating one if none is warm
    ///
    /// # Errors
    /// - `SandboxError::Unavailable` if the backend is down or the pool is shut down
    /// - `SandboxError::CreationFailed` if on-demand creation fails
    pub async fn acquire(&self) -> Result<SandboxLease, SandboxError> {
        self.inner.ensure_available().await?;

        let popped = self.inner.warm.lock().await.pop_front();
        let mut sandbox = match popped {
            Some(s) => s,
            None => {
                tracing::debug!("warm pool empty; creating sandbox on demand");
                self.inner.stats.lock().on_demand_creations += 1;
                match self.inner.create().await {
                    Ok(s) => s,
                    Err(e) => {
                        let e = self.inner.confirm_backend(e).await;
                        if e.is_unavailable() {
                            self.inner.mark_unavailable(&e);
                        }
                        return Err(e);
                    }
                }
            }
        };

        sandbox.mark(SandboxState::InUse);
        self.inner.in_use.insert(sandbox.id(), sandbox.handle().clone());
        Ok(SandboxLease {
            pool: Arc::clone(&self.inner),
            id: sandbox.id(),
            handle: sandbox.handle().clone(),
            sandbox: Some(sandbox),
        })
    }

    /// Run `code` against `dataset` in a fresh sandbox
    ///
    /// The sandbox is destroyed and replaced before this returns, whatever the
    /// outcome. Script errors and timeouts are reported on the outcome.
    ///
    /// # Errors
    /// - `SandboxError::Unavailable` if sandboxing is unavailable
    /// - `SandboxError::CreationFailed` if no sandbox could be obtained
    pub async fn run(
        &self,
        code: &str,
        dataset: &[u8],
        timeout: Duration,
    ) -> Result<RunOutcome, SandboxError> {
        self.run_inner(code, dataset, timeout, None).await
    }

    /// [`run`](Self::run), abandoned as soon as `token` is cancelled
    ///
    /// # Errors
    /// As [`run`](Self::run), plus `SandboxError::Cancelled` when the token fires.
    pub async fn run_cancellable(
        &self,
        code: &str,
        dataset: &[u8],
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError> {
        self.run_inner(code, dataset, timeout, Some(token)).await
    }

    #[tracing::instrument(skip_all, fields(sandbox_id = tracing::field::Empty, timeout_ms = timeout.as_millis() as u64))]
    async fn run_inner(
        &self,
        code: &str,
        dataset: &[u8],
        timeout: Duration,
        token: Option<&CancellationToken>,
    ) -> Result<RunOutcome, SandboxError> {
        let lease = self.acquire().await?;
        tracing::Span::current().record("sandbox_id", tracing::field::display(lease.id()));
        let script = protocol::wrapper_script(code);
        let started = Instant::now();

        let deadline = tokio::time::timeout(timeout, lease.execute(&script, dataset));
        let finished = match token {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => None,
                res = deadline => Some(res),
            },
            None => Some(deadline.await),
        };

        let Some(finished) = finished else {
            tracing::info!("run cancelled; abandoning sandbox");
            drop(lease);
            return Err(SandboxError::Cancelled);
        };

        let outcome = match finished {
            Ok(Ok(exec)) => protocol::interpret(exec),
            Ok(Err(e)) => {
                let e = self.inner.confirm_backend(e).await;
                if e.is_unavailable() {
                    self.inner.mark_unavailable(&e);
                    lease.retire().await;
                    return Err(e);
                }
                tracing::warn!(error = %e, "sandbox execution failed");
                RunOutcome::failed(RunFailure::Sandbox(e.to_string()))
            }
            Err(_) => {
                tracing::warn!("execution exceeded deadline; killing sandbox");
                RunOutcome::failed(RunFailure::Timeout(timeout))
            }
        };

        lease.retire().await;
        self.inner.stats.lock().runs += 1;
        tracing::info!(
            success = outcome.is_success(),
            has_image = outcome.image.is_some(),
            duration_ms = started.elapsed().as_millis() as u64,
            "sandbox run finished"
        );
        Ok(outcome)
    }

    /// Destroy every warm and leased sandbox; later runs report unavailable
    ///
    /// Waits for background removals started by abandoned leases, so nothing
    /// is left running once this returns.
    pub async fn shutdown(&self) -> usize {
        let inner = &self.inner;
        inner.shut_down.store(true, Ordering::Release);
        let drained: Vec<Sandbox> = inner.warm.lock().await.drain(..).collect();
        let mut count = drained.len();
        for sandbox in drained {
            inner.destroy(sandbox).await;
        }

        let leased: Vec<SandboxId> = inner.in_use.iter().map(|e| *e.key()).collect();
        for id in leased {
            let Some((_, handle)) = inner.in_use.remove(&id) else {
                continue;
            };
            if let Err(e) = inner.backend.remove(&handle).await {
                tracing::warn!(sandbox_id = %id, error = %e, "failed to remove leased sandbox");
            }
            inner.stats.lock().total_destroyed += 1;
            count += 1;
        }

        let pending = std::mem::take(&mut *inner.pending.lock());
        for task in pending {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background sandbox removal did not finish");
            }
        }
        tracing::info!(destroyed = count, "sandbox pool shut down");
        count
    }
}
