use faas_common::{FaasError, FunctionSignature, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PoolConfig;
use crate::runtime::{ContainerHandle, RuntimeAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    /// Idle and ready for assignment.
    Warm,
    /// Borrowed by exactly one job.
    InUse,
    /// Being destroyed.
    Draining,
}

#[derive(Debug, Clone)]
pub struct PooledContainer {
    pub handle: ContainerHandle,
    pub signature: FunctionSignature,
    pub state: ContainerState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u32,
    /// Set when this acquire had to create the container.
    pub cold_start: Option<Duration>,
}

impl PooledContainer {
    pub fn id(&self) -> &str {
        &self.handle.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureStats {
    pub signature: String,
    pub warm: usize,
    pub in_use: usize,
    /// Live containers plus in-flight creations.
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub warm: usize,
    pub in_use: usize,
    pub total: usize,
    pub per_signature: Vec<SignatureStats>,
    pub created: u64,
    pub destroyed: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bookkeeping guarded by one lock. `per_signature` and `total` count every
/// container the pool is responsible for, including reserved slots whose
/// container is still being created and containers being destroyed.
#[derive(Default)]
struct PoolInner {
    warm: HashMap<FunctionSignature, VecDeque<PooledContainer>>,
    in_use: HashMap<String, PooledContainer>,
    per_signature: HashMap<FunctionSignature, usize>,
    total: usize,
}

impl PoolInner {
    fn count(&self, signature: &FunctionSignature) -> usize {
        self.per_signature.get(signature).copied().unwrap_or(0)
    }

    fn reserve(&mut self, signature: &FunctionSignature) {
        *self.per_signature.entry(signature.clone()).or_insert(0) += 1;
        self.total += 1;
    }

    fn forget(&mut self, signature: &FunctionSignature) {
        if let Some(count) = self.per_signature.get_mut(signature) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_signature.remove(signature);
            }
            self.total = self.total.saturating_sub(1);
        }
    }

    /// Most recently released container first.
    fn take_warm(&mut self, signature: &FunctionSignature) -> Option<PooledContainer> {
        let deque = self.warm.get_mut(signature)?;
        let container = deque.pop_back();
        if deque.is_empty() {
            self.warm.remove(signature);
        }
        container
    }

    /// Least-recently-used warm container of another signature whose priority
    /// does not exceed the requester's.
    fn take_eviction_victim(&mut self, requester: &FunctionSignature) -> Option<PooledContainer> {
        let victim_sig = self
            .warm
            .iter()
            .filter(|(sig, _)| *sig != requester && sig.priority <= requester.priority)
            .filter_map(|(sig, deque)| deque.front().map(|c| (sig, c.last_used_at)))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(sig, _)| sig.clone())?;

        let deque = self.warm.get_mut(&victim_sig)?;
        let victim = deque.pop_front();
        if deque.is_empty() {
            self.warm.remove(&victim_sig);
        }
        victim
    }

    fn warm_len(&self) -> usize {
        self.warm.values().map(VecDeque::len).sum()
    }
}

enum Slot {
    Reserved,
    ReservedByEviction(PooledContainer),
}

/// Signature-keyed pool of idle containers with per-signature and global caps.
///
/// The lock only covers bookkeeping; container creation and destruction run
/// after it is released.
pub struct ContainerPool {
    runtime: Arc<RuntimeAdapter>,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    capacity_freed: Notify,
    closed: AtomicBool,
    created: AtomicU64,
    destroyed: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ContainerPool {
    pub fn new(runtime: Arc<RuntimeAdapter>, config: PoolConfig) -> Self {
        Self {
            runtime,
            config,
            inner: Mutex::new(PoolInner::default()),
            capacity_freed: Notify::new(),
            closed: AtomicBool::new(false),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a container for `signature`: a warm one when available,
    /// otherwise a fresh one within the caps.
    ///
    /// When a cap is reached and nothing can be evicted, waits up to
    /// `acquire_wait` for capacity before failing with `ResourceExhausted`.
    #[instrument(skip(self, signature), fields(signature = %signature))]
    pub async fn acquire(&self, signature: &FunctionSignature) -> Result<PooledContainer> {
        self.acquire_until(signature, &CancellationToken::new()).await
    }

    /// Like [`acquire`](Self::acquire), but gives up with `Cancelled` if
    /// `cancel` fires while waiting for capacity. A creation already under
    /// way is finished, so its slot is never leaked.
    pub async fn acquire_until(
        &self,
        signature: &FunctionSignature,
        cancel: &CancellationToken,
    ) -> Result<PooledContainer> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FaasError::ShuttingDown);
        }
        if cancel.is_cancelled() {
            return Err(FaasError::Cancelled);
        }
        let deadline = Instant::now() + self.config.acquire_wait;

        let slot = loop {
            let notified = self.capacity_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some(mut container) = inner.take_warm(signature) {
                    container.state = ContainerState::InUse;
                    container.use_count += 1;
                    container.last_used_at = Instant::now();
                    container.cold_start = None;
                    inner
                        .in_use
                        .insert(container.handle.id.clone(), container.clone());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(container_id = %container.handle.id, "Pool hit");
                    return Ok(container);
                }

                if inner.count(signature) < self.config.max_per_signature {
                    if inner.total < self.config.max_total {
                        inner.reserve(signature);
                        break Slot::Reserved;
                    }
                    if let Some(victim) = inner.take_eviction_victim(signature) {
                        // The victim's slot is handed to the requester.
                        inner.forget(&victim.signature);
                        inner.reserve(signature);
                        break Slot::ReservedByEviction(victim);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Acquire cancelled while waiting for capacity");
                    return Err(FaasError::Cancelled);
                }
                waited = tokio::time::timeout_at(deadline, notified) => {
                    if waited.is_err() {
                        warn!("No pool capacity within acquire wait");
                        return Err(FaasError::ResourceExhausted(format!(
                            "pool capacity exhausted for {signature}"
                        )));
                    }
                }
            }
        };

        if let Slot::ReservedByEviction(victim) = slot {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                victim = %victim.signature,
                container_id = %victim.handle.id,
                "Evicting warm container for a different signature"
            );
            self.destroy_container(&victim).await;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let handle = match self.runtime.create(signature).await {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.lock().await.forget(signature);
                self.capacity_freed.notify_waiters();
                return Err(e);
            }
        };
        let cold_start = started.elapsed();
        self.created.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let container = PooledContainer {
            handle,
            signature: signature.clone(),
            state: ContainerState::InUse,
            created_at: now,
            last_used_at: now,
            use_count: 1,
            cold_start: Some(cold_start),
        };
        self.inner
            .lock()
            .await
            .in_use
            .insert(container.handle.id.clone(), container.clone());
        debug!(container_id = %container.handle.id, ?cold_start, "Pool miss, created container");
        Ok(container)
    }

    /// Return a borrowed container. Healthy containers go back to Warm;
    /// unhealthy or worn-out ones are destroyed. Releasing a container that
    /// is not currently borrowed does nothing.
    pub async fn release(&self, container: &PooledContainer, healthy: bool) {
        let retired = {
            let mut inner = self.inner.lock().await;
            let Some(mut pooled) = inner.in_use.remove(container.id()) else {
                debug!(container_id = %container.id(), "Release of container not in use, ignoring");
                return;
            };

            let worn_out = pooled.use_count >= self.config.max_use_count;
            if healthy && !worn_out && !self.closed.load(Ordering::Acquire) {
                pooled.state = ContainerState::Warm;
                pooled.last_used_at = Instant::now();
                pooled.cold_start = None;
                inner
                    .warm
                    .entry(pooled.signature.clone())
                    .or_default()
                    .push_back(pooled);
                None
            } else {
                pooled.state = ContainerState::Draining;
                Some(pooled)
            }
        };

        match retired {
            None => self.capacity_freed.notify_waiters(),
            Some(pooled) => {
                debug!(
                    container_id = %pooled.handle.id,
                    healthy,
                    use_count = pooled.use_count,
                    "Retiring container"
                );
                self.retire(pooled).await;
            }
        }
    }

    /// Drop a borrowed container the runtime has already destroyed.
    pub async fn discard(&self, container: &PooledContainer) {
        let removed = {
            let mut inner = self.inner.lock().await;
            let removed = inner.in_use.remove(container.id());
            if let Some(pooled) = &removed {
                inner.forget(&pooled.signature);
            }
            removed
        };
        if removed.is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.capacity_freed.notify_waiters();
        }
    }

    /// Pre-create up to `count` idle containers for `signature`, bounded by
    /// the caps. Returns the creation time of each container made.
    #[instrument(skip(self, signature), fields(signature = %signature))]
    pub async fn warm(&self, signature: &FunctionSignature, count: usize) -> Result<Vec<Duration>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FaasError::ShuttingDown);
        }

        let reserved = {
            let mut inner = self.inner.lock().await;
            let room_sig = self
                .config
                .max_per_signature
                .saturating_sub(inner.count(signature));
            let room_total = self.config.max_total.saturating_sub(inner.total);
            let reserved = count.min(room_sig).min(room_total);
            for _ in 0..reserved {
                inner.reserve(signature);
            }
            reserved
        };
        if reserved < count {
            warn!(requested = count, reserved, "Warm-up limited by pool caps");
        }

        let creations = (0..reserved).map(|_| async move {
            let started = Instant::now();
            self.runtime
                .create(signature)
                .await
                .map(|handle| (handle, started.elapsed()))
        });
        let results = futures::future::join_all(creations).await;

        let mut durations = Vec::with_capacity(reserved);
        let mut first_error = None;
        {
            let mut inner = self.inner.lock().await;
            for result in results {
                match result {
                    Ok((handle, elapsed)) => {
                        let now = Instant::now();
                        inner
                            .warm
                            .entry(signature.clone())
                            .or_default()
                            .push_back(PooledContainer {
                                handle,
                                signature: signature.clone(),
                                state: ContainerState::Warm,
                                created_at: now,
                                last_used_at: now,
                                use_count: 0,
                                cold_start: None,
                            });
                        durations.push(elapsed);
                    }
                    Err(e) => {
                        error!(error = %e, "Warm-up creation failed");
                        inner.forget(signature);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        self.created
            .fetch_add(durations.len() as u64, Ordering::Relaxed);
        self.capacity_freed.notify_waiters();

        match first_error {
            Some(e) if durations.is_empty() => Err(e),
            _ => {
                info!(created = durations.len(), "Warm-up complete");
                Ok(durations)
            }
        }
    }

    /// Destroy warm containers idle for at least `idle_ttl`.
    pub async fn reap_idle(&self) -> usize {
        let ttl = self.config.idle_ttl;
        let expired: Vec<PooledContainer> = {
            let mut inner = self.inner.lock().await;
            let mut expired = Vec::new();
            for deque in inner.warm.values_mut() {
                // Front holds the least recently used.
                while deque
                    .front()
                    .is_some_and(|c| c.last_used_at.elapsed() >= ttl)
                {
                    if let Some(mut c) = deque.pop_front() {
                        c.state = ContainerState::Draining;
                        expired.push(c);
                    }
                }
            }
            inner.warm.retain(|_, deque| !deque.is_empty());
            expired
        };

        let reaped = expired.len();
        for container in expired {
            debug!(container_id = %container.handle.id, "Reaping idle container");
            self.retire(container).await;
        }
        if reaped > 0 {
            info!(reaped, "Idle containers reaped");
        }
        reaped
    }

    pub fn spawn_reaper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.reap_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Idle reaper stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        pool.reap_idle().await;
                    }
                }
            }
        })
    }

    /// Stop accepting new containers and destroy every warm one. Containers
    /// still borrowed are destroyed when released.
    pub async fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let warm: Vec<PooledContainer> = {
            let mut inner = self.inner.lock().await;
            inner
                .warm
                .drain()
                .flat_map(|(_, deque)| deque.into_iter())
                .collect()
        };
        let drained = warm.len();
        for mut container in warm {
            container.state = ContainerState::Draining;
            self.retire(container).await;
        }
        info!(drained, "Pool drained");
        drained
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let per_signature = inner
            .per_signature
            .keys()
            .map(|sig| signature_stats_locked(&inner, sig))
            .collect();
        PoolStats {
            warm: inner.warm_len(),
            in_use: inner.in_use.len(),
            total: inner.total,
            per_signature,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub async fn signature_stats(&self, signature: &FunctionSignature) -> SignatureStats {
        let inner = self.inner.lock().await;
        signature_stats_locked(&inner, signature)
    }

    /// Destroy a container that is still counted, then free its slot.
    async fn retire(&self, container: PooledContainer) {
        self.destroy_container(&container).await;
        self.inner.lock().await.forget(&container.signature);
        self.capacity_freed.notify_waiters();
    }

    async fn destroy_container(&self, container: &PooledContainer) {
        if let Err(e) = self.runtime.destroy(&container.handle).await {
            error!(container_id = %container.handle.id, error = %e, "Failed to destroy container");
        }
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

fn signature_stats_locked(inner: &PoolInner, signature: &FunctionSignature) -> SignatureStats {
    SignatureStats {
        signature: signature.to_string(),
        warm: inner.warm.get(signature).map_or(0, VecDeque::len),
        in_use: inner
            .in_use
            .values()
            .filter(|c| &c.signature == signature)
            .count(),
        total: inner.count(signature),
    }
}
