//! Predictor Pool
//!
//! Hands out exclusive, ready-to-use predictor instances minted from one
//! [`ModelHandle`], bounding how many native inference contexts are live
//! at once. Predictors are expensive (mapped weights, device contexts)
//! and not safe for concurrent use, so callers check one out, run
//! inference, and return it.
//!
//! The bookkeeping is a single explicit state machine: an idle vec plus
//! an outstanding ticket set behind one mutex, with a semaphore gating
//! capacity. `outstanding + idle <= max_size` holds at every instant.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;

use super::model::{ModelHandle, Predictor};

/// Health check run when an instance comes back to the pool. Returning
/// `false` retires the instance; the slot is freed for a future mint.
pub type Validator<P> = Box<dyn Fn(&mut P) -> bool + Send + Sync>;

/// Pool sizing and timeout options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum concurrently-live predictor instances.
    pub max_size: usize,
    /// Default wait for `acquire`. `None` waits indefinitely,
    /// `Some(Duration::ZERO)` is a non-blocking try-acquire.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_size: cores.min(4),
            acquire_timeout: None,
        }
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

struct PoolState<P> {
    idle: Vec<P>,
    outstanding: HashSet<u64>,
    next_ticket: u64,
    closing: bool,
}

struct PoolInner<M: ModelHandle> {
    handle: M,
    max_size: usize,
    acquire_timeout: Option<Duration>,
    /// Gates the total number of live instances; a permit is a slot.
    slots: Semaphore,
    state: Mutex<PoolState<M::Predictor>>,
    /// Signalled when the last outstanding lease comes home during shutdown.
    drained: Notify,
    validator: Option<Validator<M::Predictor>>,
}

/// Bounded pool of predictor instances backed by one model.
///
/// Cheap to clone; clones share the same pool.
pub struct PredictorPool<M: ModelHandle> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ModelHandle> Clone for PredictorPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Exclusive checkout of one predictor instance.
///
/// Dereferences to the predictor. Dropping the lease returns the instance
/// to the pool; a lease marked broken is destroyed instead. Move semantics
/// make a double release impossible.
pub struct Lease<M: ModelHandle> {
    predictor: Option<M::Predictor>,
    ticket: u64,
    pool: Arc<PoolInner<M>>,
    broken: bool,
}

impl<M: ModelHandle> std::fmt::Debug for Lease<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("ticket", &self.ticket)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<M: ModelHandle> Lease<M> {
    /// Report this instance unusable (e.g. it failed mid-inference). It
    /// is destroyed on release rather than returned to the idle set; the
    /// slot stays available for a future mint.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ModelHandle> Deref for Lease<M> {
    type Target = M::Predictor;

    fn deref(&self) -> &Self::Target {
        self.predictor.as_ref().expect("lease already released")
    }
}

impl<M: ModelHandle> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.predictor.as_mut().expect("lease already released")
    }
}

impl<M: ModelHandle> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(predictor) = self.predictor.take() {
            self.pool.give_back(self.ticket, predictor, self.broken);
        }
    }
}

impl<M: ModelHandle> PredictorPool<M> {
    /// Create a pool over a loaded model.
    pub fn new(handle: M, options: PoolOptions) -> Self {
        Self::build(handle, options, None)
    }

    /// Create a pool with a health check applied on every release.
    pub fn with_validator<F>(handle: M, options: PoolOptions, validator: F) -> Self
    where
        F: Fn(&mut M::Predictor) -> bool + Send + Sync + 'static,
    {
        Self::build(handle, options, Some(Box::new(validator)))
    }

    fn build(handle: M, options: PoolOptions, validator: Option<Validator<M::Predictor>>) -> Self {
        let max_size = options.max_size.max(1);
        info!(
            model = %handle.info().name,
            max_size,
            "predictor pool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                handle,
                max_size,
                acquire_timeout: options.acquire_timeout,
                slots: Semaphore::new(max_size),
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(max_size),
                    outstanding: HashSet::with_capacity(max_size),
                    next_ticket: 0,
                    closing: false,
                }),
                drained: Notify::new(),
                validator,
            }),
        }
    }

    /// Check out a predictor using the pool's configured timeout.
    pub async fn acquire(&self) -> Result<Lease<M>, PoolError> {
        self.acquire_with(self.inner.acquire_timeout).await
    }

    /// Check out a predictor, waiting at most `wait` for a slot.
    ///
    /// `Some(Duration::ZERO)` never blocks; `None` waits indefinitely.
    /// An idle instance is reused when one exists, otherwise a fresh one
    /// is minted (outside the state lock). Minting failure frees the slot
    /// and surfaces as [`PoolError::CreationFailed`]; the next `acquire`
    /// retries.
    pub async fn acquire_with(&self, wait: Option<Duration>) -> Result<Lease<M>, PoolError> {
        let start = Instant::now();
        let permit = match wait {
            Some(d) if d.is_zero() => match self.inner.slots.try_acquire() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
                Err(TryAcquireError::NoPermits) => {
                    return Err(PoolError::Exhausted {
                        waited: Duration::ZERO,
                    })
                }
            },
            Some(d) => match timeout(d, self.inner.slots.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_closed)) => return Err(PoolError::Closed),
                Err(_elapsed) => {
                    return Err(PoolError::Exhausted {
                        waited: start.elapsed(),
                    })
                }
            },
            None => self
                .inner
                .slots
                .acquire()
                .await
                .map_err(|_closed| PoolError::Closed)?,
        };
        // The slot now belongs to this checkout; it is handed back in
        // give_back (or below on mint failure).
        permit.forget();

        let (ticket, reused) = {
            let mut state = self.inner.state.lock();
            if state.closing {
                drop(state);
                self.inner.slots.add_permits(1);
                return Err(PoolError::Closed);
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.outstanding.insert(ticket);
            (ticket, state.idle.pop())
        };

        let predictor = match reused {
            Some(predictor) => predictor,
            None => match self.inner.handle.new_predictor() {
                Ok(predictor) => {
                    debug!(model = %self.inner.handle.info().name, "minted predictor instance");
                    predictor
                }
                Err(err) => {
                    let mut state = self.inner.state.lock();
                    state.outstanding.remove(&ticket);
                    drop(state);
                    self.inner.slots.add_permits(1);
                    return Err(PoolError::CreationFailed(err));
                }
            },
        };

        Ok(Lease {
            predictor: Some(predictor),
            ticket,
            pool: self.inner.clone(),
            broken: false,
        })
    }

    /// Explicitly return a lease to the pool.
    ///
    /// Dropping the lease has the same effect; this form additionally
    /// reports [`PoolError::InvalidRelease`] when the lease belongs to a
    /// different pool (the lease still goes home to its owner).
    pub fn release(&self, lease: Lease<M>) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&lease.pool, &self.inner) {
            drop(lease);
            return Err(PoolError::InvalidRelease);
        }
        drop(lease);
        Ok(())
    }

    /// Return a lease and destroy its instance regardless of health.
    pub fn discard(&self, mut lease: Lease<M>) -> Result<(), PoolError> {
        lease.mark_broken();
        self.release(lease)
    }

    /// Shut the pool down: fail new acquires with [`PoolError::Closed`],
    /// wait up to `grace` for outstanding checkouts, then destroy every
    /// idle instance and close the model handle. Leases returned after
    /// shutdown are destroyed, never pooled.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
        }
        self.inner.slots.close();
        info!(model = %self.inner.handle.info().name, "predictor pool shutting down");

        let deadline = Instant::now() + grace;
        loop {
            let outstanding = self.inner.state.lock().outstanding.len();
            if outstanding == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    outstanding,
                    "shutdown grace elapsed with leases still checked out"
                );
                break;
            }
            let _ = timeout(remaining, self.inner.drained.notified()).await;
        }

        let idle = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.idle)
        };
        for mut predictor in idle {
            predictor.close();
        }
        self.inner.handle.close();
        info!(model = %self.inner.handle.info().name, "predictor pool closed");
    }

    /// Number of instances currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding.len()
    }

    /// Number of instances parked in the idle set.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closing
    }
}

impl<M: ModelHandle> PoolInner<M> {
    fn give_back(&self, ticket: u64, mut predictor: M::Predictor, broken: bool) {
        let closing = {
            let mut state = self.state.lock();
            if !state.outstanding.remove(&ticket) {
                // Unknown ticket: the lease was already reclaimed. A
                // defect in the caller; destroy the instance and leave
                // the counters alone.
                drop(state);
                warn!("release of an unknown lease ticket");
                predictor.close();
                return;
            }
            state.closing
        };

        let keep = !broken
            && !closing
            && self
                .validator
                .as_ref()
                .map_or(true, |validate| validate(&mut predictor));

        if keep {
            self.state.lock().idle.push(predictor);
        } else {
            predictor.close();
            if broken {
                info!(model = %self.handle.info().name, "retired broken predictor instance");
            } else if !closing {
                info!(model = %self.handle.info().name, "retired predictor instance failing validation");
            }
        }

        self.slots.add_permits(1);

        let drained = {
            let state = self.state.lock();
            state.closing && state.outstanding.is_empty()
        };
        if drained {
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use ndarray::{ArrayD, ArrayViewD};

    use crate::engine::model::{Device, ModelInfo};
    use crate::error::PredictorError;

    use super::*;

    struct StubPredictor {
        closed: Arc<AtomicUsize>,
    }

    impl Predictor for StubPredictor {
        fn infer(&mut self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, PredictorError> {
            Ok(input.to_owned() * 2.0)
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubModel {
        info: ModelInfo,
        minted: AtomicUsize,
        fail_mint: AtomicBool,
        predictor_closed: Arc<AtomicUsize>,
        model_closed: AtomicBool,
    }

    impl StubModel {
        fn new() -> Self {
            Self {
                info: ModelInfo {
                    name: "stub".to_string(),
                    input_shape: vec![1, 4],
                    device: Device::Cpu,
                },
                minted: AtomicUsize::new(0),
                fail_mint: AtomicBool::new(false),
                predictor_closed: Arc::new(AtomicUsize::new(0)),
                model_closed: AtomicBool::new(false),
            }
        }
    }

    impl ModelHandle for Arc<StubModel> {
        type Predictor = StubPredictor;

        fn info(&self) -> &ModelInfo {
            &self.info
        }

        fn new_predictor(&self) -> Result<StubPredictor, PredictorError> {
            if self.fail_mint.load(Ordering::SeqCst) {
                return Err(PredictorError::new("device unavailable"));
            }
            self.minted.fetch_add(1, Ordering::SeqCst);
            Ok(StubPredictor {
                closed: self.predictor_closed.clone(),
            })
        }

        fn close(&self) {
            self.model_closed.store(true, Ordering::SeqCst);
        }
    }

    fn pool_of(model: &Arc<StubModel>, max_size: usize) -> PredictorPool<Arc<StubModel>> {
        PredictorPool::new(
            model.clone(),
            PoolOptions {
                max_size,
                acquire_timeout: None,
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_and_infer() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 2);

        let mut lease = pool.acquire().await.unwrap();
        let input = ArrayD::from_shape_vec(vec![2], vec![1.0f32, 2.0]).unwrap();
        let output = lease.infer(input.view()).unwrap();
        assert_eq!(output.as_slice().unwrap(), &[2.0, 4.0]);
        assert_eq!(pool.outstanding(), 1);

        pool.release(lease).unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_with_zero_timeout() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 2);

        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.outstanding(), 2);

        let err = pool.acquire_with(Some(Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        // Counters untouched by the failed attempt.
        assert_eq!(pool.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_after_bounded_wait() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 1);

        let _held = pool.acquire().await.unwrap();
        let start = Instant::now();
        let err = pool
            .acquire_with(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 1);

        let lease = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_with(Some(Duration::from_secs(5))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(lease).unwrap();

        let lease = waiter.await.unwrap().unwrap();
        drop(lease);
        // Only one instance was ever minted.
        assert_eq!(model.minted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_instance_reused() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 4);

        let lease = pool.acquire().await.unwrap();
        drop(lease);
        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(model.minted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_creation_failure_frees_slot() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 1);

        model.fail_mint.store(true, Ordering::SeqCst);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::CreationFailed(_)));
        assert_eq!(pool.outstanding(), 0);

        // Next acquire retries the mint.
        model.fail_mint.store(false, Ordering::SeqCst);
        let lease = pool.acquire().await.unwrap();
        drop(lease);
    }

    #[tokio::test]
    async fn test_broken_instance_destroyed() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 2);

        let mut lease = pool.acquire().await.unwrap();
        lease.mark_broken();
        drop(lease);

        assert_eq!(pool.idle(), 0);
        assert_eq!(model.predictor_closed.load(Ordering::SeqCst), 1);

        // Slot is free for a fresh mint.
        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(model.minted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_validator_retires_instance() {
        let model = Arc::new(StubModel::new());
        let pool = PredictorPool::with_validator(
            model.clone(),
            PoolOptions {
                max_size: 2,
                acquire_timeout: None,
            },
            |_p: &mut StubPredictor| false,
        );

        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(pool.idle(), 0);
        assert_eq!(model.predictor_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_release_across_pools() {
        let model_a = Arc::new(StubModel::new());
        let model_b = Arc::new(StubModel::new());
        let pool_a = pool_of(&model_a, 1);
        let pool_b = pool_of(&model_b, 1);

        let lease = pool_a.acquire().await.unwrap();
        let err = pool_b.release(lease).unwrap_err();
        assert!(matches!(err, PoolError::InvalidRelease));

        // The wrong-pool release never corrupted either count: the lease
        // went home to its owner.
        assert_eq!(pool_a.outstanding(), 0);
        assert_eq!(pool_a.idle(), 1);
        assert_eq!(pool_b.outstanding(), 0);
        assert_eq!(pool_b.idle(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 2);

        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(pool.idle(), 1);

        pool.shutdown(Duration::from_millis(100)).await;
        assert!(pool.is_closed());
        assert_eq!(pool.idle(), 0);
        assert_eq!(model.predictor_closed.load(Ordering::SeqCst), 1);
        assert!(model.model_closed.load(Ordering::SeqCst));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_outstanding() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 1);

        let lease = pool.acquire().await.unwrap();
        let releaser = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                drop(lease);
                let _ = pool;
            })
        };

        pool.shutdown(Duration::from_secs(5)).await;
        releaser.await.unwrap();

        // The late lease was destroyed, not pooled.
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 0);
        assert_eq!(model.predictor_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_outstanding_never_exceeds_max() {
        let model = Arc::new(StubModel::new());
        let pool = pool_of(&model, 3);
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let peak = peak.clone();
            let live = live.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.idle() <= 3);
        assert!(model.minted.load(Ordering::SeqCst) <= 3);
    }
}
