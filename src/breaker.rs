use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::semaphore::{CapacityError, DynamicSemaphore, Token};

/// Parameters of the breaker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerParams {
    /// Number of invocations that may wait for their turn, in addition to
    /// the ones actively running.
    pub queue_depth: u32,

    /// Hard ceiling on the number of concurrently running invocations.
    pub max_concurrency: u32,

    /// Concurrency ceiling to start with.
    pub initial_capacity: u32,
}

impl Default for BreakerParams {
    fn default() -> Self {
        BreakerParams::const_default()
    }
}

impl BreakerParams {
    pub const fn const_default() -> Self {
        Self {
            queue_depth: 10,
            max_concurrency: 1,
            initial_capacity: 1,
        }
    }
}

/// Enforces a concurrency limit on the execution of caller-supplied work
/// and maintains a bounded queue of executions in excess of that limit.
/// Attempts beyond the capacity of the queue are rejected immediately.
///
/// The limit can be retuned at any time through [`Breaker::set_capacity`]
/// without interrupting work already admitted.
#[derive(Debug)]
pub struct Breaker {
    pending: Arc<Semaphore>,
    sem: Arc<DynamicSemaphore>,
}

impl Breaker {
    /// Create a breaker with the desired queue depth, concurrency limit and
    /// initial capacity.
    ///
    /// # Panics
    ///
    /// Panics if `queue_depth` is zero or `initial_capacity` exceeds
    /// `max_concurrency`.
    pub fn new(params: BreakerParams) -> Self {
        assert!(
            params.queue_depth > 0,
            "queue depth must be greater than 0, got {}",
            params.queue_depth
        );
        assert!(
            params.initial_capacity <= params.max_concurrency,
            "initial capacity must be between 0 and max concurrency, got {}",
            params.initial_capacity
        );

        // Running invocations keep their pending slot until they finish,
        // so the queue is sized to hold the active set on top of the
        // configured depth.
        let slots = (params.queue_depth + params.max_concurrency) as usize;

        Self {
            pending: Arc::new(Semaphore::new(slots)),
            sem: Arc::new(DynamicSemaphore::new(
                params.max_concurrency,
                params.initial_capacity,
            )),
        }
    }

    /// Conditionally execute `thunk` based on the breaker's concurrency and
    /// queue limits. If both are already consumed, `None` is returned
    /// immediately and `thunk` is never invoked. Otherwise the call waits
    /// for capacity, runs `thunk` and hands back its output.
    ///
    /// Dropping the returned future abandons the attempt and returns
    /// whatever slot or token it held.
    pub async fn try_run<F, Fut, T>(&self, thunk: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.reserve_slot()?;
        let _token = self.sem.acquire().await;

        Some(thunk().await)
    }

    /// Update the maximum number of in-flight invocations.
    pub fn set_capacity(&self, size: i32) -> Result<(), CapacityError> {
        self.sem.set_capacity(size)
    }

    /// The number of in-flight invocations currently allowed.
    pub fn capacity(&self) -> u32 {
        self.sem.capacity()
    }

    pub(crate) fn reserve_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.pending).try_acquire_owned().ok()
    }

    pub(crate) fn acquire_token(&self) -> impl Future<Output = Token> + Send + 'static {
        self.sem.acquire()
    }
}
