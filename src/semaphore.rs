use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Semaphore;

/// Error returned by [`DynamicSemaphore::set_capacity`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum CapacityError {
    /// The requested capacity exceeds the maximum, or the pool refused a
    /// deposit because it already holds the maximum number of tokens.
    #[error("failed to add all capacity to the semaphore")]
    Add,
    /// The requested capacity is negative.
    #[error("the capacity that is released must be <= to added capacity")]
    Reduce,
}

/// Error returned by [`DynamicSemaphore::release`] when more tokens were
/// returned than were handed out.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("returned tokens must be <= acquired tokens")]
pub struct ReleaseError;

#[derive(Debug)]
struct State {
    /// Number of tokens currently in the rotation, held or idle.
    capacity: u32,
    /// Pending capacity reductions, consumed by releases instead of
    /// returning tokens to the pool.
    reducers: u32,
}

impl State {
    fn effective(&self) -> u32 {
        self.capacity - self.reducers
    }
}

/// A counting semaphore whose capacity can be moved up or down while tokens
/// are outstanding.
///
/// Idle tokens live in a pool; a token leaves the pool on acquire and
/// returns on release. Lowering the capacity below the number of idle
/// tokens pulls the excess out of the pool immediately. When the remaining
/// tokens are all held, the shrink is recorded as a reducer and realized by
/// the next releases, so capacity adjustments never wait on in-flight work.
#[derive(Debug)]
pub struct DynamicSemaphore {
    pool: Semaphore,
    state: Mutex<State>,
    max_capacity: u32,
}

impl DynamicSemaphore {
    /// Create a semaphore with the desired maximal and initial capacity.
    ///
    /// # Panics
    ///
    /// Panics if `initial_capacity` exceeds `max_capacity`.
    pub fn new(max_capacity: u32, initial_capacity: u32) -> Self {
        assert!(
            initial_capacity <= max_capacity,
            "initial capacity must be between 0 and maximal capacity, got {initial_capacity}"
        );

        Self {
            pool: Semaphore::new(initial_capacity as usize),
            state: Mutex::new(State {
                capacity: initial_capacity,
                reducers: 0,
            }),
            max_capacity,
        }
    }

    /// Wait for a token and take it out of the pool.
    ///
    /// Waiters are served in FIFO order. Dropping the returned future before
    /// it resolves abandons the wait without consuming a token.
    pub fn acquire(self: &Arc<Self>) -> impl Future<Output = Token> + Send + 'static {
        let sem = Arc::clone(self);

        async move {
            let permit = sem.pool.acquire().await.expect("token pool is never closed");
            // Accounting is by count; the token returns through `release`,
            // where it may be absorbed by a pending reducer instead.
            permit.forget();

            Token { sem }
        }
    }

    /// Return a previously acquired token. Never blocks.
    ///
    /// If the capacity was reduced in the meantime and the reduction is not
    /// yet reflected, the token is removed from the rotation instead of
    /// going back to the pool.
    pub fn release(&self) -> Result<(), ReleaseError> {
        let mut state = self.state.lock().expect("semaphore state lock is poisoned");

        if state.reducers > 0 {
            state.capacity -= 1;
            state.reducers -= 1;
            return Ok(());
        }

        // A pool already holding `max_capacity` tokens cannot take another
        // one; the caller released more than it acquired.
        if self.pool.available_permits() >= self.max_capacity as usize {
            return Err(ReleaseError);
        }

        self.pool.add_permits(1);
        Ok(())
    }

    /// Reconcile the effective capacity toward `size`.
    ///
    /// Raising the capacity cancels pending reducers before minting fresh
    /// tokens. Lowering it extracts idle tokens from the pool while they
    /// last and defers the rest to upcoming releases.
    pub fn set_capacity(&self, size: i32) -> Result<(), CapacityError> {
        let target = u32::try_from(size).map_err(|_| CapacityError::Reduce)?;

        let mut state = self.state.lock().expect("semaphore state lock is poisoned");

        if state.effective() == target {
            return Ok(());
        }

        if target > self.max_capacity {
            return Err(CapacityError::Add);
        }

        while state.effective() < target {
            if state.reducers > 0 {
                state.reducers -= 1;
            } else if self.pool.available_permits() >= self.max_capacity as usize {
                // The pool holds more tokens than `capacity` accounts for,
                // which means releases have outnumbered acquires.
                return Err(CapacityError::Add);
            } else {
                self.pool.add_permits(1);
                state.capacity += 1;
            }
        }

        while state.effective() > target {
            match self.pool.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    state.capacity -= 1;
                }
                // All remaining tokens are held; realize the shrink on
                // release.
                Err(_) => state.reducers += 1,
            }
        }

        trace!(
            message = "Updated semaphore capacity",
            capacity = state.capacity,
            reducers = state.reducers
        );

        Ok(())
    }

    /// The effective capacity, with pending reducers taken into account.
    pub fn capacity(&self) -> u32 {
        self.state
            .lock()
            .expect("semaphore state lock is poisoned")
            .effective()
    }

    #[cfg(test)]
    pub(crate) fn idle_tokens(&self) -> usize {
        self.pool.available_permits()
    }

    #[cfg(test)]
    pub(crate) fn pending_reducers(&self) -> u32 {
        self.state.lock().unwrap().reducers
    }
}

/// Permission to run one unit of work, returned to its semaphore on drop.
///
/// A failed release indicates a token bookkeeping violation; it is logged
/// and does not propagate.
#[derive(Debug)]
pub struct Token {
    sem: Arc<DynamicSemaphore>,
}

impl Drop for Token {
    fn drop(&mut self) {
        if let Err(err) = self.sem.release() {
            error!(message = "Error while releasing a token", %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use tokio::sync::Barrier;
    use tokio::task::JoinSet;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[test]
    fn grow_while_idle() {
        let sem = DynamicSemaphore::new(5, 1);
        assert_eq!(sem.capacity(), 1);

        assert_eq!(sem.set_capacity(3), Ok(()));
        assert_eq!(sem.capacity(), 3);
        assert_eq!(sem.idle_tokens(), 3);
    }

    #[test]
    fn shrink_while_idle() {
        let sem = DynamicSemaphore::new(5, 3);

        assert_eq!(sem.set_capacity(1), Ok(()));
        assert_eq!(sem.capacity(), 1);
        assert_eq!(sem.idle_tokens(), 1);
        assert_eq!(sem.pending_reducers(), 0);
    }

    #[test]
    fn set_capacity_is_idempotent() {
        let sem = DynamicSemaphore::new(5, 1);

        assert_eq!(sem.set_capacity(3), Ok(()));
        assert_eq!(sem.set_capacity(3), Ok(()));
        assert_eq!(sem.capacity(), 3);
        assert_eq!(sem.idle_tokens(), 3);
    }

    #[test]
    fn rejects_out_of_range_targets() {
        let sem = DynamicSemaphore::new(2, 1);

        assert_eq!(sem.set_capacity(3), Err(CapacityError::Add));
        assert_eq!(sem.capacity(), 1);
        assert_eq!(sem.idle_tokens(), 1);

        assert_eq!(sem.set_capacity(-1), Err(CapacityError::Reduce));
        assert_eq!(sem.capacity(), 1);
        assert_eq!(sem.idle_tokens(), 1);
    }

    #[test]
    fn release_without_acquire() {
        let sem = DynamicSemaphore::new(1, 1);

        assert_eq!(sem.release(), Err(ReleaseError));
        assert_eq!(sem.capacity(), 1);
        assert_eq!(sem.idle_tokens(), 1);
    }

    #[test]
    #[should_panic(expected = "initial capacity must be between 0 and maximal capacity")]
    fn initial_capacity_above_maximum() {
        DynamicSemaphore::new(1, 2);
    }

    #[tokio::test]
    async fn shrink_with_all_tokens_held() {
        let sem = Arc::new(DynamicSemaphore::new(5, 3));

        let first = sem.acquire().await;
        let second = sem.acquire().await;
        let third = sem.acquire().await;

        assert_eq!(sem.set_capacity(1), Ok(()));
        assert_eq!(sem.capacity(), 1);
        assert_eq!(sem.pending_reducers(), 2);

        // The first two releases are absorbed by the pending reducers and
        // never reach the pool.
        drop(first);
        assert_eq!(sem.idle_tokens(), 0);
        assert_eq!(sem.pending_reducers(), 1);

        drop(second);
        assert_eq!(sem.idle_tokens(), 0);
        assert_eq!(sem.pending_reducers(), 0);

        drop(third);
        assert_eq!(sem.idle_tokens(), 1);
        assert_eq!(sem.capacity(), 1);
    }

    #[tokio::test]
    async fn grow_cancels_pending_reducers() {
        let sem = Arc::new(DynamicSemaphore::new(5, 2));

        let first = sem.acquire().await;
        let second = sem.acquire().await;

        assert_eq!(sem.set_capacity(0), Ok(()));
        assert_eq!(sem.pending_reducers(), 2);

        // Growing back restores the held tokens instead of minting new ones.
        assert_eq!(sem.set_capacity(2), Ok(()));
        assert_eq!(sem.pending_reducers(), 0);
        assert_eq!(sem.capacity(), 2);
        assert_eq!(sem.idle_tokens(), 0);

        drop(first);
        drop(second);
        assert_eq!(sem.idle_tokens(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_capacity() {
        let sem = Arc::new(DynamicSemaphore::new(1, 0));

        let mut acquire = task::spawn(sem.acquire());
        assert_pending!(acquire.poll());

        assert_eq!(sem.set_capacity(1), Ok(()));
        assert!(acquire.is_woken());
        let _token = assert_ready!(acquire.poll());
        assert_eq!(sem.idle_tokens(), 0);
    }

    #[tokio::test]
    async fn abandoned_acquire_consumes_nothing() {
        let sem = Arc::new(DynamicSemaphore::new(1, 0));

        let mut acquire = task::spawn(sem.acquire());
        assert_pending!(acquire.poll());
        drop(acquire);

        assert_eq!(sem.set_capacity(1), Ok(()));
        assert_eq!(sem.idle_tokens(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_capacity_churn() {
        const TASKS: usize = 16;
        const OPS_PER_TASK: usize = 200;
        const MAX_CAPACITY: u32 = 8;

        let sem = Arc::new(DynamicSemaphore::new(MAX_CAPACITY, 4));
        let barrier = Arc::new(Barrier::new(TASKS));
        let mut tasks = JoinSet::new();

        for seed in 0..TASKS {
            let sem = Arc::clone(&sem);
            let barrier = Arc::clone(&barrier);
            let mut rng = SmallRng::seed_from_u64(seed as u64);

            tasks.spawn(async move {
                barrier.wait().await;

                for _ in 0..OPS_PER_TASK {
                    if rng.gen_bool(0.2) {
                        // A zero target with every task parked in acquire
                        // would never recover, so stay above it.
                        let target = rng.gen_range(1..=MAX_CAPACITY as i32);
                        sem.set_capacity(target).unwrap();
                    }

                    let token = sem.acquire().await;
                    tokio::time::sleep(Duration::from_micros(50)).await;
                    drop(token);

                    assert!(sem.capacity() <= MAX_CAPACITY);
                }
            });
        }

        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        // With no tokens outstanding every pending shrink has been
        // absorbed and the pool holds exactly the remaining capacity.
        assert_eq!(sem.pending_reducers(), 0);
        assert_eq!(sem.idle_tokens(), sem.capacity() as usize);
    }
}
