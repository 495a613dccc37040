//! Bounded admission control for request-path sidecars: a fail-fast pending
//! queue in front of a concurrency ceiling that can be retuned while work is
//! in flight.

mod breaker;
mod future;
mod layer;
mod semaphore;
mod service;

pub use breaker::{Breaker, BreakerParams};
pub use future::{Overloaded, ResponseFuture};
pub use layer::BreakerLimitLayer;
pub use semaphore::{CapacityError, DynamicSemaphore, ReleaseError, Token};
pub use service::BreakerLimit;

#[macro_use]
extern crate tracing;

/// Basic error type, dynamically dispatched and safe to send across threads.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Basic result type, defined in terms of [`Error`] and generic over `T`.
pub type Result<T> = std::result::Result<T, Error>;
