use std::sync::Arc;

use tower::Layer;

use crate::breaker::Breaker;
use crate::service::BreakerLimit;

/// Applies a shared [`Breaker`] to every wrapped service.
#[derive(Clone, Debug)]
pub struct BreakerLimitLayer {
    breaker: Arc<Breaker>,
}

impl BreakerLimitLayer {
    /// Create a new layer sharing `breaker` across the services it wraps.
    pub fn new(breaker: Arc<Breaker>) -> Self {
        BreakerLimitLayer { breaker }
    }
}

impl<S> Layer<S> for BreakerLimitLayer {
    type Service = BreakerLimit<S>;

    fn layer(&self, service: S) -> Self::Service {
        BreakerLimit::new(service, Arc::clone(&self.breaker))
    }
}
