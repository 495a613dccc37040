use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project::pin_project;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;

use crate::semaphore::Token;

/// The request was rejected because the pending queue is full.
#[derive(Clone, Copy, Debug, Error)]
#[error("pending queue is full, request rejected")]
pub struct Overloaded;

/// Future for the [`BreakerLimit`](crate::BreakerLimit) service.
///
/// Owns the token and the pending-queue slot backing the request so that
/// both are returned when the response completes or the future is dropped.
/// For a rejected request there is no inner future and polling resolves
/// immediately to an [`Overloaded`] error.
#[pin_project]
pub struct ResponseFuture<F> {
    #[pin]
    inner: Option<F>,
    // Keep these around so they are released when the future goes away.
    _token: Option<Token>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl<F> ResponseFuture<F> {
    pub(crate) fn new(inner: F, token: Token, slot: OwnedSemaphorePermit) -> Self {
        Self {
            inner: Some(inner),
            _token: Some(token),
            _slot: Some(slot),
        }
    }

    pub(crate) fn overloaded() -> Self {
        Self {
            inner: None,
            _token: None,
            _slot: None,
        }
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<crate::Error>,
{
    type Output = crate::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.inner.as_pin_mut() {
            Some(inner) => Poll::Ready(ready!(inner.poll(cx)).map_err(Into::into)),
            None => Poll::Ready(Err(Overloaded.into())),
        }
    }
}
