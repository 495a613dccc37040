use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures_util::future::BoxFuture;
use tokio::sync::OwnedSemaphorePermit;
use tower::Service;

use crate::breaker::Breaker;
use crate::future::ResponseFuture;
use crate::semaphore::Token;

enum State {
    /// A pending-queue slot is held while the token acquisition runs.
    Waiting(BoxFuture<'static, Token>, OwnedSemaphorePermit),
    Ready(Token, OwnedSemaphorePermit),
    /// The pending queue was full; the next call fails fast.
    Shedding,
    Empty,
}

/// Enforces a [`Breaker`]'s admission and concurrency limits on the
/// underlying service.
///
/// Requests beyond the pending-queue bound fail fast with an
/// [`Overloaded`](crate::Overloaded) error instead of exerting
/// backpressure; admitted requests wait in `poll_ready` until a token
/// frees up.
pub struct BreakerLimit<S> {
    inner: S,
    breaker: Arc<Breaker>,
    state: State,
}

impl<S> BreakerLimit<S> {
    /// Wrap `inner` with the admission gate of `breaker`.
    pub fn new(inner: S, breaker: Arc<Breaker>) -> Self {
        BreakerLimit {
            inner,
            breaker,
            state: State::Empty,
        }
    }
}

impl<S, R> Service<R> for BreakerLimit<S>
where
    S: Service<R>,
    S::Error: Into<crate::Error>,
{
    type Response = S::Response;
    type Error = crate::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        // A full queue seen by an earlier probe may have drained since.
        if matches!(self.state, State::Shedding) {
            self.state = State::Empty;
        }

        loop {
            match self.state {
                State::Ready(..) => return self.inner.poll_ready(cx).map_err(Into::into),
                State::Waiting(ref mut acquire, _) => {
                    let token = ready!(acquire.as_mut().poll(cx));
                    let State::Waiting(_, slot) = mem::replace(&mut self.state, State::Empty)
                    else {
                        unreachable!()
                    };
                    self.state = State::Ready(token, slot);
                }
                State::Empty => match self.breaker.reserve_slot() {
                    Some(slot) => {
                        let acquire = Box::pin(self.breaker.acquire_token());
                        self.state = State::Waiting(acquire, slot);
                    }
                    None => {
                        // Report readiness so the rejection surfaces as an
                        // error on the call rather than backpressure.
                        self.state = State::Shedding;
                        return Poll::Ready(Ok(()));
                    }
                },
                State::Shedding => unreachable!("shedding state is cleared on entry"),
            }
        }
    }

    fn call(&mut self, req: R) -> Self::Future {
        match mem::replace(&mut self.state, State::Empty) {
            State::Ready(token, slot) => ResponseFuture::new(self.inner.call(req), token, slot),
            State::Shedding => ResponseFuture::overloaded(),
            State::Empty | State::Waiting(..) => {
                panic!("breaker readiness not established; poll_ready must be called first")
            }
        }
    }
}

impl<S> Clone for BreakerLimit<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        BreakerLimit {
            inner: self.inner.clone(),
            breaker: Arc::clone(&self.breaker),
            state: State::Empty,
        }
    }
}

impl Debug for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Waiting(..) => f
                .debug_tuple("State::Waiting")
                .field(&format_args!("..."))
                .finish(),
            State::Ready(ref token, _) => f.debug_tuple("State::Ready").field(token).finish(),
            State::Shedding => f.debug_tuple("State::Shedding").finish(),
            State::Empty => f.debug_tuple("State::Empty").finish(),
        }
    }
}
