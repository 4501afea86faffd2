//! Reject requests a limiter refuses to admit.

use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    TryFutureExt,
    future::{Either, MapErr, Ready, ready},
};
use tower::{BoxError, Layer, Service};

use super::{AdaptiveRateLimiter, FixedWindowLimiter, PermitPool, factory::LimiterHandle};

/// Non-blocking admission check shared by every limiter in this crate.
pub trait RateLimit: Send + Sync {
    /// Returns `true` and consumes a permit if the caller may proceed right now.
    fn try_acquire(&self) -> bool;
}

impl<P: PermitPool> RateLimit for AdaptiveRateLimiter<P> {
    fn try_acquire(&self) -> bool {
        AdaptiveRateLimiter::try_acquire(self)
    }
}

impl RateLimit for FixedWindowLimiter {
    fn try_acquire(&self) -> bool {
        self.tick()
    }
}

impl RateLimit for LimiterHandle {
    fn try_acquire(&self) -> bool {
        LimiterHandle::try_acquire(self)
    }
}

impl<T: RateLimit + ?Sized> RateLimit for Arc<T> {
    fn try_acquire(&self) -> bool {
        (**self).try_acquire()
    }
}

/// Returned by [`Admission`] when the limiter refused the request.
#[derive(Debug)]
pub struct Rejected;

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request rejected by rate limiter")
    }
}

impl std::error::Error for Rejected {}

/// Applies [`Admission`] to the wrapped service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer<L> {
    limiter: L,
}

impl<L> AdmissionLayer<L> {
    pub fn new(limiter: L) -> Self {
        Self { limiter }
    }
}

impl<S, L: Clone> Layer<S> for AdmissionLayer<L> {
    type Service = Admission<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        Admission {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Checks the limiter once per call and fails fast with [`Rejected`] instead of
/// queueing the request.
#[derive(Clone, Debug)]
pub struct Admission<S, L> {
    inner: S,
    limiter: L,
}

type ErrorInto<E> = fn(E) -> BoxError;

impl<S, L, Request> Service<Request> for Admission<S, L>
where
    S: Service<Request>,
    S::Error: Into<BoxError>,
    L: RateLimit,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Either<
        MapErr<S::Future, ErrorInto<S::Error>>,
        Ready<Result<S::Response, BoxError>>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        if self.limiter.try_acquire() {
            Either::Left(self.inner.call(request).map_err(Into::into as ErrorInto<S::Error>))
        } else {
            Either::Right(ready(Err(Rejected.into())))
        }
    }
}
