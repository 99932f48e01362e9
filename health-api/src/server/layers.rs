//! Inbound call layers
//!
//! Every call to the endpoint runs through [`RecoveryLayer`] and then
//! [`ValidationLayer`] before it reaches a handler.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use tonic::Status;
use tower::{Layer, Service};

use crate::validation::Validate;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Status>> + Send>>;

/// Turns a panic anywhere beneath it into `INTERNAL`
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryLayer;

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S, Req> Service<Req> for RecoveryService<S>
where
    S: Service<Req, Error = Status>,
    S::Future: Send + 'static,
    S::Response: 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = BoxFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(fut) => fut,
            Err(panic) => {
                let status = panic_status(panic.as_ref());
                return Box::pin(async move { Err(status) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(panic_status(panic.as_ref())),
            }
        })
    }
}

fn panic_status(panic: &(dyn std::any::Any + Send)) -> Status {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %detail, "Health handler panicked");
    Status::internal(format!("handler panicked: {detail}"))
}

/// Rejects requests failing [`Validate`] with `INVALID_ARGUMENT`
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationLayer;

impl<S> Layer<S> for ValidationLayer {
    type Service = ValidationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ValidationService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationService<S> {
    inner: S,
}

impl<S, Req> Service<Req> for ValidationService<S>
where
    S: Service<Req, Error = Status>,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Validate,
{
    type Response = S::Response;
    type Error = Status;
    type Future = BoxFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        if let Err(errors) = req.validate_all() {
            tracing::debug!(error = %errors, "Rejected invalid health request");
            return Box::pin(async move { Err(Status::from(errors)) });
        }
        Box::pin(self.inner.call(req))
    }
}
