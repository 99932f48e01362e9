//! Call interceptors
//!
//! An interceptor is a [`tower::Layer`] wrapped around the boxed unary call
//! service. [`Interceptor`] erases the layer type so callers can hand any
//! number of them to the client builder in order.
//!
//! Every client carries [`tracing_interceptor`] and [`logging_interceptor`];
//! user interceptors sit beneath them, nearest the transport.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tonic::{Request, Response, Status};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

use crate::proto::{HealthCheckRequest, HealthCheckResponse, CHECK_PATH};

/// Metadata key carrying the request ID
pub const REQUEST_ID: &str = "x-request-id";

/// Boxed unary `Check` call
pub type CheckService =
    BoxCloneSyncService<Request<HealthCheckRequest>, Response<HealthCheckResponse>, Status>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Status>> + Send>>;

/// A named, type-erased layer over [`CheckService`]
#[derive(Clone)]
pub struct Interceptor {
    name: Cow<'static, str>,
    wrap: Arc<dyn Fn(CheckService) -> CheckService + Send + Sync>,
}

impl Interceptor {
    /// Erase a tower layer
    pub fn new<L>(name: impl Into<Cow<'static, str>>, layer: L) -> Self
    where
        L: Layer<CheckService> + Send + Sync + 'static,
        L::Service: Service<
                Request<HealthCheckRequest>,
                Response = Response<HealthCheckResponse>,
                Error = Status,
            > + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Request<HealthCheckRequest>>>::Future: Send + 'static,
    {
        Self {
            name: name.into(),
            wrap: Arc::new(move |inner| BoxCloneSyncService::new(layer.layer(inner))),
        }
    }

    /// Interceptor from a request-rewriting function, in the style of tonic
    /// interceptors. Returning `Err` short-circuits the call.
    pub fn from_fn<F>(name: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(Request<HealthCheckRequest>) -> Result<Request<HealthCheckRequest>, Status>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, RequestFnLayer { f })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wrap `inner` with this interceptor
    pub fn wrap(&self, inner: CheckService) -> CheckService {
        (self.wrap)(inner)
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor").field("name", &self.name).finish()
    }
}

/// Tracing interceptor for `Check` calls
pub fn tracing_interceptor() -> Interceptor {
    Interceptor::new("tracing", TracingLayer::new(CHECK_PATH))
}

/// Logging interceptor
pub fn logging_interceptor() -> Interceptor {
    Interceptor::new("logging", LoggingLayer)
}

/// Adapter behind [`Interceptor::from_fn`]
#[derive(Clone)]
pub struct RequestFnLayer<F> {
    f: F,
}

impl<S, F: Clone> Layer<S> for RequestFnLayer<F> {
    type Service = RequestFnService<S, F>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestFnService {
            inner,
            f: self.f.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestFnService<S, F> {
    inner: S,
    f: F,
}

impl<S, F, Req, Res> Service<Request<Req>> for RequestFnService<S, F>
where
    S: Service<Request<Req>, Response = Response<Res>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    F: Fn(Request<Req>) -> Result<Request<Req>, Status>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = BoxFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Req>) -> Self::Future {
        match (self.f)(req) {
            Ok(req) => {
                let fut = self.inner.call(req);
                Box::pin(fut)
            }
            Err(status) => Box::pin(async move { Err(status) }),
        }
    }
}

/// Ensure the request carries an `x-request-id`, generating a UUID if absent
pub fn request_id_interceptor<T>(mut req: Request<T>) -> Result<Request<T>, Status> {
    let request_id = req
        .metadata()
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.metadata_mut().insert(
        REQUEST_ID,
        request_id
            .parse()
            .map_err(|_| Status::internal("Failed to parse request ID"))?,
    );

    Ok(req)
}

/// Client tracing layer
///
/// Opens a `grpc_request` span per call and propagates the request ID.
#[derive(Clone)]
pub struct TracingLayer {
    path: &'static str,
}

impl TracingLayer {
    pub fn new(path: &'static str) -> Self {
        Self { path }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            path: self.path,
        }
    }
}

/// Tracing service implementation
#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    path: &'static str,
}

impl<S, Req, Res> Service<Request<Req>> for TracingService<S>
where
    S: Service<Request<Req>, Response = Response<Res>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = BoxFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Req>) -> Self::Future {
        let req = match request_id_interceptor(req) {
            Ok(req) => req,
            Err(status) => return Box::pin(async move { Err(status) }),
        };

        let request_id = req
            .metadata()
            .get(REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let span = tracing::info_span!(
            "grpc_request",
            otel.kind = "client",
            rpc.system = "grpc",
            rpc.service = %extract_service_name(self.path),
            rpc.method = %extract_method_name(self.path),
            request_id = %request_id,
        );

        let fut = self.inner.call(req);
        Box::pin(fut.instrument(span))
    }
}

/// Logging layer
#[derive(Clone)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

/// Logging service implementation
#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S, Req, Res> Service<Request<Req>> for LoggingService<S>
where
    S: Service<Request<Req>, Response = Response<Res>, Error = Status> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = BoxFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Req>) -> Self::Future {
        let fut = self.inner.call(req);

        Box::pin(async move {
            let start = Instant::now();

            tracing::debug!("gRPC request started");

            let result = fut.await;

            let duration = start.elapsed();

            match &result {
                Ok(_) => {
                    tracing::info!(duration_ms = duration.as_millis(), "gRPC request completed");
                }
                Err(status) => {
                    tracing::warn!(
                        duration_ms = duration.as_millis(),
                        grpc.status_code = ?status.code(),
                        error.message = %status.message(),
                        "gRPC request failed"
                    );
                }
            }

            result
        })
    }
}

/// Extract service name from gRPC method path
///
/// gRPC method paths are in the format: /package.Service/Method
fn extract_service_name(path: &str) -> &str {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .and_then(|s| s.rsplit('.').next())
        .unwrap_or("unknown")
}

/// Extract method name from gRPC method path
fn extract_method_name(path: &str) -> &str {
    path.trim_start_matches('/')
        .split('/')
        .nth(1)
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ServingStatus;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Terminal service recording the request ID it saw
    fn recording(seen: Arc<Mutex<Vec<String>>>) -> CheckService {
        BoxCloneSyncService::new(tower::service_fn(move |req: Request<HealthCheckRequest>| {
            let seen = seen.clone();
            async move {
                let id = req
                    .metadata()
                    .get(REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push(id);
                Ok::<_, Status>(Response::new(HealthCheckResponse::with_status(
                    ServingStatus::Serving,
                )))
            }
        }))
    }

    #[test]
    fn test_extract_service_name() {
        assert_eq!(extract_service_name(CHECK_PATH), "Health");
        assert_eq!(
            extract_service_name("/mypackage.UserService/GetUser"),
            "UserService"
        );
        assert_eq!(extract_service_name("/Service/Method"), "Service");
        assert_eq!(extract_service_name("invalid"), "invalid");
        assert_eq!(extract_service_name(""), "");
    }

    #[test]
    fn test_extract_method_name() {
        assert_eq!(extract_method_name(CHECK_PATH), "Check");
        assert_eq!(extract_method_name("/Service/Method"), "Method");
        assert_eq!(extract_method_name("invalid"), "unknown");
    }

    #[test]
    fn test_request_id_preserved_when_present() {
        let mut req = Request::new(HealthCheckRequest::default());
        req.metadata_mut()
            .insert(REQUEST_ID, "abc-123".parse().unwrap());
        let req = request_id_interceptor(req).unwrap();
        assert_eq!(req.metadata().get(REQUEST_ID).unwrap(), "abc-123");
    }

    #[tokio::test]
    async fn test_tracing_interceptor_injects_request_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let svc = tracing_interceptor().wrap(recording(seen.clone()));

        svc.oneshot(Request::new(HealthCheckRequest::default()))
            .await
            .unwrap();

        let ids = seen.lock().unwrap();
        assert_eq!(ids.len(), 1);
        assert!(Uuid::parse_str(&ids[0]).is_ok());
    }

    #[tokio::test]
    async fn test_logging_interceptor_passes_errors_through() {
        let failing = BoxCloneSyncService::new(tower::service_fn(
            |_req: Request<HealthCheckRequest>| async {
                Err::<Response<HealthCheckResponse>, _>(Status::unavailable("down"))
            },
        ));
        let err = logging_interceptor()
            .wrap(failing)
            .oneshot(Request::new(HealthCheckRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert_eq!(err.message(), "down");
    }

    #[tokio::test]
    async fn test_fn_interceptor_can_short_circuit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let deny = Interceptor::from_fn("deny", |req: Request<HealthCheckRequest>| {
            if req.get_ref().service == "secret" {
                Err(Status::permission_denied("not for you"))
            } else {
                Ok(req)
            }
        });
        assert_eq!(deny.name(), "deny");
        let svc = deny.wrap(recording(seen.clone()));

        let err = svc
            .clone()
            .oneshot(Request::new(HealthCheckRequest::for_service("secret")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
        assert!(seen.lock().unwrap().is_empty());

        svc.oneshot(Request::new(HealthCheckRequest::for_service("public")))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
