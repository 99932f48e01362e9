//! Mountable `grpc.health.v1.Health` endpoint
//!
//! ```rust,no_run
//! use axum::Router;
//! use health_api::prelude::*;
//!
//! # async fn example() -> health_api::Result<()> {
//! let registry = HealthRegistry::new()
//!     .with("", ServingStatusProvider::new())
//!     .with(
//!         "payments",
//!         ServingStatusProvider::with_status(ServingStatus::NotServing),
//!     );
//!
//! let app = HealthServer::new(registry).mount(Router::new())?;
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Inbound calls pass through recovery, then validation, then the handler.
//! `Check` and `Watch` share one nested route group carrying the request
//! trace layer.

mod routes;
pub mod layers;
pub mod watch;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::routing::post;
use axum::Router;
use tonic::{Request, Response, Status};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub use layers::{RecoveryLayer, ValidationLayer};
pub use watch::{
    channel, outcomes, watch, WatchCall, WatchHandler, WatchOutcomes, WatchSender, WatchService,
    WatchStream,
};

use crate::error::{Error, Result};
use crate::interceptors::CheckService;
use crate::proto::{HealthCheckRequest, HealthCheckResponse, SERVICE_NAME, SERVICE_PATH};
use crate::service::HealthService;
use crate::validation::Validate;
use routes::Endpoint;

/// Health endpoint over a provider
///
/// Clones share the mounted flag, so the endpoint lands on at most one
/// router.
#[derive(Clone)]
pub struct HealthServer {
    provider: Arc<dyn HealthService>,
    mounted: Arc<AtomicBool>,
}

impl HealthServer {
    pub fn new(provider: impl HealthService + 'static) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<dyn HealthService>) -> Self {
        Self {
            provider,
            mounted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mount path, `/grpc.health.v1.Health/`
    pub fn path(&self) -> &'static str {
        SERVICE_PATH
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Layered `Check` service
    pub fn check_service(&self) -> CheckService {
        layered(CheckHandler::new(self.provider.clone()))
    }

    /// Layered `Watch` service
    pub fn watch_service(&self) -> WatchService {
        layered(WatchHandler::new(self.provider.clone()))
    }

    /// Add the endpoint's route group to `router`
    ///
    /// Fails with [`Error::AlreadyMounted`] on any call after the first,
    /// leaving `router` untouched.
    pub fn mount<S>(&self, router: Router<S>) -> Result<Router<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        if self.mounted.swap(true, Ordering::AcqRel) {
            tracing::warn!(path = SERVICE_PATH, "Health endpoint already mounted");
            return Err(Error::AlreadyMounted(SERVICE_PATH.to_string()));
        }

        let endpoint = Endpoint {
            check: self.check_service(),
            watch: self.watch_service(),
        };
        let group = Router::new()
            .route("/Check", post(routes::check))
            .route("/Watch", post(routes::watch))
            .layer(TraceLayer::new_for_http())
            .with_state(endpoint);

        tracing::info!(path = SERVICE_PATH, "Mounted health endpoint");
        Ok(router.nest(&format!("/{SERVICE_NAME}"), group))
    }
}

/// Wrap a handler in recovery, then validation
pub fn layered<S, Req>(handler: S) -> BoxCloneSyncService<Req, S::Response, Status>
where
    S: Service<Req, Error = Status> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Validate + Send + 'static,
{
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(RecoveryLayer)
            .layer(ValidationLayer)
            .service(handler),
    )
}

impl std::fmt::Debug for HealthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthServer")
            .field("path", &SERVICE_PATH)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

/// Innermost `Check` service
#[derive(Clone)]
pub struct CheckHandler {
    provider: Arc<dyn HealthService>,
}

impl CheckHandler {
    pub fn new(provider: Arc<dyn HealthService>) -> Self {
        Self { provider }
    }
}

impl Service<Request<HealthCheckRequest>> for CheckHandler {
    type Response = Response<HealthCheckResponse>;
    type Error = Status;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Status>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Status>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<HealthCheckRequest>) -> Self::Future {
        let provider = self.provider.clone();
        Box::pin(async move {
            let response = provider.check(request.into_inner()).await?;
            Ok(Response::new(response))
        })
    }
}
