//! The health provider capability
//!
//! [`HealthService`] answers "is service X healthy" for whatever it fronts.
//! The registry, the remote client and the fixtures below all implement it,
//! so any of them can be registered under a name or mounted as an endpoint.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

use crate::proto::{HealthCheckRequest, HealthCheckResponse, ServingStatus};

/// Answers health checks
///
/// If the requested service is unknown, the call fails with `NOT_FOUND`.
#[async_trait]
pub trait HealthService: Send + Sync {
    async fn check(&self, request: HealthCheckRequest) -> Result<HealthCheckResponse, Status>;
}

#[async_trait]
impl<T: HealthService + ?Sized> HealthService for Arc<T> {
    async fn check(&self, request: HealthCheckRequest) -> Result<HealthCheckResponse, Status> {
        (**self).check(request).await
    }
}

/// Runtime-mutable providers: writers take the write lock, checks share the
/// read lock.
#[async_trait]
impl<T: HealthService> HealthService for tokio::sync::RwLock<T> {
    async fn check(&self, request: HealthCheckRequest) -> Result<HealthCheckResponse, Status> {
        self.read().await.check(request).await
    }
}

/// No-op client returning an empty (UNKNOWN) response
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHealthClient;

#[async_trait]
impl HealthService for NopHealthClient {
    async fn check(&self, _request: HealthCheckRequest) -> Result<HealthCheckResponse, Status> {
        Ok(HealthCheckResponse::default())
    }
}

/// Provider reporting a status that can be flipped at runtime
///
/// Clones share the same status, so one handle can sit in a registry while
/// another is toggled by the owning subsystem.
#[derive(Debug, Clone)]
pub struct ServingStatusProvider {
    status: Arc<AtomicI32>,
}

impl ServingStatusProvider {
    /// Create a provider that starts out serving
    pub fn new() -> Self {
        Self::with_status(ServingStatus::Serving)
    }

    /// Create a provider with an initial status
    pub fn with_status(status: ServingStatus) -> Self {
        Self {
            status: Arc::new(AtomicI32::new(status as i32)),
        }
    }

    /// Set the reported status
    pub fn set_status(&self, status: ServingStatus) {
        let previous = self.status.swap(status as i32, Ordering::AcqRel);
        if previous != status as i32 {
            tracing::info!(status = status.as_str_name(), "Serving status changed");
        }
    }

    /// Shorthand for SERVING / NOT_SERVING
    pub fn set_serving(&self, serving: bool) {
        self.set_status(if serving {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        });
    }

    /// Current status
    pub fn status(&self) -> ServingStatus {
        ServingStatus::try_from(self.status.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Check if the service is serving
    pub fn is_serving(&self) -> bool {
        self.status() == ServingStatus::Serving
    }
}

impl Default for ServingStatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthService for ServingStatusProvider {
    async fn check(&self, _request: HealthCheckRequest) -> Result<HealthCheckResponse, Status> {
        Ok(HealthCheckResponse::with_status(self.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nop_client_reports_unknown() {
        let resp = NopHealthClient
            .check(HealthCheckRequest::for_service("anything"))
            .await
            .unwrap();
        assert_eq!(resp.status(), ServingStatus::Unknown);
    }

    #[tokio::test]
    async fn test_status_provider_shared_between_clones() {
        let provider = ServingStatusProvider::new();
        let registered = provider.clone();
        assert!(registered.is_serving());

        provider.set_serving(false);
        let resp = registered.check(HealthCheckRequest::default()).await.unwrap();
        assert_eq!(resp.status(), ServingStatus::NotServing);

        provider.set_status(ServingStatus::ServiceUnknown);
        assert_eq!(registered.status(), ServingStatus::ServiceUnknown);
    }

    #[tokio::test]
    async fn test_arc_dyn_delegates() {
        let provider: Arc<dyn HealthService> =
            Arc::new(ServingStatusProvider::with_status(ServingStatus::NotServing));
        let resp = provider.check(HealthCheckRequest::default()).await.unwrap();
        assert_eq!(resp.status(), ServingStatus::NotServing);
    }
}
