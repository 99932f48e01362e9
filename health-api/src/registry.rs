//! Service registry
//!
//! One endpoint answers for any number of logical services. The registry maps
//! each service name to the provider responsible for it and forwards checks
//! unchanged. Unknown names fail with `NOT_FOUND`; there is no fallback
//! status.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

use crate::proto::{HealthCheckRequest, HealthCheckResponse, SERVICE_NAME};
use crate::service::HealthService;

/// Map of service name to health provider
///
/// Built before serving starts. Mutation needs `&mut self`, so a registry
/// shared behind `Arc` is read-only; wrap it in `tokio::sync::RwLock` when
/// providers come and go at runtime.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    providers: HashMap<String, Arc<dyn HealthService>>,
}

impl HealthRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `service`, returning the provider it replaced
    pub fn register(
        &mut self,
        service: impl Into<String>,
        provider: Arc<dyn HealthService>,
    ) -> Option<Arc<dyn HealthService>> {
        self.providers.insert(service.into(), provider)
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(
        mut self,
        service: impl Into<String>,
        provider: impl HealthService + 'static,
    ) -> Self {
        self.register(service, Arc::new(provider));
        self
    }

    /// Remove the provider for `service`
    pub fn deregister(&mut self, service: &str) -> Option<Arc<dyn HealthService>> {
        self.providers.remove(service)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.providers.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Registered service names, sorted
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("services", &self.services())
            .finish()
    }
}

impl<S: Into<String>> FromIterator<(S, Arc<dyn HealthService>)> for HealthRegistry {
    fn from_iter<I: IntoIterator<Item = (S, Arc<dyn HealthService>)>>(iter: I) -> Self {
        Self {
            providers: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[async_trait]
impl HealthService for HealthRegistry {
    async fn check(&self, request: HealthCheckRequest) -> Result<HealthCheckResponse, Status> {
        match self.providers.get(&request.service) {
            Some(provider) => provider.check(request).await,
            None => {
                tracing::debug!(service = %request.service, "No health provider registered");
                Err(Status::not_found(format!(
                    "not found a registered instance of {SERVICE_NAME} for {}",
                    request.service
                )))
            }
        }
    }
}
