//! Server-streaming `Watch`
//!
//! A watch answers with the current status once and then completes. The
//! handler owns a [`WatchSender`]; dropping it closes the stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Status};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};

use crate::proto::{HealthCheckRequest, HealthCheckResponse};
use crate::service::HealthService;
use crate::validation::{Validate, ValidationErrors};

/// Sending half of a watch stream
#[derive(Debug)]
pub struct WatchSender {
    tx: mpsc::Sender<HealthCheckResponse>,
}

impl WatchSender {
    /// Send one message, waiting while the peer catches up
    pub async fn send(&self, message: HealthCheckResponse) -> Result<(), Status> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Status::cancelled("watch stream closed by peer"))
    }
}

/// Receiving half of a watch stream
pub type WatchStream = ReceiverStream<HealthCheckResponse>;

/// A bounded watch channel holding at most one undelivered message
pub fn channel() -> (WatchSender, WatchStream) {
    let (tx, rx) = mpsc::channel(1);
    (WatchSender { tx }, ReceiverStream::new(rx))
}

/// Check `request` once and send the result
///
/// On failure nothing is sent and the error becomes the stream's terminal
/// status. The stream closes when `sender` is dropped on return.
pub async fn watch<P>(
    provider: &P,
    request: HealthCheckRequest,
    sender: WatchSender,
) -> Result<(), Status>
where
    P: HealthService + ?Sized,
{
    let response = provider.check(request).await?;
    sender.send(response).await
}

/// One inbound `Watch` call as seen by the server layers
#[derive(Debug)]
pub struct WatchCall {
    pub request: Request<HealthCheckRequest>,
    pub sender: WatchSender,
}

impl Validate for WatchCall {
    fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.request.validate_all()
    }
}

/// Boxed `Watch` service
pub type WatchService = BoxCloneSyncService<WatchCall, (), Status>;

/// Messages of one watch followed by its terminal error, if any
pub type WatchOutcomes = Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send>>;

/// Run `request` through `service` on its own task and stream what it sends
///
/// The stream ends after the handler returns; a handler error is yielded
/// as the last item.
pub fn outcomes(service: WatchService, request: Request<HealthCheckRequest>) -> WatchOutcomes {
    let (sender, messages) = channel();
    let task = tokio::spawn(service.oneshot(WatchCall { request, sender }));

    Box::pin(stream::unfold(Some((messages, task)), |state| async move {
        let Some((mut messages, task)) = state else {
            return None;
        };
        if let Some(message) = messages.next().await {
            return Some((Ok(message), Some((messages, task))));
        }

        let result = match task.await {
            Ok(result) => result,
            Err(err) => Err(Status::internal(format!("watch handler failed: {err}"))),
        };
        match result {
            Ok(()) => None,
            Err(status) => {
                tracing::debug!(
                    grpc.status_code = ?status.code(),
                    error.message = %status.message(),
                    "Watch finished with error"
                );
                Some((Err(status), None))
            }
        }
    }))
}

/// Innermost `Watch` service
#[derive(Clone)]
pub struct WatchHandler {
    provider: Arc<dyn HealthService>,
}

impl WatchHandler {
    pub fn new(provider: Arc<dyn HealthService>) -> Self {
        Self { provider }
    }
}

impl Service<WatchCall> for WatchHandler {
    type Response = ();
    type Error = Status;
    type Future = Pin<Box<dyn Future<Output = Result<(), Status>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: WatchCall) -> Self::Future {
        let provider = self.provider.clone();
        Box::pin(async move {
            watch(provider.as_ref(), call.request.into_inner(), call.sender).await
        })
    }
}
