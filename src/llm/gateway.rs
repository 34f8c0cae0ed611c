//! Gateway trait for streaming completions

use tokio_util::sync::CancellationToken;

use crate::llm::types::{ChatTurn, DeltaStream};

/// Trait for model gateways.
///
/// A gateway turns one request into a lazy, finite [`DeltaStream`]. Every
/// transport and provider fault is yielded as a typed failure delta. Retrying is
/// the caller's job.
pub trait ModelGateway: Send + Sync {
    /// Start a streaming completion over `history`.
    ///
    /// The request is sent when the stream is first polled. `cancel` is checked
    /// at every network await, and a cancelled request ends with a `Cancelled`
    /// failure delta.
    fn stream_completion(&self, history: Vec<ChatTurn>, cancel: CancellationToken) -> DeltaStream;

    /// Get the gateway name
    fn name(&self) -> &str;

    /// Get the model name
    fn model(&self) -> &str;

    /// Stop every request started by this gateway. Requests started afterwards
    /// end right away with a `Cancelled` delta.
    fn shutdown(&self);
}

/// Resolves once either token is cancelled
pub(crate) async fn either_cancelled(request: &CancellationToken, lifecycle: &CancellationToken) {
    tokio::select! {
        _ = request.cancelled() => {}
        _ = lifecycle.cancelled() => {}
    }
}
