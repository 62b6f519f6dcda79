//! Transport abstraction for delivery.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use farmsync_core::DeliveryTarget;
use farmsync_protocol::{ApplyRequest, ApplyResponse, SequenceId, TaskAck};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Sends apply requests to a target node.
///
/// Implementations must not retry on their own; the dispatcher owns retry
/// and backoff.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one batch and returns the per-task acks.
    async fn send(&self, target: &DeliveryTarget, request: &ApplyRequest)
        -> EngineResult<ApplyResponse>;
}

/// Scripted reply of a [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Ack every task.
    AckAll,
    /// Return this response.
    Respond(ApplyResponse),
    /// Fail with a retryable transport error.
    Fail(String),
}

/// A transport for tests that records requests and replays scripted
/// replies. When the script is empty every task is acked.
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    sent: Mutex<Vec<(DeliveryTarget, ApplyRequest)>>,
}

impl MockTransport {
    /// Creates a mock that acks everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the next request.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Queues `count` transport failures.
    pub fn fail_next(&self, count: usize) {
        let mut replies = self.replies.lock();
        for _ in 0..count {
            replies.push_back(MockReply::Fail("connection refused".into()));
        }
    }

    /// Requests received so far.
    pub fn sent(&self) -> Vec<(DeliveryTarget, ApplyRequest)> {
        self.sent.lock().clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        target: &DeliveryTarget,
        request: &ApplyRequest,
    ) -> EngineResult<ApplyResponse> {
        self.sent.lock().push((target.clone(), request.clone()));
        let reply = self.replies.lock().pop_front().unwrap_or(MockReply::AckAll);
        match reply {
            MockReply::AckAll => Ok(ApplyResponse {
                acks: request
                    .tasks
                    .iter()
                    .map(|t| TaskAck::ack(SequenceId(t.sequence_id)))
                    .collect(),
            }),
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(message) => Err(EngineError::transport_retryable(message)),
        }
    }
}
