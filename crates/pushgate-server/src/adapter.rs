//! Provider adapter contract: validate/convert/new_client/push_message/
//! squash_and_push, the capability set every provider implements.

use async_trait::async_trait;
use pushgate_core::{FeedbackCollector, PushStatus, ServiceMessage};

use crate::error::DispatchError;

/// Per-worker client handle. A sum type rather than a trait object because
/// the small, fixed set of providers share only two real client shapes:
/// an HTTP client (with or without a loaded TLS identity) and an SMTP
/// transport.
#[derive(Clone)]
pub enum Client {
    Http(reqwest::Client),
    Smtp(std::sync::Arc<lettre::AsyncSmtpTransport<lettre::Tokio1Executor>>),
}

impl Client {
    pub fn http(&self) -> &reqwest::Client {
        match self {
            Client::Http(c) => c,
            Client::Smtp(_) => panic!("adapter requested an HTTP client from an SMTP adapter"),
        }
    }
}

/// Provider-specific strategy for validating, converting, and pushing a
/// message. `squash_and_push` defaults to "unsupported" — only adapters
/// that override it can be paired with a squasher.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable service identifier used in queue names, metrics, feedback.
    fn id(&self) -> &str;

    /// Reject malformed admissions before enqueue.
    fn validate(&self, bytes: &[u8]) -> Result<(), DispatchError>;

    /// Parse raw bytes into a typed, validated message.
    fn convert(&self, bytes: &[u8]) -> Result<Box<dyn ServiceMessage>, DispatchError>;

    /// Build a per-worker client. Called once per worker at pump startup;
    /// any error aborts registration before any worker runs.
    async fn new_client(&self) -> Result<Client, DispatchError>;

    /// Perform one push. Must not block indefinitely — bounded by the
    /// client's own timeout.
    async fn push_message(
        &self,
        client: &Client,
        msg: &dyn ServiceMessage,
        feedback: &dyn FeedbackCollector,
    ) -> PushStatus;

    /// Perform one batched push for messages sharing a squash key.
    /// Adapters that don't support squashing never have a squasher
    /// constructed for them, so the default body is unreachable in
    /// practice; it exists so the trait stays object-safe without an
    /// associated "supports squashing" const.
    async fn squash_and_push(
        &self,
        _client: &Client,
        _msgs: &[Box<dyn ServiceMessage>],
        _feedback: &dyn FeedbackCollector,
    ) -> PushStatus {
        unimplemented!("{} does not support squashing", self.id())
    }

    /// Whether this adapter implements `squash_and_push`.
    fn supports_squash(&self) -> bool {
        false
    }
}

/// Helper for adapters to downcast their own typed messages back out of
/// the `dyn ServiceMessage` the pump hands them.
pub fn downcast<T: 'static>(msg: &dyn ServiceMessage) -> Option<&T> {
    msg.as_any().downcast_ref::<T>()
}
