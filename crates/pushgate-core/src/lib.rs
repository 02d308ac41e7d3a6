//! Shared domain types for the push-notification dispatcher.
//!
//! This crate has no knowledge of any specific queue backend or provider;
//! it defines the vocabulary that the queue, adapter, squasher and pump
//! crates all share: push outcomes, feedback events, and the small set of
//! error kinds common to every layer.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod logging;

/// Outcome of a single push attempt.
///
/// `Success` and `HardFail` both remove the message from the queue;
/// only `TempFail` causes a requeue + backoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Success,
    HardFail,
    TempFail,
}

impl PushStatus {
    pub fn is_retriable(self) -> bool {
        matches!(self, PushStatus::TempFail)
    }
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PushStatus::Success => "success",
            PushStatus::HardFail => "hard_fail",
            PushStatus::TempFail => "temp_fail",
        };
        f.write_str(s)
    }
}

/// Reason a feedback event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackReason {
    Invalid,
    Replaced,
}

/// A single invalid/replaced-token event, as reported through the feedback
/// HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub service: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "replacement_token")]
    pub replacement: Option<String>,
    pub reason: FeedbackReason,
}

/// Sink that adapters report dead tokens, replaced tokens and push
/// counters into. Implemented by the server's feedback buffer; adapters
/// only ever see this trait, never the buffer itself.
pub trait FeedbackCollector: Send + Sync {
    fn token_invalid(&self, service: &str, token: &str);
    fn replace_token(&self, service: &str, token: &str, replacement: &str);
    fn count_push(&self, service: &str, success: bool);
}

/// A no-op collector, useful for adapter unit tests that don't care about
/// feedback side effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFeedbackCollector;

impl FeedbackCollector for NullFeedbackCollector {
    fn token_invalid(&self, _service: &str, _token: &str) {}
    fn replace_token(&self, _service: &str, _token: &str, _replacement: &str) {}
    fn count_push(&self, _service: &str, _success: bool) {}
}

/// Anything an adapter can convert a raw admission payload into. The
/// squash key groups coalescable messages for the squasher; adapters that
/// never squash can return `None` unconditionally.
pub trait ServiceMessage: Any + Send + Sync {
    fn squash_key(&self) -> Option<&str> {
        None
    }

    /// Lets the owning adapter downcast a `dyn ServiceMessage` back into
    /// its concrete type. Implementations are always `{ self }`.
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_status_retriable_only_for_temp_fail() {
        assert!(PushStatus::TempFail.is_retriable());
        assert!(!PushStatus::Success.is_retriable());
        assert!(!PushStatus::HardFail.is_retriable());
    }

    #[test]
    fn feedback_event_serializes_without_replacement() {
        let ev = FeedbackEvent {
            service: "apns".into(),
            token: "T".into(),
            replacement: None,
            reason: FeedbackReason::Invalid,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("replacement_token"));
        assert!(json.contains("\"reason\":\"invalid\""));
    }
}
