//! In-memory feedback buffer drained by `POST /api/feedback`.

use parking_lot::Mutex;
use pushgate_core::{FeedbackCollector, FeedbackEvent, FeedbackReason};

#[derive(Default)]
pub struct FeedbackBuffer {
    events: Mutex<Vec<FeedbackEvent>>,
}

impl FeedbackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically empties the buffer and returns everything collected
    /// since the last drain.
    pub fn drain(&self) -> Vec<FeedbackEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl FeedbackCollector for FeedbackBuffer {
    fn token_invalid(&self, service: &str, token: &str) {
        self.events.lock().push(FeedbackEvent {
            service: service.to_string(),
            token: token.to_string(),
            replacement: None,
            reason: FeedbackReason::Invalid,
        });
    }

    fn replace_token(&self, service: &str, token: &str, replacement: &str) {
        self.events.lock().push(FeedbackEvent {
            service: service.to_string(),
            token: token.to_string(),
            replacement: Some(replacement.to_string()),
            reason: FeedbackReason::Replaced,
        });
    }

    fn count_push(&self, service: &str, success: bool) {
        crate::metrics::count_push(service, success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_and_resets() {
        let buf = FeedbackBuffer::new();
        buf.token_invalid("apns", "tok-1");
        buf.replace_token("fcm", "tok-2", "tok-3");

        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert!(buf.drain().is_empty());
    }
}
