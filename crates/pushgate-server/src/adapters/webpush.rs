//! Web Push, VAPID-signed, via the `web-push` crate.

use std::any::Any;

use async_trait::async_trait;
use pushgate_core::{FeedbackCollector, PushStatus, ServiceMessage};
use serde::Deserialize;
use tracing::{debug, warn};
use web_push::{
    ContentEncoding, SubscriptionInfo, SubscriptionKeys, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder,
};

use crate::adapter::{downcast, Adapter, Client};
use crate::error::DispatchError;

pub struct WebPushMessage {
    subscription: SubscriptionInfo,
    payload: Vec<u8>,
    ttl: Option<u32>,
    topic: Option<String>,
    token: String,
}

impl ServiceMessage for WebPushMessage {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Deserialize)]
struct RawKeys {
    p256dh: String,
    auth: String,
}

#[derive(Deserialize)]
struct RawSubscription {
    endpoint: String,
    keys: RawKeys,
}

#[derive(Deserialize, Default)]
struct RawHeaders {
    ttl: Option<u32>,
    topic: Option<String>,
}

#[derive(Deserialize)]
struct RawMessage {
    subscription: RawSubscription,
    payload: serde_json::Value,
    #[serde(default)]
    headers: RawHeaders,
    token: Option<String>,
}

fn parse(bytes: &[u8]) -> Result<WebPushMessage, DispatchError> {
    let raw: RawMessage =
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Conversion(e.to_string()))?;
    let token = raw.token.unwrap_or_else(|| raw.subscription.endpoint.clone());
    let subscription = SubscriptionInfo {
        endpoint: raw.subscription.endpoint,
        keys: SubscriptionKeys {
            p256dh: raw.subscription.keys.p256dh,
            auth: raw.subscription.keys.auth,
        },
    };
    let payload = serde_json::to_vec(&raw.payload).map_err(|e| DispatchError::Conversion(e.to_string()))?;
    Ok(WebPushMessage {
        subscription,
        payload,
        ttl: raw.headers.ttl,
        topic: raw.headers.topic,
        token,
    })
}

pub struct WebPushAdapter {
    vapid_public_key: String,
    vapid_private_key: String,
}

impl WebPushAdapter {
    pub fn new(vapid_public_key: String, vapid_private_key: String) -> Self {
        Self {
            vapid_public_key,
            vapid_private_key,
        }
    }
}

#[async_trait]
impl Adapter for WebPushAdapter {
    fn id(&self) -> &str {
        "webpush"
    }

    fn validate(&self, bytes: &[u8]) -> Result<(), DispatchError> {
        parse(bytes).map(|_| ())
    }

    fn convert(&self, bytes: &[u8]) -> Result<Box<dyn ServiceMessage>, DispatchError> {
        Ok(Box::new(parse(bytes)?))
    }

    async fn new_client(&self) -> Result<Client, DispatchError> {
        Ok(Client::Http(reqwest::Client::new()))
    }

    async fn push_message(
        &self,
        client: &Client,
        msg: &dyn ServiceMessage,
        feedback: &dyn FeedbackCollector,
    ) -> PushStatus {
        let msg = match downcast::<WebPushMessage>(msg) {
            Some(m) => m,
            None => return PushStatus::HardFail,
        };
        let _ = client;

        let sig_builder = match VapidSignatureBuilder::from_base64(
            &self.vapid_private_key,
            &msg.subscription,
        ) {
            Ok(b) => b,
            Err(e) => {
                warn!(service = "webpush", error = ?e, "invalid vapid key");
                feedback.count_push("webpush", false);
                return PushStatus::HardFail;
            }
        };
        let signature = match sig_builder.build() {
            Ok(s) => s,
            Err(e) => {
                warn!(service = "webpush", error = ?e, "failed to sign vapid claims");
                feedback.count_push("webpush", false);
                return PushStatus::HardFail;
            }
        };

        let mut builder = WebPushMessageBuilder::new(&msg.subscription);
        builder.set_payload(ContentEncoding::Aes128Gcm, &msg.payload);
        builder.set_vapid_signature(signature);
        if let Some(ttl) = msg.ttl {
            builder.set_ttl(ttl as u32);
        }
        if let Some(topic) = &msg.topic {
            builder.set_topic(topic.clone());
        }
        let message = match builder.build() {
            Ok(m) => m,
            Err(e) => {
                warn!(service = "webpush", error = ?e, "failed to build message");
                feedback.count_push("webpush", false);
                return PushStatus::HardFail;
            }
        };

        let wp_client = WebPushClient::new();
        let wp_client = match wp_client {
            Ok(c) => c,
            Err(e) => {
                warn!(service = "webpush", error = ?e, "failed to build web-push client");
                feedback.count_push("webpush", false);
                return PushStatus::HardFail;
            }
        };

        let result = wp_client.send(message).await;
        let status = match result {
            Ok(()) => PushStatus::Success,
            Err(WebPushError::ServerError { .. }) => PushStatus::TempFail,
            Err(WebPushError::EndpointNotValid) | Err(WebPushError::EndpointNotFound) => {
                feedback.token_invalid("webpush", &msg.token);
                PushStatus::HardFail
            }
            Err(WebPushError::InvalidRequest(_)) => PushStatus::HardFail,
            Err(e) => {
                warn!(service = "webpush", error = ?e, "push failed");
                PushStatus::HardFail
            }
        };
        debug!(service = "webpush", status = %status, "pushed");
        feedback.count_push("webpush", matches!(status, PushStatus::Success));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_token_to_endpoint() {
        let body = br#"{"subscription":{"endpoint":"https://push.example/abc","keys":{"p256dh":"p","auth":"a"}},"payload":{"body":"hi"},"headers":{}}"#;
        let msg = parse(body).unwrap();
        assert_eq!(msg.token, "https://push.example/abc");
    }
}
