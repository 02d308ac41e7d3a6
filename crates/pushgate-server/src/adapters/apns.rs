//! Apple Push Notification service, via the HTTP/2 provider API with a
//! client TLS certificate.

use std::any::Any;

use async_trait::async_trait;
use pushgate_core::{FeedbackCollector, PushStatus, ServiceMessage};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::adapter::{downcast, Adapter, Client};
use crate::error::DispatchError;

pub struct ApnsMessage {
    token: String,
    topic: String,
    priority: Option<u8>,
    collapse_id: Option<String>,
    expiration: Option<i64>,
    payload: Value,
}

impl ServiceMessage for ApnsMessage {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Deserialize, Default)]
struct RawHeaders {
    #[serde(rename = "apns-topic")]
    topic: Option<String>,
    #[serde(rename = "apns-priority")]
    priority: Option<u8>,
    #[serde(rename = "apns-collapse-id")]
    collapse_id: Option<String>,
    #[serde(rename = "apns-expiration")]
    expiration: Option<i64>,
}

#[derive(Deserialize)]
struct RawMessage {
    token: String,
    #[serde(default)]
    headers: RawHeaders,
    payload: Value,
}

fn parse(bytes: &[u8]) -> Result<ApnsMessage, DispatchError> {
    let raw: RawMessage =
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Conversion(e.to_string()))?;
    if raw.token.is_empty() {
        return Err(DispatchError::Conversion("token required".into()));
    }
    let topic = raw
        .headers
        .topic
        .ok_or_else(|| DispatchError::Conversion("APNS requires a topic".into()))?;
    Ok(ApnsMessage {
        token: raw.token,
        topic,
        priority: raw.headers.priority,
        collapse_id: raw.headers.collapse_id,
        expiration: raw.headers.expiration,
        payload: raw.payload,
    })
}

/// Registered twice under distinct service ids (`apns`, `apns-sandbox`),
/// one per cert, matching the source system's two-registration pattern.
pub struct ApnsAdapter {
    id: &'static str,
    base_url: &'static str,
    identity_pem: Vec<u8>,
}

impl ApnsAdapter {
    pub fn production(identity_pem: Vec<u8>) -> Self {
        Self {
            id: "apns",
            base_url: "https://api.push.apple.com",
            identity_pem,
        }
    }

    pub fn sandbox(identity_pem: Vec<u8>) -> Self {
        Self {
            id: "apns-sandbox",
            base_url: "https://api.sandbox.push.apple.com",
            identity_pem,
        }
    }
}

#[async_trait]
impl Adapter for ApnsAdapter {
    fn id(&self) -> &str {
        self.id
    }

    fn validate(&self, bytes: &[u8]) -> Result<(), DispatchError> {
        parse(bytes).map(|_| ())
    }

    fn convert(&self, bytes: &[u8]) -> Result<Box<dyn ServiceMessage>, DispatchError> {
        Ok(Box::new(parse(bytes)?))
    }

    async fn new_client(&self) -> Result<Client, DispatchError> {
        let identity = reqwest::Identity::from_pem(&self.identity_pem)
            .map_err(|e| DispatchError::ClientInit(e.to_string()))?;
        let client = reqwest::Client::builder()
            .identity(identity)
            .http2_prior_knowledge()
            .build()
            .map_err(|e| DispatchError::ClientInit(e.to_string()))?;
        Ok(Client::Http(client))
    }

    async fn push_message(
        &self,
        client: &Client,
        msg: &dyn ServiceMessage,
        feedback: &dyn FeedbackCollector,
    ) -> PushStatus {
        let msg = match downcast::<ApnsMessage>(msg) {
            Some(m) => m,
            None => return PushStatus::HardFail,
        };

        let url = format!("{}/3/device/{}", self.base_url, msg.token);
        let mut req = client.http().post(&url).json(&msg.payload).header("apns-topic", &msg.topic);
        if let Some(p) = msg.priority {
            req = req.header("apns-priority", p.to_string());
        }
        if let Some(c) = &msg.collapse_id {
            req = req.header("apns-collapse-id", c.clone());
        }
        if let Some(e) = msg.expiration {
            req = req.header("apns-expiration", e.to_string());
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                error!(service = self.id, error = %e, "apns push failed");
                feedback.count_push(self.id, false);
                return PushStatus::TempFail;
            }
        };
        let status_code = resp.status();
        #[derive(Deserialize, Default)]
        struct ApnsResponse {
            reason: Option<String>,
        }
        let body: ApnsResponse = resp.json().await.unwrap_or_default();

        let status = if status_code.is_success() {
            PushStatus::Success
        } else if matches!(body.reason.as_deref(), Some("BadDeviceToken") | Some("Unregistered")) {
            feedback.token_invalid(self.id, &msg.token);
            PushStatus::HardFail
        } else if status_code.as_u16() >= 500 {
            PushStatus::TempFail
        } else {
            PushStatus::HardFail
        };
        debug!(service = self.id, reason = ?body.reason, status = %status, "apns pushed");
        feedback.count_push(self.id, matches!(status, PushStatus::Success));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_topic() {
        let body = br#"{"token":"abc","headers":{},"payload":{}}"#;
        assert!(parse(body).is_err());
    }

    #[test]
    fn parse_accepts_full_headers() {
        let body = br#"{"token":"abc","headers":{"apns-topic":"com.example.app","apns-priority":10,"apns-collapse-id":"c1","apns-expiration":123},"payload":{"aps":{}}}"#;
        let msg = parse(body).unwrap();
        assert_eq!(msg.topic, "com.example.app");
        assert_eq!(msg.priority, Some(10));
        assert_eq!(msg.collapse_id.as_deref(), Some("c1"));
        assert_eq!(msg.expiration, Some(123));
    }
}
