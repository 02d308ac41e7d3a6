//! Generic HTTP webhook delivery. Never squashes, never retries 5xx —
//! the source system deliberately doesn't retry against a possibly
//! permanently broken endpoint.

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pushgate_core::{FeedbackCollector, PushStatus, ServiceMessage};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::adapter::{downcast, Adapter, Client};
use crate::error::DispatchError;

pub struct WebhookMessage {
    url: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    content_type: Option<&'static str>,
}

impl ServiceMessage for WebhookMessage {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Deserialize)]
struct RawMessage {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    body: Option<Value>,
    data: Option<Value>,
}

fn parse(bytes: &[u8]) -> Result<WebhookMessage, DispatchError> {
    let raw: RawMessage =
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Conversion(e.to_string()))?;
    if reqwest::Url::parse(&raw.url).is_err() {
        return Err(DispatchError::Conversion("invalid `url`".into()));
    }
    let (body, content_type) = match (raw.body, raw.data) {
        (Some(_), Some(_)) => {
            return Err(DispatchError::Conversion("exactly one of `body`/`data` must be set".into()))
        }
        (None, None) => return Err(DispatchError::Conversion("exactly one of `body`/`data` must be set".into())),
        (Some(body), None) => {
            let bytes = match body {
                Value::String(s) => s.into_bytes(),
                other => serde_json::to_vec(&other).map_err(|e| DispatchError::Conversion(e.to_string()))?,
            };
            (bytes, None)
        }
        (None, Some(data)) => {
            let bytes = serde_json::to_vec(&data).map_err(|e| DispatchError::Conversion(e.to_string()))?;
            (bytes, Some("application/json"))
        }
    };
    Ok(WebhookMessage {
        url: raw.url,
        headers: raw.headers,
        body,
        content_type,
    })
}

pub struct WebhookAdapter;

#[async_trait]
impl Adapter for WebhookAdapter {
    fn id(&self) -> &str {
        "webhook"
    }

    fn validate(&self, bytes: &[u8]) -> Result<(), DispatchError> {
        parse(bytes).map(|_| ())
    }

    fn convert(&self, bytes: &[u8]) -> Result<Box<dyn ServiceMessage>, DispatchError> {
        Ok(Box::new(parse(bytes)?))
    }

    async fn new_client(&self) -> Result<Client, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(30))
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
        let msg = match downcast::<WebhookMessage>(msg) {
            Some(m) => m,
            None => return PushStatus::HardFail,
        };

        let mut req = client.http().post(&msg.url).body(msg.body.clone());
        for (k, v) in &msg.headers {
            req = req.header(k, v);
        }
        if let Some(ct) = msg.content_type {
            req = req.header("content-type", ct);
        }

        let status = match req.send().await {
            Ok(resp) => {
                let code = resp.status();
                debug!(service = "webhook", status = %code, "posted");
                if code.is_success() {
                    PushStatus::Success
                } else if code.is_server_error() {
                    PushStatus::TempFail
                } else {
                    PushStatus::HardFail
                }
            }
            Err(e) => {
                warn!(service = "webhook", error = %e, "posting failed");
                PushStatus::HardFail
            }
        };
        feedback.count_push("webhook", matches!(status, PushStatus::Success));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_both_body_and_data() {
        let body = br#"{"url":"https://example.com/hook","body":"x","data":{"a":1}}"#;
        assert!(parse(body).is_err());
    }

    #[test]
    fn parse_sets_json_content_type_for_data() {
        let body = br#"{"url":"https://example.com/hook","data":{"a":1}}"#;
        let msg = parse(body).unwrap();
        assert_eq!(msg.content_type, Some("application/json"));
    }
}
