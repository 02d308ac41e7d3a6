//! SMTP email delivery via `lettre`. Squashes by recipient address,
//! re-encoding a combined digest when more than one message batches
//! together — mirroring the source system's second (email-specific)
//! digester.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use pushgate_core::{FeedbackCollector, PushStatus, ServiceMessage};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::adapter::{downcast, Adapter, Client};
use crate::error::DispatchError;

#[derive(Deserialize, Clone)]
struct RawAttachment {
    filename: String,
    #[serde(rename = "content-type")]
    content_type: String,
    content: String,
}

#[derive(Deserialize, Default, Clone)]
struct RawDigest {
    subject: Option<String>,
}

#[derive(Deserialize, Clone)]
struct RawMessage {
    subject: String,
    to: Vec<String>,
    from: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    html: String,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
    #[serde(default)]
    digest: RawDigest,
}

pub struct EmailMessage {
    raw: RawMessage,
    recipient: String,
}

impl ServiceMessage for EmailMessage {
    fn squash_key(&self) -> Option<&str> {
        Some(&self.recipient)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn parse(bytes: &[u8]) -> Result<EmailMessage, DispatchError> {
    let raw: RawMessage =
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Conversion(e.to_string()))?;
    if raw.to.len() != 1 {
        return Err(DispatchError::Conversion("exactly one `to` address is supported".into()));
    }
    if raw.from.is_empty() {
        return Err(DispatchError::Conversion("missing `from`".into()));
    }
    if raw.subject.is_empty() {
        return Err(DispatchError::Conversion("missing `subject`".into()));
    }
    let recipient = raw.to[0].clone();
    Ok(EmailMessage { raw, recipient })
}

fn render_body(msg: &RawMessage) -> MultiPart {
    let alt = if !msg.html.is_empty() {
        MultiPart::alternative()
            .singlepart(SinglePart::plain(msg.text.clone()))
            .singlepart(SinglePart::html(msg.html.clone()))
    } else {
        MultiPart::mixed().singlepart(SinglePart::plain(msg.text.clone()))
    };
    let mut mixed = MultiPart::mixed().multipart(alt);
    for att in &msg.attachments {
        if let Ok(content) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &att.content) {
            let content_type = att
                .content_type
                .parse()
                .unwrap_or_else(|_| "application/octet-stream".parse().unwrap());
            mixed = mixed.singlepart(Attachment::new(att.filename.clone()).body(content, content_type));
        }
    }
    mixed
}

fn render_message(msg: &RawMessage, recipient: &str, subject_override: Option<&str>) -> Result<Message, DispatchError> {
    let subject = subject_override.unwrap_or(&msg.subject);
    Message::builder()
        .from(msg.from.parse().map_err(|e| DispatchError::Conversion(format!("invalid `from`: {e}")))?)
        .to(recipient
            .parse()
            .map_err(|e| DispatchError::Conversion(format!("invalid `to`: {e}")))?)
        .subject(subject)
        .multipart(render_body(msg))
        .map_err(|e| DispatchError::Conversion(e.to_string()))
}

fn render_digest(msgs: &[&RawMessage], recipient: &str, subject_override: Option<&str>) -> Result<Message, DispatchError> {
    let first = msgs.first().ok_or_else(|| DispatchError::Conversion("empty digest".into()))?;
    let subject = subject_override
        .map(str::to_string)
        .unwrap_or_else(|| first.subject.clone());
    let mut iter = msgs.iter();
    let mut combined = MultiPart::mixed().multipart(render_body(iter.next().ok_or_else(|| {
        DispatchError::Conversion("empty digest".into())
    })?));
    for msg in iter {
        combined = combined.multipart(render_body(msg));
    }
    Message::builder()
        .from(first.from.parse().map_err(|e| DispatchError::Conversion(format!("invalid `from`: {e}")))?)
        .to(recipient
            .parse()
            .map_err(|e| DispatchError::Conversion(format!("invalid `to`: {e}")))?)
        .subject(subject)
        .multipart(combined)
        .map_err(|e| DispatchError::Conversion(e.to_string()))
}

pub struct EmailAdapterConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub tls_insecure: bool,
    pub plain_auth: bool,
}

pub struct EmailAdapter {
    config: EmailAdapterConfig,
}

impl EmailAdapter {
    pub fn new(config: EmailAdapterConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, DispatchError> {
        let mut builder = if self.config.tls {
            let mut tls_params = TlsParameters::builder(self.config.host.clone());
            if self.config.tls_insecure {
                tls_params = tls_params.dangerous_accept_invalid_certs(true);
            }
            let tls_params = tls_params.build().map_err(|e| DispatchError::ClientInit(e.to_string()))?;
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
                .map_err(|e| DispatchError::ClientInit(e.to_string()))?
                .tls(Tls::Required(tls_params))
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
        };
        builder = builder.port(self.config.port);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
            if self.config.plain_auth {
                builder = builder.authentication(vec![Mechanism::Plain]);
            }
        }
        Ok(builder.build())
    }

    async fn send(&self, client: &Client, message: Message, feedback: &dyn FeedbackCollector) -> PushStatus {
        let transport = match client {
            Client::Smtp(t) => t.clone(),
            Client::Http(_) => unreachable!("email adapter always builds an SMTP client"),
        };
        match transport.send(message).await {
            Ok(_) => {
                feedback.count_push("email", true);
                PushStatus::Success
            }
            Err(e) => {
                warn!(service = "email", error = %e, "send failed");
                feedback.count_push("email", false);
                if e.is_transient() {
                    PushStatus::TempFail
                } else {
                    PushStatus::HardFail
                }
            }
        }
    }
}

#[async_trait]
impl Adapter for EmailAdapter {
    fn id(&self) -> &str {
        "email"
    }

    fn validate(&self, bytes: &[u8]) -> Result<(), DispatchError> {
        parse(bytes).map(|_| ())
    }

    fn convert(&self, bytes: &[u8]) -> Result<Box<dyn ServiceMessage>, DispatchError> {
        Ok(Box::new(parse(bytes)?))
    }

    async fn new_client(&self) -> Result<Client, DispatchError> {
        Ok(Client::Smtp(Arc::new(self.transport()?)))
    }

    async fn push_message(
        &self,
        client: &Client,
        msg: &dyn ServiceMessage,
        feedback: &dyn FeedbackCollector,
    ) -> PushStatus {
        let msg = match downcast::<EmailMessage>(msg) {
            Some(m) => m,
            None => return PushStatus::HardFail,
        };
        let message = match render_message(&msg.raw, &msg.recipient, None) {
            Ok(m) => m,
            Err(e) => {
                warn!(service = "email", error = %e, "failed to render message");
                feedback.count_push("email", false);
                return PushStatus::HardFail;
            }
        };
        debug!(service = "email", recipient = %msg.recipient, "sending");
        self.send(client, message, feedback).await
    }

    async fn squash_and_push(
        &self,
        client: &Client,
        msgs: &[Box<dyn ServiceMessage>],
        feedback: &dyn FeedbackCollector,
    ) -> PushStatus {
        let mut typed = Vec::with_capacity(msgs.len());
        for m in msgs {
            match downcast::<EmailMessage>(m.as_ref()) {
                Some(e) => typed.push(e),
                None => return PushStatus::HardFail,
            }
        }
        let Some(first) = typed.first() else {
            return PushStatus::HardFail;
        };
        let subject_override = first.raw.digest.subject.as_deref();
        let raws: Vec<&RawMessage> = typed.iter().map(|e| &e.raw).collect();
        let message = match render_digest(&raws, &first.recipient, subject_override) {
            Ok(m) => m,
            Err(e) => {
                warn!(service = "email", error = %e, "failed to render digest");
                feedback.count_push("email", false);
                return PushStatus::HardFail;
            }
        };
        self.send(client, message, feedback).await
    }

    fn supports_squash(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_exactly_one_recipient() {
        let body = br#"{"subject":"s","to":["a@example.com","b@example.com"],"from":"f@example.com","text":"hi"}"#;
        assert!(parse(body).is_err());
    }

    #[test]
    fn parse_extracts_squash_key_as_recipient() {
        let body = br#"{"subject":"s","to":["a@example.com"],"from":"f@example.com","text":"hi"}"#;
        let msg = parse(body).unwrap();
        assert_eq!(msg.squash_key(), Some("a@example.com"));
    }
}
