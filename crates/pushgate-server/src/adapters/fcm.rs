//! Firebase Cloud Messaging, v1 HTTP API, authenticated via a service
//! account's OAuth2 JWT bearer flow.

use std::any::Any;
use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use pushgate_core::{FeedbackCollector, PushStatus, ServiceMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::adapter::{downcast, Adapter, Client};
use crate::error::DispatchError;

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const TOKEN_TTL: Duration = Duration::from_secs(3600);

pub struct FcmMessage {
    message: Value,
    token_hint: Option<String>,
}

impl ServiceMessage for FcmMessage {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn parse(bytes: &[u8]) -> Result<FcmMessage, DispatchError> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Conversion(e.to_string()))?;
    let message = root
        .get("message")
        .cloned()
        .ok_or_else(|| DispatchError::Conversion("missing `message`".into()))?;
    let has_target = ["token", "topic", "condition"]
        .iter()
        .any(|k| message.get(k).and_then(Value::as_str).is_some());
    if !has_target {
        return Err(DispatchError::Conversion(
            "message must set one of token/topic/condition".into(),
        ));
    }
    let token_hint = message.get("token").and_then(Value::as_str).map(str::to_string);
    Ok(FcmMessage { message, token_hint })
}

#[derive(Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    project_id: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Serialize)]
struct Claims {
    iss: String,
    scope: &'static str,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct CachedToken {
    access_token: String,
    expires_at: SystemTime,
}

pub struct FcmAdapter {
    account: ServiceAccount,
    token: Mutex<Option<CachedToken>>,
}

impl FcmAdapter {
    pub fn new(credentials_path: &str) -> Result<Self, DispatchError> {
        let raw = fs::read(credentials_path)
            .map_err(|e| DispatchError::ClientInit(format!("reading FCM credentials: {e}")))?;
        let account: ServiceAccount = serde_json::from_slice(&raw)
            .map_err(|e| DispatchError::ClientInit(format!("parsing FCM credentials: {e}")))?;
        Ok(Self {
            account,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self, http: &reqwest::Client) -> Result<String, DispatchError> {
        if let Some(cached) = self.token.lock().as_ref() {
            if cached.expires_at > SystemTime::now() + Duration::from_secs(60) {
                return Ok(cached.access_token.clone());
            }
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let claims = Claims {
            iss: self.account.client_email.clone(),
            scope: MESSAGING_SCOPE,
            aud: self.account.token_uri.clone(),
            iat: now,
            exp: now + TOKEN_TTL.as_secs(),
        };
        let key = EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())
            .map_err(|e| DispatchError::ClientInit(format!("invalid FCM private key: {e}")))?;
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| DispatchError::ClientInit(format!("signing FCM JWT: {e}")))?;

        let resp = http
            .post(&self.account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?;
        let body: TokenResponse = resp.error_for_status()?.json().await?;

        *self.token.lock() = Some(CachedToken {
            access_token: body.access_token.clone(),
            expires_at: SystemTime::now() + TOKEN_TTL,
        });
        Ok(body.access_token)
    }
}

#[async_trait]
impl Adapter for FcmAdapter {
    fn id(&self) -> &str {
        "fcm"
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
        let msg = match downcast::<FcmMessage>(msg) {
            Some(m) => m,
            None => return PushStatus::HardFail,
        };
        let http = client.http();

        let token = match self.access_token(http).await {
            Ok(t) => t,
            Err(e) => {
                error!(service = "fcm", error = %e, "failed to obtain access token");
                feedback.count_push("fcm", false);
                return PushStatus::TempFail;
            }
        };

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.account.project_id
        );
        let resp = match http
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "message": msg.message }))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(service = "fcm", error = %e, "posting failed");
                feedback.count_push("fcm", false);
                return PushStatus::TempFail;
            }
        };

        let status_code = resp.status();
        if status_code.is_success() {
            debug!(service = "fcm", "pushed");
            feedback.count_push("fcm", true);
            return PushStatus::Success;
        }

        #[derive(Deserialize, Default)]
        struct FcmError {
            error: Option<ErrorBody>,
        }
        #[derive(Deserialize)]
        struct ErrorBody {
            status: Option<String>,
        }
        let body: FcmError = resp.json().await.unwrap_or_default();
        let code = body.error.and_then(|e| e.status).unwrap_or_default();

        let status = if matches!(code.as_str(), "UNREGISTERED" | "INVALID_ARGUMENT") {
            if let Some(tok) = &msg.token_hint {
                feedback.token_invalid("fcm", tok);
            }
            PushStatus::HardFail
        } else if status_code.as_u16() == 429 || status_code.as_u16() >= 500 {
            PushStatus::TempFail
        } else {
            PushStatus::HardFail
        };
        feedback.count_push("fcm", false);
        status
    }
}
